//! Machine description
//!
//! A board is described as data: its CPUs (by tag), its raster timing, the
//! periodic interrupts it derives from the beam, and which optional devices
//! sit on it. Descriptions are usually built in code (see the presets) or
//! loaded from JSON.

use serde::Deserialize;

use crate::cpu::LineId;
use crate::peripherals::arbiter::ArbitrationModel;
use crate::peripherals::interrupt::ScanlineSchedule;
use crate::Result;

/// Raw raster parameters (pixel clock in Hz, counts in pixels/lines)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScreenConfig {
    pub pixel_clock_hz: u64,
    pub htotal: u32,
    pub hblank_start: u32,
    pub vtotal: u32,
    pub vblank_start: u32,
}

/// Which scanlines a periodic interrupt targets
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Fixed { scanlines: Vec<u32> },
    Stepped { first: u32, step: u32, last: u32, restart: u32 },
}

impl From<&ScheduleConfig> for ScanlineSchedule {
    fn from(config: &ScheduleConfig) -> Self {
        match config {
            ScheduleConfig::Fixed { scanlines } => ScanlineSchedule::fixed(scanlines.clone()),
            ScheduleConfig::Stepped { first, step, last, restart } => ScanlineSchedule::Stepped {
                first: *first,
                step: *step,
                last: *last,
                restart: *restart,
            },
        }
    }
}

/// Assert `line` of `cpu` on each scheduled scanline, clear it at HBLANK
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeriodicIrqConfig {
    pub cpu: String,
    pub line: LineId,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LcdConfig {
    /// Panel size in pixels
    pub width: usize,
    pub height: usize,
    /// Controller clock; busy times are counted in these cycles
    pub clock_hz: u64,
}

impl Default for LcdConfig {
    fn default() -> Self {
        Self {
            width: 240,
            height: 64,
            clock_hz: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CoprocessorConfig {
    /// Host CPU, halted while the coprocessor runs
    pub primary: String,
    pub secondary: String,
    #[serde(default)]
    pub model: ArbitrationModel,
    #[serde(default)]
    pub reset_vector: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub name: String,
    /// CPU tags; a CPU's position in this list is its `CpuId`
    pub cpus: Vec<String>,
    pub screen: Option<ScreenConfig>,
    pub periodic_irqs: Vec<PeriodicIrqConfig>,
    pub lcd: Option<LcdConfig>,
    pub coprocessor: Option<CoprocessorConfig>,
    pub trackball: bool,
    pub noise: bool,
}

impl MachineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Gridlee (Videa, 1983): 6809 at 1.25 MHz, IRQ every 64 scanlines,
    /// FIRQ on scanline 92, trackball and MM5837 noise source
    pub fn gridlee() -> Self {
        Self {
            name: "gridlee".to_string(),
            cpus: vec!["maincpu".to_string()],
            // 20 MHz master clock / 4
            screen: Some(ScreenConfig {
                pixel_clock_hz: 5_000_000,
                htotal: 320,
                hblank_start: 256,
                vtotal: 264,
                vblank_start: 256,
            }),
            periodic_irqs: vec![
                PeriodicIrqConfig {
                    cpu: "maincpu".to_string(),
                    line: LineId::Irq,
                    schedule: ScheduleConfig::Stepped {
                        first: 0,
                        step: 64,
                        last: 256,
                        restart: 64,
                    },
                },
                PeriodicIrqConfig {
                    cpu: "maincpu".to_string(),
                    line: LineId::Firq,
                    schedule: ScheduleConfig::Fixed { scanlines: vec![92] },
                },
            ],
            lcd: None,
            coprocessor: None,
            trackball: true,
            noise: true,
        }
    }

    /// Commodore 64 with the CP/M Z80 cartridge
    pub fn c64_cpm() -> Self {
        Self {
            name: "c64_cpm".to_string(),
            cpus: vec!["maincpu".to_string(), "z80".to_string()],
            coprocessor: Some(CoprocessorConfig {
                primary: "maincpu".to_string(),
                secondary: "z80".to_string(),
                model: ArbitrationModel::Coarse,
                reset_vector: 0,
            }),
            ..Self::default()
        }
    }

    /// Single CPU driving an HD61830 graphics LCD
    pub fn lcd_panel() -> Self {
        Self {
            name: "lcd_panel".to_string(),
            cpus: vec!["maincpu".to_string()],
            lcd: Some(LcdConfig::default()),
            ..Self::default()
        }
    }
}
