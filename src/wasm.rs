//! WebAssembly bindings for the device core
//!
//! Exposes a machine to JavaScript. There is no instruction set in the
//! browser build, so the CPUs are state-only stand-ins; the page drives the
//! device registers directly and watches the interrupt lines.

use wasm_bindgen::prelude::*;
use web_sys::console;

use crate::config::MachineConfig;
use crate::cpu::{CpuId, CpuStates, LineId};
use crate::machine::Machine;
use crate::scheduler::Clock;
use crate::video::ScanlineSource;

fn warn(message: &str) {
    console::warn_1(&JsValue::from_str(message));
}

/// `log` facade backend writing to the browser console
struct ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::Level::Info
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("[{}] {}", record.target(), record.args());
        if record.level() <= log::Level::Warn {
            warn(&message);
        } else {
            console::log_1(&JsValue::from_str(&message));
        }
    }

    fn flush(&self) {}
}

static LOGGER: ConsoleLogger = ConsoleLogger;

fn init_console() {
    console_error_panic_hook::set_once();
    // Already installed if another machine was created first
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

/// WASM-friendly wrapper owning a machine and its CPU stand-ins. Only
/// current line levels are kept, so long sessions stay at a fixed size.
#[wasm_bindgen]
pub struct WasmMachine {
    inner: Machine,
    cpus: CpuStates,
}

impl WasmMachine {
    fn from_config(config: &MachineConfig) -> Result<WasmMachine, JsValue> {
        init_console();
        let mut inner = Machine::new(config).map_err(|e| JsValue::from_str(&e.to_string()))?;
        let mut cpus = CpuStates::new(config.cpus.len());
        inner.reset(&mut cpus);
        Ok(WasmMachine { inner, cpus })
    }
}

#[wasm_bindgen]
impl WasmMachine {
    /// Create a machine from a JSON description.
    #[wasm_bindgen(constructor)]
    pub fn new(config_json: &str) -> Result<WasmMachine, JsValue> {
        let config = MachineConfig::from_json(config_json).map_err(|e| JsValue::from_str(&e.to_string()))?;
        Self::from_config(&config)
    }

    /// Create the Gridlee board.
    #[wasm_bindgen]
    pub fn gridlee() -> Result<WasmMachine, JsValue> {
        Self::from_config(&MachineConfig::gridlee())
    }

    /// Create a single HD61830 panel.
    #[wasm_bindgen]
    pub fn lcd_panel() -> Result<WasmMachine, JsValue> {
        Self::from_config(&MachineConfig::lcd_panel())
    }

    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.inner.reset(&mut self.cpus);
    }

    /// Advance machine time by the given number of microseconds.
    #[wasm_bindgen]
    pub fn run_micros(&mut self, micros: u32) {
        let target = self.inner.now() + Clock::MHZ_1.cycles_to_ticks(micros as u64);
        self.inner.run_until(target, &mut self.cpus);
    }

    /// Machine time in microseconds.
    #[wasm_bindgen]
    pub fn now_micros(&self) -> f64 {
        Clock::MHZ_1.ticks_to_cycles(self.inner.now()) as f64
    }

    #[wasm_bindgen]
    pub fn lcd_read(&mut self, offset: u32) -> u8 {
        self.inner.lcd_read(offset)
    }

    #[wasm_bindgen]
    pub fn lcd_write(&mut self, offset: u32, value: u8) {
        self.inner.lcd_write(offset, value);
    }

    #[wasm_bindgen]
    pub fn io1_write(&mut self, value: u8) {
        self.inner.io1_write(value, &mut self.cpus);
    }

    /// Whether a CPU line is asserted. `line` uses the snapshot line codes
    /// (0 = IRQ, 1 = FIRQ, 2 = NMI).
    #[wasm_bindgen]
    pub fn is_asserted(&self, cpu: u8, line: u16) -> bool {
        LineId::from_code(line).is_some_and(|line| self.inner.is_asserted(CpuId(cpu), line))
    }

    #[wasm_bindgen]
    pub fn set_trackball(&mut self, player: usize, axis: usize, value: u8) {
        if let Some(trackball) = self.inner.trackball_mut() {
            trackball.set_position(player, axis, value);
        }
    }

    /// Render the LCD panel as RGBA8888 for an ImageData. Empty without an
    /// LCD.
    #[wasm_bindgen]
    pub fn render_rgba(&mut self) -> Vec<u8> {
        let Some(frame) = self.inner.render_frame() else {
            return Vec::new();
        };
        let mut rgba = Vec::with_capacity(frame.pixels().len() * 4);
        for &pixel in frame.pixels() {
            // Dark segments on a green-grey panel
            let [r, g, b] = if pixel != 0 { [0x20, 0x28, 0x20] } else { [0x9C, 0xAC, 0x8C] };
            rgba.extend_from_slice(&[r, g, b, 0xFF]);
        }
        rgba
    }

    #[wasm_bindgen]
    pub fn lcd_width(&self) -> i32 {
        self.inner.lcd().map_or(0, |lcd| lcd.dimensions().0 as i32)
    }

    #[wasm_bindgen]
    pub fn lcd_height(&self) -> i32 {
        self.inner.lcd().map_or(0, |lcd| lcd.dimensions().1 as i32)
    }

    /// Save machine state to a byte array.
    #[wasm_bindgen]
    pub fn save_state(&self) -> Vec<u8> {
        self.inner.save_state()
    }

    /// Load machine state from a byte array.
    /// Returns 0 on success, negative error code on failure.
    #[wasm_bindgen]
    pub fn load_state(&mut self, data: &[u8]) -> i32 {
        match self.inner.load_state(data) {
            Ok(()) => 0,
            Err(e) => {
                warn(&format!("[WASM] load_state failed: {e}"));
                e.code()
            }
        }
    }

    /// Dump diagnostic state for debugging.
    #[wasm_bindgen]
    pub fn debug_status(&self) -> String {
        let position = self
            .inner
            .position()
            .map(|p| format!("frame={} line={} hpos={}", p.frame, p.current_scanline, p.hpos))
            .unwrap_or_default();
        format!(
            "machine={} time={} pending={} coprocessor={} {}",
            self.inner.name(),
            self.inner.now(),
            self.inner.scheduler().pending_count(),
            self.inner.coprocessor_enabled(),
            position
        )
    }
}
