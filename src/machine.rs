//! Machine Orchestrator
//!
//! Owns the devices of one board together with the scheduler they book time
//! on and the interrupt lines they drive. The host owns the CPUs and passes
//! them in as a [`CpuControl`] on every call that may touch them.
//!
//! Execution is timesliced: the CPUs run up to the next pending event, the
//! event is dispatched, and so on until the requested time. Devices never call
//! back into the machine; timer events are a tagged enum matched here.

use crate::bus::{HostBus, OPEN_BUS};
use crate::config::MachineConfig;
use crate::cpu::{CpuControl, CpuId, LineId};
use crate::peripherals::arbiter::CoprocessorArbiter;
use crate::peripherals::interrupt::{InterruptLines, IrqEvent, PeriodicInterrupts, ScanlineSchedule};
use crate::peripherals::lcd::{Hd61830, LcdEvent};
use crate::peripherals::noise::Poly17Noise;
use crate::peripherals::trackball::Trackball;
use crate::scheduler::{Clock, EventCode, Scheduler};
use crate::screen::{ScanlinePosition, ScreenTiming};
use crate::snapshot::Reader;
use crate::video::{Bitmap, ScanlineSource};
use crate::{DeviceError, Result};

/// Every timer event a machine can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineEvent {
    Lcd(LcdEvent),
    Irq(IrqEvent),
}

impl From<LcdEvent> for MachineEvent {
    fn from(event: LcdEvent) -> Self {
        MachineEvent::Lcd(event)
    }
}

impl From<IrqEvent> for MachineEvent {
    fn from(event: IrqEvent) -> Self {
        MachineEvent::Irq(event)
    }
}

impl EventCode for MachineEvent {
    fn code(&self) -> u32 {
        match self {
            MachineEvent::Lcd(LcdEvent::BusyClear) => 0x0100,
            MachineEvent::Irq(IrqEvent::Assert(index)) => 0x0200 | *index as u32,
            MachineEvent::Irq(IrqEvent::Clear(index)) => 0x0300 | *index as u32,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        let index = code as u8;
        match code >> 8 {
            0x01 if index == 0 => Some(MachineEvent::Lcd(LcdEvent::BusyClear)),
            0x02 => Some(MachineEvent::Irq(IrqEvent::Assert(index))),
            0x03 => Some(MachineEvent::Irq(IrqEvent::Clear(index))),
            _ => None,
        }
    }
}

/// Device presence bits in the snapshot header
mod layout {
    pub const PERIODIC: u8 = 1 << 0;
    pub const LCD: u8 = 1 << 1;
    pub const ARBITER: u8 = 1 << 2;
    pub const TRACKBALL: u8 = 1 << 3;
}

/// One board's worth of devices
#[derive(Debug)]
pub struct Machine {
    name: String,
    cpu_tags: Vec<String>,
    scheduler: Scheduler<MachineEvent>,
    lines: InterruptLines,
    periodic: Option<PeriodicInterrupts>,
    lcd: Option<Hd61830>,
    arbiter: Option<CoprocessorArbiter>,
    trackball: Option<Trackball>,
    noise: Option<Poly17Noise>,
}

fn resolve_cpu(tags: &[String], tag: &str) -> Result<CpuId> {
    tags.iter()
        .position(|t| t == tag)
        .map(|index| CpuId(index as u8))
        .ok_or_else(|| DeviceError::UnknownCpu(tag.to_string()))
}

impl Machine {
    /// Build a machine from its description. Periodic interrupts are armed
    /// immediately; call [`Machine::reset`] once the CPUs exist.
    pub fn new(config: &MachineConfig) -> Result<Self> {
        if config.cpus.len() > u8::MAX as usize {
            return Err(DeviceError::InvalidTiming(format!("{} cpus", config.cpus.len())));
        }
        let mut scheduler = Scheduler::new();

        let screen = config
            .screen
            .map(|s| ScreenTiming::new(s.pixel_clock_hz, s.htotal, s.hblank_start, s.vtotal, s.vblank_start))
            .transpose()?;
        let mut periodic = screen.map(PeriodicInterrupts::new);

        for irq in &config.periodic_irqs {
            let cpu = resolve_cpu(&config.cpus, &irq.cpu)?;
            let Some(periodic) = periodic.as_mut() else {
                return Err(DeviceError::InvalidTiming(
                    "periodic interrupts need a screen".to_string(),
                ));
            };
            periodic.periodic_assert_then_clear_on_hblank(
                cpu,
                irq.line,
                ScanlineSchedule::from(&irq.schedule),
                &mut scheduler,
            )?;
        }

        let lcd = config
            .lcd
            .map(|lcd| Clock::new(lcd.clock_hz).map(|clock| Hd61830::with_clock(clock, lcd.width, lcd.height)))
            .transpose()?;

        let arbiter = match &config.coprocessor {
            Some(cop) => Some(
                CoprocessorArbiter::new(
                    resolve_cpu(&config.cpus, &cop.primary)?,
                    resolve_cpu(&config.cpus, &cop.secondary)?,
                    cop.model,
                )
                .with_reset_vector(cop.reset_vector),
            ),
            None => None,
        };

        log::info!(
            "machine '{}': {} cpus, {} periodic interrupts, lcd={} coprocessor={}",
            config.name,
            config.cpus.len(),
            config.periodic_irqs.len(),
            lcd.is_some(),
            arbiter.is_some()
        );

        Ok(Self {
            name: config.name.clone(),
            cpu_tags: config.cpus.clone(),
            scheduler,
            lines: InterruptLines::new(),
            periodic,
            lcd,
            arbiter,
            trackball: config.trackball.then(Trackball::new),
            noise: config.noise.then(Poly17Noise::new),
        })
    }

    /// Machine reset: clear every line, restart the periodic interrupts from
    /// the current frame, reset devices. Time keeps running.
    pub fn reset(&mut self, cpus: &mut dyn CpuControl) {
        self.lines.reset(cpus);
        if let Some(periodic) = self.periodic.as_mut() {
            periodic.restart(&mut self.scheduler);
        }
        if let Some(lcd) = self.lcd.as_mut() {
            lcd.reset(&mut self.scheduler);
        }
        if let Some(arbiter) = self.arbiter.as_mut() {
            arbiter.on_reset(&mut self.lines, cpus);
        }
    }

    /// Run the CPUs and devices up to `target` (base ticks)
    pub fn run_until(&mut self, target: u64, cpus: &mut dyn CpuControl) {
        loop {
            let slice_end = self
                .scheduler
                .next_fire_time()
                .map_or(target, |time| time.min(target));
            cpus.execute_until(slice_end);
            while let Some(fired) = self.scheduler.next_due(slice_end) {
                self.dispatch(fired.event, cpus);
            }
            self.scheduler.settle(slice_end);
            if slice_end >= target {
                break;
            }
        }
    }

    fn dispatch(&mut self, event: MachineEvent, cpus: &mut dyn CpuControl) {
        match event {
            MachineEvent::Lcd(LcdEvent::BusyClear) => {
                if let Some(lcd) = self.lcd.as_mut() {
                    lcd.busy_timer_expired();
                }
            }
            MachineEvent::Irq(irq) => {
                if let Some(periodic) = self.periodic.as_mut() {
                    periodic.handle(irq, &mut self.scheduler, &mut self.lines, cpus);
                }
            }
        }
    }

    // ========== Queries ==========

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cpu_id(&self, tag: &str) -> Option<CpuId> {
        resolve_cpu(&self.cpu_tags, tag).ok()
    }

    /// Current machine time in base ticks
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    pub fn scheduler(&self) -> &Scheduler<MachineEvent> {
        &self.scheduler
    }

    pub fn screen(&self) -> Option<&ScreenTiming> {
        self.periodic.as_ref().map(PeriodicInterrupts::screen)
    }

    /// Beam position now
    pub fn position(&self) -> Option<ScanlinePosition> {
        self.screen().map(|screen| screen.position(self.now()))
    }

    /// Base ticks until the beam next reaches (scanline, hpos)
    pub fn time_until(&self, scanline: u32, hpos: u32) -> Option<u64> {
        self.screen().map(|screen| screen.time_until_pos(self.now(), scanline, hpos))
    }

    pub fn is_asserted(&self, cpu: CpuId, line: LineId) -> bool {
        self.lines.is_asserted(cpu, line)
    }

    /// Drive a line from outside the machine's own devices
    pub fn set_line(&mut self, cpu: CpuId, line: LineId, asserted: bool, cpus: &mut dyn CpuControl) {
        if asserted {
            self.lines.assert(cpu, line, cpus);
        } else {
            self.lines.clear(cpu, line, cpus);
        }
    }

    pub fn lcd(&self) -> Option<&Hd61830> {
        self.lcd.as_ref()
    }

    pub fn lcd_mut(&mut self) -> Option<&mut Hd61830> {
        self.lcd.as_mut()
    }

    pub fn arbiter(&self) -> Option<&CoprocessorArbiter> {
        self.arbiter.as_ref()
    }

    pub fn trackball_mut(&mut self) -> Option<&mut Trackball> {
        self.trackball.as_mut()
    }

    // ========== Register entry points ==========

    /// LCD controller register read (open bus without an LCD)
    pub fn lcd_read(&mut self, offset: u32) -> u8 {
        self.lcd.as_mut().map_or(OPEN_BUS, |lcd| lcd.read(offset))
    }

    pub fn lcd_write(&mut self, offset: u32, value: u8) {
        if let Some(lcd) = self.lcd.as_mut() {
            lcd.write(offset, value, &mut self.scheduler);
        }
    }

    /// Render the LCD panel and advance its blink phase
    pub fn render_frame(&mut self) -> Option<Bitmap> {
        self.lcd.as_mut().map(|lcd| lcd.render_frame())
    }

    /// Coprocessor cartridge I/O-1 write
    pub fn io1_write(&mut self, value: u8, cpus: &mut dyn CpuControl) {
        if let Some(arbiter) = self.arbiter.as_mut() {
            arbiter.io1_write(value, &mut self.lines, cpus);
        }
    }

    /// Host bus-available level, sampled on every host bus cycle
    pub fn notify_bus_available(&mut self, ba: bool, cpus: &mut dyn CpuControl) {
        if let Some(arbiter) = self.arbiter.as_mut() {
            arbiter.notify_bus_available_changed(ba, &mut self.lines, cpus);
        }
    }

    pub fn coprocessor_enabled(&self) -> bool {
        self.arbiter.as_ref().is_some_and(CoprocessorArbiter::is_enabled)
    }

    /// Coprocessor memory read through the DMA window
    pub fn dma_read(&self, addr: u16, bus: &mut dyn HostBus) -> u8 {
        self.arbiter.as_ref().map_or(OPEN_BUS, |arbiter| arbiter.dma_read(addr, bus))
    }

    pub fn dma_write(&self, addr: u16, value: u8, bus: &mut dyn HostBus) {
        if let Some(arbiter) = self.arbiter.as_ref() {
            arbiter.dma_write(addr, value, bus);
        }
    }

    /// Trackball port read (0 = Y, 1 = X)
    pub fn trackball_read(&mut self, offset: u32) -> u8 {
        self.trackball.as_mut().map_or(OPEN_BUS, |tb| tb.read(offset))
    }

    /// Hardware random number as seen by `cpu` right now
    pub fn random_read(&self, cpu: CpuId, cpus: &dyn CpuControl) -> u8 {
        self.noise
            .as_ref()
            .map_or(OPEN_BUS, |noise| noise.read(cpus.total_cycles(cpu)))
    }

    // ========== State Persistence ==========

    /// State format version
    const STATE_VERSION: u32 = 1;
    /// Magic bytes for state identification
    const STATE_MAGIC: [u8; 4] = *b"EMDV";
    /// Header: magic(4) + version(4) + layout(1) + data_len(4)
    const STATE_HEADER_SIZE: usize = 13;

    fn layout(&self) -> u8 {
        let mut bits = 0;
        if self.periodic.is_some() {
            bits |= layout::PERIODIC;
        }
        if self.lcd.is_some() {
            bits |= layout::LCD;
        }
        if self.arbiter.is_some() {
            bits |= layout::ARBITER;
        }
        if self.trackball.is_some() {
            bits |= layout::TRACKBALL;
        }
        bits
    }

    /// Serialize every persisted field of the machine. CPU state is the
    /// host's to save.
    pub fn save_state(&self) -> Vec<u8> {
        let mut body = self.scheduler.to_bytes();
        body.extend_from_slice(&self.lines.to_bytes());
        if let Some(periodic) = &self.periodic {
            body.extend_from_slice(&periodic.to_bytes());
        }
        if let Some(lcd) = &self.lcd {
            body.extend_from_slice(&lcd.to_bytes());
        }
        if let Some(arbiter) = &self.arbiter {
            body.extend_from_slice(&arbiter.to_bytes());
        }
        if let Some(trackball) = &self.trackball {
            body.extend_from_slice(&trackball.to_bytes());
        }

        let mut buf = Vec::with_capacity(Self::STATE_HEADER_SIZE + body.len());
        buf.extend_from_slice(&Self::STATE_MAGIC);
        buf.extend_from_slice(&Self::STATE_VERSION.to_le_bytes());
        buf.push(self.layout());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        log::debug!("state saved: {} bytes", buf.len());
        buf
    }

    /// Restore a snapshot taken from a machine with the same configuration.
    /// Nothing is changed unless the whole snapshot is valid.
    pub fn load_state(&mut self, buf: &[u8]) -> Result<()> {
        let mut r = Reader::new(buf);
        if r.bytes(4)? != &Self::STATE_MAGIC[..] {
            return Err(DeviceError::BadMagic);
        }
        let version = r.u32()?;
        if version != Self::STATE_VERSION {
            return Err(DeviceError::VersionMismatch(version));
        }
        if r.u8()? != self.layout() {
            return Err(DeviceError::CorruptSnapshot("device layout"));
        }
        let data_len = r.u32()? as usize;
        let body = r.bytes(data_len)?;

        // Decode into copies first so a bad snapshot leaves the machine as is
        let mut pos = 0;
        let mut scheduler = self.scheduler.clone();
        pos += scheduler.from_bytes(&body[pos..])?;
        let mut lines = self.lines.clone();
        pos += lines.from_bytes(&body[pos..])?;
        let mut periodic = self.periodic.clone();
        if let Some(periodic) = periodic.as_mut() {
            pos += periodic.from_bytes(&body[pos..])?;
        }
        let lcd_start = pos;
        if self.lcd.is_some() {
            pos += Hd61830::new(0, 0).from_bytes(&body[pos..])?;
        }
        let lcd_bytes = &body[lcd_start..pos];
        let mut arbiter = self.arbiter.clone();
        if let Some(arbiter) = arbiter.as_mut() {
            pos += arbiter.from_bytes(&body[pos..])?;
        }
        let mut trackball = self.trackball.clone();
        if let Some(trackball) = trackball.as_mut() {
            pos += trackball.from_bytes(&body[pos..])?;
        }
        if pos != body.len() {
            return Err(DeviceError::CorruptSnapshot("trailing bytes"));
        }

        if let Some(lcd) = self.lcd.as_mut() {
            lcd.from_bytes(lcd_bytes)?;
        }
        self.scheduler = scheduler;
        self.lines = lines;
        self.periodic = periodic;
        self.arbiter = arbiter;
        self.trackball = trackball;
        log::debug!("state loaded: {} bytes", buf.len());
        Ok(())
    }
}
