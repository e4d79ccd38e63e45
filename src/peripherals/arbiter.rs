//! Coprocessor bus arbiter (C64 CP/M Z80 cartridge)
//!
//! A secondary CPU on an expansion cartridge borrows the host's address space.
//! Exactly one of the two CPUs runs at any time: enabling the cartridge halts
//! the host and releases the coprocessor, disabling it does the reverse. The
//! first enable after a reset restarts the coprocessor at its reset vector.
//!
//! The coprocessor sees host memory shifted by 0x1000 (its address 0 is host
//! 0x1000), so the host's zero page and stack stay out of its way.
//!
//! Register: any write to the I/O-1 area sets enabled = !bit0.

use serde::Deserialize;

use crate::bus::{HostBus, OPEN_BUS};
use crate::cpu::{CpuControl, CpuId, LineId};
use crate::peripherals::interrupt::InterruptLines;
use crate::snapshot::Reader;
use crate::Result;

/// Offset added to coprocessor addresses to reach host memory
pub const DMA_WINDOW_BASE: u16 = 0x1000;

/// How much of the cartridge handshake is modelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationModel {
    /// Halt/run the two CPUs only
    #[default]
    Coarse,
    /// Also drive DMA on the host and BUSRQ/WAIT on the coprocessor,
    /// honouring the host's bus-available signal
    Precise,
}

#[derive(Debug, Clone)]
pub struct CoprocessorArbiter {
    primary: CpuId,
    secondary: CpuId,
    model: ArbitrationModel,
    reset_vector: u32,

    enabled: bool,
    reset_pending: bool,
    /// Last bus-available level seen from the host
    ba: bool,
    primary_halted: bool,
    secondary_halted: bool,
}

impl CoprocessorArbiter {
    pub fn new(primary: CpuId, secondary: CpuId, model: ArbitrationModel) -> Self {
        Self {
            primary,
            secondary,
            model,
            reset_vector: 0,
            enabled: false,
            reset_pending: true,
            ba: true,
            primary_halted: false,
            secondary_halted: true,
        }
    }

    pub fn with_reset_vector(mut self, address: u32) -> Self {
        self.reset_vector = address;
        self
    }

    /// Cartridge reset: coprocessor halted, restarted on the next enable
    pub fn on_reset(&mut self, lines: &mut InterruptLines, cpus: &mut dyn CpuControl) {
        self.enabled = false;
        self.reset_pending = true;
        self.update_signals(lines, cpus);
    }

    pub fn set_enabled(&mut self, enabled: bool, lines: &mut InterruptLines, cpus: &mut dyn CpuControl) {
        log::debug!("coprocessor {}", if enabled { "enabled" } else { "disabled" });
        self.enabled = enabled;
        self.update_signals(lines, cpus);
    }

    /// Write to the cartridge's I/O-1 area
    pub fn io1_write(&mut self, value: u8, lines: &mut InterruptLines, cpus: &mut dyn CpuControl) {
        self.set_enabled(value & 1 == 0, lines, cpus);
    }

    /// Host bus-available line. Signals are only recomputed when it changes.
    pub fn notify_bus_available_changed(&mut self, ba: bool, lines: &mut InterruptLines, cpus: &mut dyn CpuControl) {
        if self.ba != ba {
            self.ba = ba;
            self.update_signals(lines, cpus);
        }
    }

    fn update_signals(&mut self, lines: &mut InterruptLines, cpus: &mut dyn CpuControl) {
        if self.enabled {
            cpus.run(self.secondary);
            cpus.halt(self.primary);
            if self.reset_pending {
                cpus.reset(self.secondary);
                cpus.set_program_counter(self.secondary, self.reset_vector);
                self.reset_pending = false;
            }
        } else {
            cpus.halt(self.secondary);
            cpus.run(self.primary);
        }
        self.secondary_halted = !self.enabled;
        self.primary_halted = self.enabled;

        if self.model == ArbitrationModel::Precise {
            set_line(lines, cpus, self.primary, LineId::Dma, self.enabled);
            set_line(lines, cpus, self.secondary, LineId::BusRequest, self.enabled && !self.ba);
            set_line(lines, cpus, self.secondary, LineId::Wait, !self.enabled);
        }
    }

    /// Coprocessor read through the DMA window; open bus while disabled
    pub fn dma_read(&self, addr: u16, bus: &mut dyn HostBus) -> u8 {
        if self.enabled {
            bus.read_byte(addr.wrapping_add(DMA_WINDOW_BASE))
        } else {
            OPEN_BUS
        }
    }

    /// Coprocessor write through the DMA window; dropped while disabled
    pub fn dma_write(&self, addr: u16, value: u8, bus: &mut dyn HostBus) {
        if self.enabled {
            bus.write_byte(addr.wrapping_add(DMA_WINDOW_BASE), value);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending
    }

    pub fn primary_halted(&self) -> bool {
        self.primary_halted
    }

    pub fn secondary_halted(&self) -> bool {
        self.secondary_halted
    }

    pub fn bus_available(&self) -> bool {
        self.ba
    }

    pub fn model(&self) -> ArbitrationModel {
        self.model
    }

    // ========== State Persistence ==========

    pub const SNAPSHOT_SIZE: usize = 3;

    pub fn to_bytes(&self) -> [u8; Self::SNAPSHOT_SIZE] {
        [self.enabled as u8, self.reset_pending as u8, self.ba as u8]
    }

    /// Restore flags. CPU halt states are restored with the CPUs themselves.
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = Reader::new(buf);
        self.enabled = r.bool()?;
        self.reset_pending = r.bool()?;
        self.ba = r.bool()?;
        self.primary_halted = self.enabled;
        self.secondary_halted = !self.enabled;
        Ok(r.position())
    }
}

fn set_line(lines: &mut InterruptLines, cpus: &mut dyn CpuControl, cpu: CpuId, line: LineId, level: bool) {
    if level {
        lines.assert(cpu, line, cpus);
    } else {
        lines.clear(cpu, line, cpus);
    }
}
