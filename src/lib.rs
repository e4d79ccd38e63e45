//! Cycle-Scheduled Device Emulation Core
//!
//! Building blocks for emulating the non-CPU half of a machine: a monotonic
//! event timer, CPU interrupt lines, register-mapped peripherals and a bus
//! arbiter for a second CPU sharing the host's address space. Instruction
//! execution is left to the host through the [`CpuControl`] trait.
//!
//! # Architecture
//!
//! - `scheduler`: base clock and the event timer every device books time on
//! - `screen`: raster timing, beam position derived from machine time
//! - `peripherals`: interrupt lines, the HD61830 LCD controller, the Z80
//!   coprocessor arbiter and a few small board devices
//! - `machine`: owns the devices of one board and dispatches timer events
//!
//! # Time
//!
//! All times are u64 base ticks of a 7.68 GHz clock. Every device clock
//! (1 MHz LCD controller, 5 MHz pixel clock, 1.25 MHz CPU) divides it, so
//! conversions are exact.

pub mod bus;
pub mod config;
pub mod cpu;
pub mod machine;
pub mod memory;
pub mod peripherals;
pub mod scheduler;
pub mod screen;
mod snapshot;
pub mod video;

#[cfg(all(target_arch = "wasm32", feature = "wasm"))]
mod wasm;

#[cfg(all(target_arch = "wasm32", feature = "wasm"))]
pub use wasm::*;


pub use config::{CoprocessorConfig, LcdConfig, MachineConfig, PeriodicIrqConfig, ScreenConfig};
pub use cpu::{CpuControl, CpuId, CpuStates, LineId, RecordingCpus};
pub use machine::{Machine, MachineEvent};
pub use scheduler::{Clock, EventHandle, Scheduler, SCHED_BASE_CLOCK_RATE};
pub use screen::{ScanlinePosition, ScreenTiming};
pub use video::{Bitmap, ScanlineSource};

/// Errors reported by devices and the machine
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("recurring event period must be non-zero")]
    ZeroPeriod,
    #[error("clock rate {0} Hz does not divide the base clock")]
    InvalidClock(u64),
    #[error("invalid timing: {0}")]
    InvalidTiming(String),
    #[error("unknown cpu tag {0:?}")]
    UnknownCpu(String),
    #[error("snapshot buffer too small")]
    SnapshotTooSmall,
    #[error("not a machine snapshot")]
    BadMagic,
    #[error("snapshot version {0} is not supported")]
    VersionMismatch(u32),
    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(&'static str),
    #[error("bad machine config: {0}")]
    Config(#[from] serde_json::Error),
}

impl DeviceError {
    /// Negative status code for hosts that only pass integers across
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::ZeroPeriod => -1,
            DeviceError::InvalidClock(_) => -2,
            DeviceError::InvalidTiming(_) => -3,
            DeviceError::UnknownCpu(_) => -4,
            DeviceError::SnapshotTooSmall => -101,
            DeviceError::BadMagic => -102,
            DeviceError::VersionMismatch(_) => -103,
            DeviceError::CorruptSnapshot(_) => -104,
            DeviceError::Config(_) => -5,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_negative_and_distinct() {
        let errors = [
            DeviceError::ZeroPeriod,
            DeviceError::InvalidClock(3),
            DeviceError::InvalidTiming(String::new()),
            DeviceError::UnknownCpu("x".into()),
            DeviceError::SnapshotTooSmall,
            DeviceError::BadMagic,
            DeviceError::VersionMismatch(9),
            DeviceError::CorruptSnapshot("x"),
        ];
        let mut codes: Vec<i32> = errors.iter().map(DeviceError::code).collect();
        assert!(codes.iter().all(|&c| c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            DeviceError::UnknownCpu("z80".into()).to_string(),
            "unknown cpu tag \"z80\""
        );
        assert_eq!(DeviceError::VersionMismatch(2).to_string(), "snapshot version 2 is not supported");
    }
}
