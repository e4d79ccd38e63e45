//! Board Peripherals
//!
//! - Interrupt lines and raster-periodic interrupt generators
//! - HD61830 LCD timing controller
//! - Z80 coprocessor bus arbiter (C64 CP/M cartridge)
//! - Trackball delta ports and MM5837 noise source (Gridlee)
//!
//! Devices that keep timed state take the scheduler as an argument on every
//! call that may arm or cancel an event; none of them holds on to it.

pub mod arbiter;
pub mod interrupt;
pub mod lcd;
pub mod noise;
pub mod trackball;

pub use arbiter::{ArbitrationModel, CoprocessorArbiter};
pub use interrupt::{InterruptLines, IrqEvent, PeriodicInterrupts, ScanlineSchedule};
pub use lcd::{Hd61830, LcdEvent};
pub use noise::Poly17Noise;
pub use trackball::{AnalogPort, Trackball};
