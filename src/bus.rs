//! Host bus seen by a DMA master
//!
//! A coprocessor that borrows the host's address space reaches it through
//! this trait. Addresses are 16-bit; what sits behind them is the host
//! machine's concern.

use crate::memory::AddressedMemory;

/// Value read from a bus nobody is driving
pub const OPEN_BUS: u8 = 0xFF;

pub trait HostBus {
    fn read_byte(&mut self, addr: u16) -> u8;
    fn write_byte(&mut self, addr: u16, value: u8);
}

impl HostBus for AddressedMemory {
    fn read_byte(&mut self, addr: u16) -> u8 {
        AddressedMemory::read_byte(self, addr as u32)
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        AddressedMemory::write_byte(self, addr as u32, value);
    }
}

/// A bus with nothing attached: reads float high, writes vanish
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenBus;

impl HostBus for OpenBus {
    fn read_byte(&mut self, _addr: u16) -> u8 {
        OPEN_BUS
    }

    fn write_byte(&mut self, _addr: u16, _value: u8) {}
}
