//! Device-owned addressed memory
//!
//! Every device that keeps internal RAM (display RAM, character generator
//! ROM images) owns one of these. Addresses wrap modulo the size, which is
//! always a power of two, so no access can fall outside the arena.

/// Byte arena with modulo-wrapped addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressedMemory {
    data: Vec<u8>,
    mask: u32,
}

impl AddressedMemory {
    /// Create a zero-filled memory of `size` bytes (power of two)
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "memory size {size:#X} is not a power of two");
        Self {
            data: vec![0; size],
            mask: (size - 1) as u32,
        }
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn read_byte(&self, addr: u32) -> u8 {
        self.data[(addr & self.mask) as usize]
    }

    #[inline]
    pub fn write_byte(&mut self, addr: u32, value: u8) {
        self.data[(addr & self.mask) as usize] = value;
    }

    /// Fill with a constant
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    /// Get raw contents (for persistence)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Load contents from a buffer, starting at 0. Extra bytes are ignored,
    /// missing bytes are left unchanged.
    pub fn load_data(&mut self, data: &[u8]) {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
    }
}
