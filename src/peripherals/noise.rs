//! MM5837 hardware random number source
//!
//! A free-running 17-bit polynomial counter clocked at 100 kHz. The CPU reads
//! whatever the counter holds at that moment, so the value is derived from the
//! reading CPU's cycle count (1.25 MHz CPU, 12.5 noise clocks per cycle).

const POLY17_BITS: u32 = 17;
const POLY17_SIZE: u32 = (1 << POLY17_BITS) - 1;
const POLY17_SHL: u32 = 7;
const POLY17_SHR: u32 = 10;
const POLY17_ADD: u32 = 0x18000;

#[derive(Clone)]
pub struct Poly17Noise {
    /// Byte visible to the CPU at each counter step
    rand17: Box<[u8]>,
}

impl Poly17Noise {
    pub fn new() -> Self {
        let mut rand17 = vec![0u8; (POLY17_SIZE + 1) as usize];
        let mut x: u32 = 0;
        for value in rand17.iter_mut().take(POLY17_SIZE as usize) {
            *value = (x >> 3) as u8;
            x = ((x << POLY17_SHL) + (x >> POLY17_SHR) + POLY17_ADD) & POLY17_SIZE;
        }
        Self {
            rand17: rand17.into_boxed_slice(),
        }
    }

    /// Counter value after `step` noise clocks
    pub fn at_step(&self, step: u32) -> u8 {
        self.rand17[(step & POLY17_SIZE) as usize]
    }

    /// Value read by a CPU that has executed `total_cycles` cycles
    pub fn read(&self, total_cycles: u64) -> u8 {
        // 12.5 = 8 + 4 + 0.5; the counter is 32 bits wide on the board side
        let cc = total_cycles as u32;
        let step = (cc << 3).wrapping_add(cc << 2).wrapping_add(cc >> 1);
        self.at_step(step)
    }
}

impl std::fmt::Debug for Poly17Noise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poly17Noise").finish_non_exhaustive()
    }
}

impl Default for Poly17Noise {
    fn default() -> Self {
        Self::new()
    }
}
