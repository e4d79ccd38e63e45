//! Trackball delta ports for Gridlee-style arcade boards
//!
//! Each axis reads as a 4-bit running total of movement with the direction in
//! bit 4. Movement of a single count is treated as jitter and ignored. In
//! cocktail mode the second player's trackball is routed to the ports.

use crate::snapshot::Reader;
use crate::Result;

/// Bit set in a port read when the last movement was negative
pub const SIGN_BIT: u8 = 0x10;

/// Per-axis delta tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalogPort {
    last_input: u8,
    last_output: u8,
}

impl AnalogPort {
    /// Fold a new raw position into the running total and return the port value
    pub fn read(&mut self, position: u8) -> u8 {
        // Positions wrap between 0x00 and 0xFF
        let mut delta = position as i32 - self.last_input as i32;
        if delta >= 0x80 {
            delta -= 0x100;
        }
        if delta <= -0x80 {
            delta += 0x100;
        }

        if (-1..=1).contains(&delta) {
            return self.last_output;
        }
        self.last_input = position;

        let sign = if delta < 0 { SIGN_BIT } else { 0 };
        self.last_output = self.last_output.wrapping_add(delta.unsigned_abs() as u8);
        (self.last_output & 0x0F) | sign
    }

    pub fn last_input(&self) -> u8 {
        self.last_input
    }

    pub fn last_output(&self) -> u8 {
        self.last_output
    }
}

/// Two trackballs (Y and X axis each) multiplexed onto two ports
#[derive(Debug, Clone, Default)]
pub struct Trackball {
    /// Raw positions: player 1 Y, X then player 2 Y, X
    positions: [u8; 4],
    ports: [AnalogPort; 2],
    cocktail_flip: bool,
}

impl Trackball {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update a raw position from the host input layer
    pub fn set_position(&mut self, player: usize, axis: usize, value: u8) {
        self.positions[(player & 1) * 2 + (axis & 1)] = value;
    }

    pub fn set_cocktail_flip(&mut self, flip: bool) {
        self.cocktail_flip = flip;
    }

    /// Read port `offset` (0 = Y, 1 = X)
    pub fn read(&mut self, offset: u32) -> u8 {
        let offset = (offset & 1) as usize;
        let position = self.positions[offset + 2 * self.cocktail_flip as usize];
        self.ports[offset].read(position)
    }

    pub fn port(&self, offset: usize) -> &AnalogPort {
        &self.ports[offset]
    }

    // ========== State Persistence ==========

    pub const SNAPSHOT_SIZE: usize = 5;

    pub fn to_bytes(&self) -> [u8; Self::SNAPSHOT_SIZE] {
        [
            self.ports[0].last_input,
            self.ports[1].last_input,
            self.ports[0].last_output,
            self.ports[1].last_output,
            self.cocktail_flip as u8,
        ]
    }

    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = Reader::new(buf);
        let inputs = [r.u8()?, r.u8()?];
        let outputs = [r.u8()?, r.u8()?];
        self.cocktail_flip = r.bool()?;
        for (port, (last_input, last_output)) in self.ports.iter_mut().zip(inputs.into_iter().zip(outputs)) {
            *port = AnalogPort { last_input, last_output };
        }
        Ok(r.position())
    }
}
