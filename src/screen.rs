//! Raster screen timing
//!
//! Beam position is never stored: it is derived from machine time and the
//! timing constants. Frame 0 starts at time 0 with the beam at (0, 0); each
//! scanline is `htotal` pixel clocks long and horizontal blanking starts at
//! `hblank_start`.

use crate::scheduler::Clock;
use crate::{DeviceError, Result};

/// Beam position at some instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanlinePosition {
    pub current_scanline: u32,
    pub total_scanlines: u32,
    pub hblank_start: u32,
    pub vblank_start: u32,
    /// Pixel clock within the current scanline
    pub hpos: u32,
    pub frame: u64,
}

impl ScanlinePosition {
    pub fn in_hblank(&self) -> bool {
        self.hpos >= self.hblank_start
    }

    pub fn in_vblank(&self) -> bool {
        self.current_scanline >= self.vblank_start
    }
}

/// Raw screen parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenTiming {
    pixel_clock: Clock,
    htotal: u32,
    hblank_start: u32,
    vtotal: u32,
    vblank_start: u32,
}

impl ScreenTiming {
    pub fn new(pixel_clock_hz: u64, htotal: u32, hblank_start: u32, vtotal: u32, vblank_start: u32) -> Result<Self> {
        let pixel_clock = Clock::new(pixel_clock_hz)?;
        if htotal == 0 || vtotal == 0 || hblank_start > htotal || vblank_start > vtotal {
            return Err(DeviceError::InvalidTiming(format!(
                "htotal={htotal} hbstart={hblank_start} vtotal={vtotal} vbstart={vblank_start}"
            )));
        }
        Ok(Self {
            pixel_clock,
            htotal,
            hblank_start,
            vtotal,
            vblank_start,
        })
    }

    pub fn pixel_clock(&self) -> Clock {
        self.pixel_clock
    }

    pub fn total_scanlines(&self) -> u32 {
        self.vtotal
    }

    pub fn htotal(&self) -> u32 {
        self.htotal
    }

    pub fn hblank_start(&self) -> u32 {
        self.hblank_start
    }

    /// Base ticks per scanline
    pub fn line_ticks(&self) -> u64 {
        self.pixel_clock.cycles_to_ticks(self.htotal as u64)
    }

    /// Base ticks per frame
    pub fn frame_ticks(&self) -> u64 {
        self.line_ticks() * self.vtotal as u64
    }

    /// Offset of (scanline, hpos) from the start of a frame
    fn offset_of(&self, scanline: u32, hpos: u32) -> u64 {
        (scanline % self.vtotal) as u64 * self.line_ticks()
            + self.pixel_clock.cycles_to_ticks((hpos % self.htotal) as u64)
    }

    /// Beam position at `time`
    pub fn position(&self, time: u64) -> ScanlinePosition {
        let frame_ticks = self.frame_ticks();
        let in_frame = time % frame_ticks;
        let line_ticks = self.line_ticks();
        ScanlinePosition {
            current_scanline: (in_frame / line_ticks) as u32,
            total_scanlines: self.vtotal,
            hblank_start: self.hblank_start,
            vblank_start: self.vblank_start,
            hpos: self.pixel_clock.ticks_to_cycles(in_frame % line_ticks) as u32,
            frame: time / frame_ticks,
        }
    }

    /// First time at or after `now` when the beam is at (scanline, hpos)
    pub fn time_at_or_after(&self, now: u64, scanline: u32, hpos: u32) -> u64 {
        let frame_ticks = self.frame_ticks();
        let frame_start = now - now % frame_ticks;
        let target = frame_start + self.offset_of(scanline, hpos);
        if target >= now {
            target
        } else {
            target + frame_ticks
        }
    }

    /// First time strictly after `now` when the beam is at (scanline, hpos)
    pub fn next_time_at(&self, now: u64, scanline: u32, hpos: u32) -> u64 {
        self.time_at_or_after(now + 1, scanline, hpos)
    }

    /// Base ticks from `now` until the beam next reaches (scanline, hpos)
    pub fn time_until_pos(&self, now: u64, scanline: u32, hpos: u32) -> u64 {
        self.next_time_at(now, scanline, hpos) - now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1 MHz pixel clock, 10 pixels per line, blank from 8, 262 lines
    fn timing() -> ScreenTiming {
        ScreenTiming::new(1_000_000, 10, 8, 262, 240).unwrap()
    }

    const PIXEL: u64 = 7680;

    #[test]
    fn test_derived_sizes() {
        let t = timing();
        assert_eq!(t.line_ticks(), 10 * PIXEL);
        assert_eq!(t.frame_ticks(), 262 * 10 * PIXEL);
    }

    #[test]
    fn test_position() {
        let t = timing();
        let pos = t.position(t.line_ticks() * 64 + 9 * PIXEL);
        assert_eq!(pos.current_scanline, 64);
        assert_eq!(pos.hpos, 9);
        assert!(pos.in_hblank());
        assert!(!pos.in_vblank());
        assert_eq!(pos.frame, 0);

        let pos = t.position(t.frame_ticks() + t.line_ticks() * 250);
        assert_eq!(pos.frame, 1);
        assert_eq!(pos.current_scanline, 250);
        assert!(pos.in_vblank());
        assert!(!pos.in_hblank());
    }

    #[test]
    fn test_next_time_wraps_to_next_frame() {
        let t = timing();
        let line64 = t.line_ticks() * 64;
        assert_eq!(t.next_time_at(0, 64, 0), line64);
        assert_eq!(t.time_at_or_after(line64, 64, 0), line64);
        // Strictly after: the same position comes round a frame later
        assert_eq!(t.next_time_at(line64, 64, 0), line64 + t.frame_ticks());
        assert_eq!(t.next_time_at(line64 + 1, 0, 0), t.frame_ticks());
        assert_eq!(t.time_until_pos(line64, 64, 8), 8 * PIXEL);
    }

    #[test]
    fn test_rejects_bad_timing() {
        assert!(matches!(ScreenTiming::new(1_000_000, 0, 0, 262, 240), Err(DeviceError::InvalidTiming(_))));
        assert!(matches!(ScreenTiming::new(1_000_000, 10, 11, 262, 240), Err(DeviceError::InvalidTiming(_))));
        assert!(matches!(ScreenTiming::new(7, 10, 8, 262, 240), Err(DeviceError::InvalidClock(7))));
    }
}
