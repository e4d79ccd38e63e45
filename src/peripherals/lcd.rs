//! Hitachi HD61830 LCD Timing Controller
//!
//! Two registers at consecutive byte offsets:
//! - offset 0: data register (read: display data, write: instruction argument)
//! - offset 1: instruction register (write) / status register (read)
//!
//! A data write executes whatever instruction is latched in the instruction
//! register and makes the controller busy for that instruction's execution
//! time. Data writes arriving while busy are dropped.
//!
//! The controller owns 64KB of display RAM addressed through an
//! auto-incrementing cursor, and a 0x5C0 byte character generator ROM holding
//! 5x7 glyphs for 0x20-0x7F and 0xA0-0xDF plus 5x11 glyphs for 0xE0-0xFF.

use std::fmt;

use crate::memory::AddressedMemory;
use crate::scheduler::{Clock, EventHandle, Scheduler};
use crate::snapshot::{put_handle, Reader, HANDLE_SIZE};
use crate::video::{Bitmap, ScanlineSource};
use crate::Result;

/// Display RAM size (16-bit address space)
pub const RAM_SIZE: usize = 0x10000;
/// Internal character generator ROM size
pub const CHARGEN_SIZE: usize = 0x5C0;

/// Controller clock (busy times are counted in these cycles)
pub const DEFAULT_CLOCK: Clock = Clock::MHZ_1;

/// Register offsets
pub mod regs {
    pub const DATA: u32 = 0;
    pub const CONTROL: u32 = 1;
}

/// Instruction codes
pub mod instr {
    pub const MODE_CONTROL: u8 = 0;
    pub const CHARACTER_PITCH: u8 = 1;
    pub const NUMBER_OF_CHARACTERS: u8 = 2;
    pub const NUMBER_OF_TIME_DIVISIONS: u8 = 3;
    pub const CURSOR_POSITION: u8 = 4;
    pub const DISPLAY_START_LOW: u8 = 8;
    pub const DISPLAY_START_HIGH: u8 = 9;
    pub const CURSOR_ADDRESS_LOW: u8 = 10;
    pub const CURSOR_ADDRESS_HIGH: u8 = 11;
    pub const DISPLAY_DATA_WRITE: u8 = 12;
    pub const DISPLAY_DATA_READ: u8 = 13;
    pub const CLEAR_BIT: u8 = 14;
    pub const SET_BIT: u8 = 15;
}

/// Mode control register bits
pub mod mode {
    pub const EXTERNAL_CG: u8 = 0x01;
    pub const GRAPHIC: u8 = 0x02;
    pub const CURSOR: u8 = 0x04;
    pub const BLINK: u8 = 0x08;
    pub const MASTER: u8 = 0x10;
    pub const DISPLAY_ON: u8 = 0x20;
}

/// Status register busy flag
pub const STATUS_BUSY: u8 = 0x80;

/// Frames per cursor blink phase
const BLINK_FRAMES: u8 = 0x20;

/// Execution time of each instruction in controller cycles. `None` marks
/// codes that are not valid as a data register write.
const CYCLES: [Option<u64>; 16] = [
    Some(4), Some(4), Some(4), Some(4), Some(4), None, None, None,
    Some(4), Some(4), Some(4), Some(4), Some(6), None, Some(36), Some(36),
];

/// Timer events owned by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LcdEvent {
    BusyClear,
}

/// External character generator, read when the EXTERNAL_CG mode bit is set.
/// The address is (glyph row << 12) | character code.
pub trait CharacterGenerator {
    fn read(&self, address: u16) -> u8;
}

impl<F: Fn(u16) -> u8> CharacterGenerator for F {
    fn read(&self, address: u16) -> u8 {
        self(address)
    }
}

/// HD61830 controller
pub struct Hd61830 {
    clock: Clock,
    /// Panel size in pixels; drawing outside it is clipped
    width: usize,
    height: usize,

    /// Busy flag; a busy-clear event is pending while set
    bf: bool,
    busy_event: Option<EventHandle>,
    /// Instruction register
    ir: u8,
    /// Mode control register
    mcr: u8,
    /// Data output latch (one read behind the cursor)
    dor: u8,
    /// Cursor address counter
    cac: u16,
    /// Display start address
    dsa: u16,
    /// Vertical character pitch (1-16)
    vp: u8,
    /// Horizontal character pitch (1-8)
    hp: u8,
    /// Number of horizontal characters (1-128)
    hn: u8,
    /// Number of time divisions (1-128)
    nx: u8,
    /// Cursor position (glyph row of the underline, 1-128)
    cp: u8,
    /// Frame counter for the blink phase
    blink: u8,
    /// Current blink phase
    cursor: bool,

    ram: AddressedMemory,
    chargen: [u8; CHARGEN_SIZE],
    external_cg: Option<Box<dyn CharacterGenerator>>,
}

impl Hd61830 {
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_clock(DEFAULT_CLOCK, width, height)
    }

    pub fn with_clock(clock: Clock, width: usize, height: usize) -> Self {
        Self {
            clock,
            width,
            height,
            bf: false,
            busy_event: None,
            ir: 0,
            mcr: 0,
            dor: 0,
            cac: 0,
            dsa: 0,
            // A cleared pitch/count register decodes as 1
            vp: 1,
            hp: 6,
            hn: 1,
            nx: 1,
            cp: 1,
            blink: 0,
            cursor: false,
            ram: AddressedMemory::new(RAM_SIZE),
            chargen: [0; CHARGEN_SIZE],
            external_cg: None,
        }
    }

    /// Display off, slave mode, default horizontal pitch. Cancels a pending
    /// busy period.
    pub fn reset<E: Copy>(&mut self, sched: &mut Scheduler<E>) {
        if let Some(handle) = self.busy_event.take() {
            sched.cancel(handle);
        }
        self.bf = false;
        self.mcr &= !(mode::MASTER | mode::DISPLAY_ON);
        self.hp = 6;
    }

    // ========== Register interface ==========

    /// Latch an instruction code. Always accepted, even while busy.
    pub fn write_instruction(&mut self, value: u8) {
        self.ir = value;
    }

    /// Status register: busy flag in bit 7
    pub fn read_status(&self) -> u8 {
        if self.bf {
            STATUS_BUSY
        } else {
            0
        }
    }

    /// Return the latched byte, then refill the latch from the cursor and
    /// advance it. The first read after moving the cursor is stale.
    pub fn read_data(&mut self) -> u8 {
        let data = self.dor;
        self.dor = self.ram.read_byte(self.cac as u32);
        self.cac = self.cac.wrapping_add(1);
        log::trace!("HD61830 display data read {data:02X}");
        data
    }

    /// Execute the latched instruction with `value` as its argument
    pub fn write_data<E>(&mut self, value: u8, sched: &mut Scheduler<E>)
    where
        E: Copy + From<LcdEvent>,
    {
        if self.bf {
            log::warn!("HD61830 ignoring data write {value:02X} while busy");
            return;
        }

        match self.ir {
            instr::MODE_CONTROL => {
                self.mcr = value;
                log::debug!(
                    "HD61830 mode {:02X}: {} CG, {} display, {}",
                    value,
                    if value & mode::EXTERNAL_CG != 0 { "external" } else { "internal" },
                    if value & mode::GRAPHIC != 0 { "graphic" } else { "character" },
                    if value & mode::DISPLAY_ON != 0 { "on" } else { "off" },
                );
            }
            instr::CHARACTER_PITCH => {
                self.hp = (value & 0x07) + 1;
                self.vp = (value >> 4) + 1;
            }
            instr::NUMBER_OF_CHARACTERS => self.hn = (value & 0x7F) + 1,
            instr::NUMBER_OF_TIME_DIVISIONS => self.nx = (value & 0x7F) + 1,
            instr::CURSOR_POSITION => self.cp = (value & 0x7F) + 1,
            instr::DISPLAY_START_LOW => self.dsa = (self.dsa & 0xFF00) | value as u16,
            instr::DISPLAY_START_HIGH => self.dsa = ((value as u16) << 8) | (self.dsa & 0x00FF),
            instr::CURSOR_ADDRESS_LOW => {
                // Bit 7 falling carries into the high byte
                if self.cac & 0x80 != 0 && value & 0x80 == 0 {
                    self.cac = ((self.cac >> 8).wrapping_add(1) << 8) | value as u16;
                } else {
                    self.cac = (self.cac & 0xFF00) | value as u16;
                }
            }
            instr::CURSOR_ADDRESS_HIGH => self.cac = ((value as u16) << 8) | (self.cac & 0x00FF),
            instr::DISPLAY_DATA_WRITE => {
                log::trace!("HD61830 display data write {value:02X} -> {:04X}", self.cac);
                self.ram.write_byte(self.cac as u32, value);
                self.cac = self.cac.wrapping_add(1);
            }
            instr::CLEAR_BIT | instr::SET_BIT => {
                let mask = 1u8 << (value & 0x07);
                let md = self.ram.read_byte(self.cac as u32);
                let md = if self.ir == instr::SET_BIT { md | mask } else { md & !mask };
                self.ram.write_byte(self.cac as u32, md);
                self.cac = self.cac.wrapping_add(1);
            }
            _ => {
                log::warn!("HD61830 illegal instruction {:02X}", self.ir);
                return;
            }
        }

        self.set_busy(sched);
    }

    fn set_busy<E: Copy + From<LcdEvent>>(&mut self, sched: &mut Scheduler<E>) {
        let Some(cycles) = CYCLES.get(self.ir as usize).copied().flatten() else {
            return;
        };
        self.bf = true;
        let delay = self.clock.cycles_to_ticks(cycles);
        match self.busy_event {
            Some(handle) if sched.is_pending(handle) => {
                sched.cancel(handle);
            }
            _ => {}
        }
        self.busy_event = Some(sched.schedule(delay, LcdEvent::BusyClear.into()));
    }

    /// Busy-clear timer fired
    pub fn busy_timer_expired(&mut self) {
        self.bf = false;
        self.busy_event = None;
    }

    /// Read register at byte offset
    pub fn read(&mut self, offset: u32) -> u8 {
        match offset & 1 {
            regs::DATA => self.read_data(),
            _ => self.read_status(),
        }
    }

    /// Write register at byte offset
    pub fn write<E>(&mut self, offset: u32, value: u8, sched: &mut Scheduler<E>)
    where
        E: Copy + From<LcdEvent>,
    {
        match offset & 1 {
            regs::DATA => self.write_data(value, sched),
            _ => self.write_instruction(value),
        }
    }

    // ========== Accessors ==========

    pub fn is_busy(&self) -> bool {
        self.bf
    }

    pub fn instruction(&self) -> u8 {
        self.ir
    }

    pub fn mode(&self) -> u8 {
        self.mcr
    }

    pub fn cursor_address(&self) -> u16 {
        self.cac
    }

    pub fn display_start(&self) -> u16 {
        self.dsa
    }

    /// (horizontal, vertical) character pitch
    pub fn pitch(&self) -> (u8, u8) {
        (self.hp, self.vp)
    }

    pub fn characters_per_line(&self) -> u8 {
        self.hn
    }

    pub fn time_divisions(&self) -> u8 {
        self.nx
    }

    pub fn cursor_position(&self) -> u8 {
        self.cp
    }

    pub fn cursor_phase(&self) -> bool {
        self.cursor
    }

    pub fn ram(&self) -> &AddressedMemory {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut AddressedMemory {
        &mut self.ram
    }

    /// Load the internal character generator image (up to 0x5C0 bytes)
    pub fn load_chargen(&mut self, data: &[u8]) {
        let len = data.len().min(CHARGEN_SIZE);
        self.chargen[..len].copy_from_slice(&data[..len]);
    }

    pub fn set_external_cg(&mut self, cg: Box<dyn CharacterGenerator>) {
        self.external_cg = Some(cg);
    }

    // ========== Rendering ==========

    /// Internal ROM offset of glyph row `cl` of character `md`
    fn chargen_offset(md: u8, cl: u8) -> Option<usize> {
        let (md, cl) = (md as usize, cl as usize);
        match md {
            0x20..=0x7F if cl < 7 => Some((md - 0x20) * 7 + cl),
            0xA0..=0xDF if cl < 7 => Some(96 * 7 + (md - 0xA0) * 7 + cl),
            0xE0..=0xFF if cl < 11 => Some(160 * 7 + (md - 0xE0) * 11 + cl),
            _ => None,
        }
    }

    fn glyph_row(&self, md: u8, cl: u8) -> u8 {
        if self.mcr & mode::EXTERNAL_CG != 0 {
            return self
                .external_cg
                .as_ref()
                .map_or(0, |cg| cg.read(((cl as u16) << 12) | md as u16));
        }
        Self::chargen_offset(md, cl).map_or(0, |offset| self.chargen[offset])
    }

    fn render_graphics_line(&self, y: usize, row: &mut [u8]) {
        // Upper panel rows 0..nx, lower panel rows nx..2*nx, both contiguous
        // from the display start address
        if y >= 2 * self.nx as usize {
            return;
        }
        let hn = self.hn as usize;
        let hp = self.hp as usize;
        let mut ra = self.dsa.wrapping_add((y * hn) as u16);
        for sx in 0..hn {
            let data = self.ram.read_byte(ra as u32);
            ra = ra.wrapping_add(1);
            for x in 0..hp {
                if let Some(pixel) = row.get_mut(sx * hp + x) {
                    *pixel = (data >> x) & 1;
                }
            }
        }
    }

    fn render_text_line(&self, y: usize, row: &mut [u8]) {
        let vp = self.vp as usize;
        let rows = self.nx as usize / vp;
        let (char_row, cl) = (y / vp, (y % vp) as u8);
        if char_row >= rows {
            return;
        }

        let hn = self.hn as usize;
        let hp = self.hp as usize;
        let cursor_on = self.mcr & mode::CURSOR != 0;
        let blink_on = self.mcr & mode::BLINK != 0;
        let underline = cursor_on && cl == self.cp;

        for x in 0..hn {
            // Text starts at the display start address, like graphics; the
            // blinking cell is the one whose absolute address is the cursor
            let ma = self.dsa.wrapping_add((char_row * hn + x) as u16);
            let md = self.ram.read_byte(ma as u32);
            let data = self.glyph_row(md, cl);

            for cr in 0..hp {
                let mut pixel = (data >> cr) & 1;
                if blink_on && ma == self.cac && !cursor_on {
                    // Character blink
                    if !self.cursor {
                        pixel = 0;
                    }
                } else if underline {
                    pixel = self.cursor as u8;
                }
                if let Some(out) = row.get_mut(x * hp + cr) {
                    *out = pixel;
                }
            }
        }
    }

    /// Advance the blink counter by one frame
    fn advance_blink(&mut self) {
        self.blink += 1;
        if self.blink == BLINK_FRAMES {
            self.blink = 0;
            self.cursor = !self.cursor;
        }
    }

    // ========== State Persistence ==========

    /// Register state + busy handle + display RAM
    pub const SNAPSHOT_SIZE: usize = 15 + HANDLE_SIZE + RAM_SIZE;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SNAPSHOT_SIZE);
        buf.push(self.bf as u8);
        buf.push(self.ir);
        buf.push(self.mcr);
        buf.push(self.dor);
        buf.extend_from_slice(&self.cac.to_le_bytes());
        buf.extend_from_slice(&self.dsa.to_le_bytes());
        buf.push(self.vp);
        buf.push(self.hp);
        buf.push(self.hn);
        buf.push(self.nx);
        buf.push(self.cp);
        buf.push(self.blink);
        buf.push(self.cursor as u8);
        put_handle(&mut buf, self.busy_event);
        buf.extend_from_slice(self.ram.data());
        buf
    }

    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = Reader::new(buf);
        let bf = r.bool()?;
        let ir = r.u8()?;
        let mcr = r.u8()?;
        let dor = r.u8()?;
        let cac = r.u16()?;
        let dsa = r.u16()?;
        let pitch = [r.u8()?, r.u8()?, r.u8()?, r.u8()?, r.u8()?];
        let blink = r.u8()?;
        let cursor = r.bool()?;
        let busy_event = r.handle()?;
        let ram = r.bytes(RAM_SIZE)?;

        self.bf = bf;
        self.ir = ir;
        self.mcr = mcr;
        self.dor = dor;
        self.cac = cac;
        self.dsa = dsa;
        [self.vp, self.hp, self.hn, self.nx, self.cp] = pitch.map(|v| v.max(1));
        self.blink = blink % BLINK_FRAMES;
        self.cursor = cursor;
        self.busy_event = busy_event;
        self.ram.load_data(ram);
        Ok(r.position())
    }
}

impl ScanlineSource for Hd61830 {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn render_scanline(&self, y: usize, row: &mut [u8]) {
        row.fill(0);
        if self.mcr & mode::DISPLAY_ON == 0 {
            return;
        }
        if self.mcr & mode::GRAPHIC != 0 {
            self.render_graphics_line(y, row);
        } else {
            self.render_text_line(y, row);
        }
    }

    fn render_frame(&mut self) -> Bitmap {
        let mut bitmap = Bitmap::new(self.width, self.height);
        for y in 0..self.height {
            self.render_scanline(y, bitmap.row_mut(y));
        }
        self.advance_blink();
        bitmap
    }
}

impl fmt::Debug for Hd61830 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hd61830")
            .field("bf", &self.bf)
            .field("ir", &self.ir)
            .field("mcr", &self.mcr)
            .field("cac", &self.cac)
            .field("dsa", &self.dsa)
            .field("hp", &self.hp)
            .field("vp", &self.vp)
            .field("hn", &self.hn)
            .field("nx", &self.nx)
            .field("cp", &self.cp)
            .field("external_cg", &self.external_cg.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Ev(LcdEvent);

    impl From<LcdEvent> for Ev {
        fn from(e: LcdEvent) -> Self {
            Ev(e)
        }
    }

    const US: u64 = 7680;

    fn setup() -> (Hd61830, Scheduler<Ev>) {
        (Hd61830::new(240, 64), Scheduler::new())
    }

    /// Run the scheduler until idle, handling busy-clear events
    fn settle(lcd: &mut Hd61830, sched: &mut Scheduler<Ev>) {
        let target = sched.now() + 1_000 * US;
        sched.advance_to(target, |_, fired| match fired.event.0 {
            LcdEvent::BusyClear => lcd.busy_timer_expired(),
        });
    }

    fn command(lcd: &mut Hd61830, sched: &mut Scheduler<Ev>, ir: u8, value: u8) {
        lcd.write_instruction(ir);
        lcd.write_data(value, sched);
        settle(lcd, sched);
    }

    fn set_cursor(lcd: &mut Hd61830, sched: &mut Scheduler<Ev>, address: u16) {
        command(lcd, sched, instr::CURSOR_ADDRESS_LOW, address as u8);
        command(lcd, sched, instr::CURSOR_ADDRESS_HIGH, (address >> 8) as u8);
    }

    #[test]
    fn test_busy_window_lengths() {
        let (mut lcd, mut sched) = setup();
        for (ir, cycles) in [
            (instr::MODE_CONTROL, 4),
            (instr::CURSOR_ADDRESS_HIGH, 4),
            (instr::DISPLAY_DATA_WRITE, 6),
            (instr::CLEAR_BIT, 36),
            (instr::SET_BIT, 36),
        ] {
            lcd.write_instruction(ir);
            lcd.write_data(0, &mut sched);
            assert!(lcd.is_busy());
            assert_eq!(lcd.read_status(), STATUS_BUSY);
            assert_eq!(sched.next_fire_time(), Some(sched.now() + cycles * US));
            settle(&mut lcd, &mut sched);
            assert!(!lcd.is_busy());
            assert_eq!(lcd.read_status(), 0);
        }
    }

    #[test]
    fn test_write_while_busy_is_dropped() {
        let (mut lcd, mut sched) = setup();
        set_cursor(&mut lcd, &mut sched, 0x0100);

        lcd.write_instruction(instr::DISPLAY_DATA_WRITE);
        lcd.write_data(0xAA, &mut sched);
        assert_eq!(lcd.cursor_address(), 0x0101);

        // Instruction latch still accepts writes while busy
        lcd.write_instruction(instr::MODE_CONTROL);
        assert_eq!(lcd.instruction(), instr::MODE_CONTROL);
        lcd.write_data(mode::DISPLAY_ON, &mut sched);
        assert_eq!(lcd.mode(), 0);
        lcd.write_instruction(instr::DISPLAY_DATA_WRITE);
        lcd.write_data(0xBB, &mut sched);
        assert_eq!(lcd.cursor_address(), 0x0101);
        assert_eq!(lcd.ram().read_byte(0x0101), 0);
        assert_eq!(sched.pending_count(), 1);

        settle(&mut lcd, &mut sched);
        lcd.write_data(0xCC, &mut sched);
        assert_eq!(lcd.ram().read_byte(0x0100), 0xAA);
        assert_eq!(lcd.ram().read_byte(0x0101), 0xCC);
    }

    #[test]
    fn test_busy_clears_at_deadline() {
        let (mut lcd, mut sched) = setup();
        lcd.write_instruction(instr::SET_BIT);
        lcd.write_data(3, &mut sched);

        let deadline = 36 * US;
        sched.advance_to(deadline - 1, |_, _| panic!("busy cleared early"));
        assert!(lcd.is_busy());
        sched.advance_to(deadline, |_, fired| {
            assert_eq!(fired.event, Ev(LcdEvent::BusyClear));
            lcd.busy_timer_expired();
        });
        assert!(!lcd.is_busy());
    }

    #[test]
    fn test_read_data_is_one_behind() {
        let (mut lcd, mut sched) = setup();
        lcd.ram_mut().write_byte(0x10, 0x11);
        lcd.ram_mut().write_byte(0x11, 0x22);
        set_cursor(&mut lcd, &mut sched, 0x10);

        let stale = lcd.read_data();
        assert_eq!(stale, 0);
        assert_eq!(lcd.read_data(), 0x11);
        assert_eq!(lcd.read_data(), 0x22);
        assert_eq!(lcd.cursor_address(), 0x13);
    }

    #[test]
    fn test_cursor_low_carry_quirk() {
        let (mut lcd, mut sched) = setup();
        set_cursor(&mut lcd, &mut sched, 0x1280);
        command(&mut lcd, &mut sched, instr::CURSOR_ADDRESS_LOW, 0x05);
        assert_eq!(lcd.cursor_address(), 0x1305);

        // No carry when bit 7 stays set
        command(&mut lcd, &mut sched, instr::CURSOR_ADDRESS_LOW, 0x85);
        command(&mut lcd, &mut sched, instr::CURSOR_ADDRESS_LOW, 0xFF);
        assert_eq!(lcd.cursor_address(), 0x13FF);

        // Carry out of the high byte wraps
        set_cursor(&mut lcd, &mut sched, 0xFF80);
        command(&mut lcd, &mut sched, instr::CURSOR_ADDRESS_LOW, 0x00);
        assert_eq!(lcd.cursor_address(), 0x0000);
    }

    #[test]
    fn test_cursor_wraps_at_end_of_ram() {
        let (mut lcd, mut sched) = setup();
        set_cursor(&mut lcd, &mut sched, 0xFFFF);
        command(&mut lcd, &mut sched, instr::DISPLAY_DATA_WRITE, 0x5A);
        assert_eq!(lcd.cursor_address(), 0);
        assert_eq!(lcd.ram().read_byte(0xFFFF), 0x5A);
    }

    #[test]
    fn test_set_and_clear_bit() {
        let (mut lcd, mut sched) = setup();
        lcd.ram_mut().write_byte(0x20, 0b1000_0001);
        set_cursor(&mut lcd, &mut sched, 0x20);
        command(&mut lcd, &mut sched, instr::SET_BIT, 3);
        assert_eq!(lcd.ram().read_byte(0x20), 0b1000_1001);
        assert_eq!(lcd.cursor_address(), 0x21);

        set_cursor(&mut lcd, &mut sched, 0x20);
        command(&mut lcd, &mut sched, instr::CLEAR_BIT, 0xF8 | 7);
        assert_eq!(lcd.ram().read_byte(0x20), 0b0000_1001);
    }

    #[test]
    fn test_parameter_registers() {
        let (mut lcd, mut sched) = setup();
        command(&mut lcd, &mut sched, instr::CHARACTER_PITCH, 0x75);
        assert_eq!(lcd.pitch(), (6, 8));
        command(&mut lcd, &mut sched, instr::NUMBER_OF_CHARACTERS, 0xA7);
        assert_eq!(lcd.characters_per_line(), 0x28);
        command(&mut lcd, &mut sched, instr::NUMBER_OF_TIME_DIVISIONS, 0x3F);
        assert_eq!(lcd.time_divisions(), 64);
        command(&mut lcd, &mut sched, instr::CURSOR_POSITION, 0x06);
        assert_eq!(lcd.cursor_position(), 7);
        command(&mut lcd, &mut sched, instr::DISPLAY_START_LOW, 0x34);
        command(&mut lcd, &mut sched, instr::DISPLAY_START_HIGH, 0x12);
        assert_eq!(lcd.display_start(), 0x1234);
    }

    #[test]
    fn test_illegal_instruction_is_ignored() {
        let (mut lcd, mut sched) = setup();
        for ir in [5, 6, 7, instr::DISPLAY_DATA_READ, 0x10, 0xFF] {
            lcd.write_instruction(ir);
            lcd.write_data(0x12, &mut sched);
            assert!(!lcd.is_busy());
            assert_eq!(sched.pending_count(), 0);
        }
        assert_eq!(lcd.cursor_address(), 0);
    }

    #[test]
    fn test_register_offsets() {
        let (mut lcd, mut sched) = setup();
        lcd.write(regs::CONTROL, instr::DISPLAY_DATA_WRITE, &mut sched);
        lcd.write(regs::DATA, 0x42, &mut sched);
        assert_eq!(lcd.read(regs::CONTROL), STATUS_BUSY);
        assert_eq!(lcd.ram().read_byte(0), 0x42);
        // Odd offsets alias the control register
        assert_eq!(lcd.read(3), STATUS_BUSY);
    }

    #[test]
    fn test_reset_cancels_busy() {
        let (mut lcd, mut sched) = setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::MASTER | mode::GRAPHIC);
        command(&mut lcd, &mut sched, instr::CHARACTER_PITCH, 0x07);
        lcd.write_instruction(instr::SET_BIT);
        lcd.write_data(0, &mut sched);
        assert!(lcd.is_busy());

        lcd.reset(&mut sched);
        assert!(!lcd.is_busy());
        assert_eq!(sched.pending_count(), 0);
        assert_eq!(lcd.mode(), mode::GRAPHIC);
        assert_eq!(lcd.pitch().0, 6);
    }

    #[test]
    fn test_display_off_renders_blank() {
        let (mut lcd, _) = setup();
        lcd.ram_mut().fill(0xFF);
        let frame = lcd.render_frame();
        assert_eq!(frame.lit_count(), 0);
    }

    #[test]
    fn test_graphics_mode_halves() {
        let (mut lcd, mut sched) = setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::GRAPHIC);
        command(&mut lcd, &mut sched, instr::CHARACTER_PITCH, 0x07); // 8 pixels per byte
        command(&mut lcd, &mut sched, instr::NUMBER_OF_CHARACTERS, 29); // 30 bytes per line
        command(&mut lcd, &mut sched, instr::NUMBER_OF_TIME_DIVISIONS, 31); // 32 lines per half
        command(&mut lcd, &mut sched, instr::DISPLAY_START_LOW, 0x00);
        command(&mut lcd, &mut sched, instr::DISPLAY_START_HIGH, 0x10);

        // Line 0, byte 0: LSB leftmost
        lcd.ram_mut().write_byte(0x1000, 0b0000_0101);
        // Lower half line 32 starts nx * hn bytes in
        lcd.ram_mut().write_byte(0x1000 + 32 * 30 + 1, 0x80);

        let mut row = vec![0xEE; 240];
        lcd.render_scanline(0, &mut row);
        assert_eq!(&row[..4], &[1, 0, 1, 0]);
        lcd.render_scanline(32, &mut row);
        assert_eq!(row[15], 1);
        assert_eq!(row.iter().filter(|&&p| p != 0).count(), 1);

        let frame = lcd.render_frame();
        assert_eq!(frame.lit_count(), 3);
    }

    fn text_setup() -> (Hd61830, Scheduler<Ev>) {
        let (mut lcd, mut sched) = setup();
        // Glyph 'A' (0x41): every row lights pixel 0
        let mut rom = [0u8; CHARGEN_SIZE];
        for cl in 0..7 {
            rom[(0x41 - 0x20) * 7 + cl] = 0x01;
        }
        lcd.load_chargen(&rom);
        command(&mut lcd, &mut sched, instr::CHARACTER_PITCH, 0x75); // 6 x 8
        command(&mut lcd, &mut sched, instr::NUMBER_OF_CHARACTERS, 39);
        command(&mut lcd, &mut sched, instr::NUMBER_OF_TIME_DIVISIONS, 63);
        command(&mut lcd, &mut sched, instr::CURSOR_POSITION, 6); // underline on glyph row 7
        (lcd, sched)
    }

    #[test]
    fn test_text_mode_glyphs() {
        let (mut lcd, mut sched) = text_setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON);
        lcd.ram_mut().write_byte(0, 0x41);
        lcd.ram_mut().write_byte(41, 0x41);

        let mut row = vec![0; 240];
        for cl in 0..7 {
            lcd.render_scanline(cl, &mut row);
            assert_eq!(row[0], 1, "glyph row {cl}");
        }
        // Row 7 is past the 5x7 glyph
        lcd.render_scanline(7, &mut row);
        assert_eq!(row[0], 0);
        // Second character row, second column
        lcd.render_scanline(8, &mut row);
        assert_eq!(row[6], 1);
    }

    #[test]
    fn test_glyph_banks() {
        assert_eq!(Hd61830::chargen_offset(0x20, 0), Some(0));
        assert_eq!(Hd61830::chargen_offset(0x7F, 6), Some(95 * 7 + 6));
        assert_eq!(Hd61830::chargen_offset(0xA0, 0), Some(96 * 7));
        assert_eq!(Hd61830::chargen_offset(0xE0, 10), Some(160 * 7 + 10));
        assert_eq!(Hd61830::chargen_offset(0xFF, 10), Some(CHARGEN_SIZE - 1));
        assert_eq!(Hd61830::chargen_offset(0x41, 7), None);
        assert_eq!(Hd61830::chargen_offset(0x10, 0), None);
        assert_eq!(Hd61830::chargen_offset(0x85, 0), None);
    }

    #[test]
    fn test_cursor_blinks_every_32_frames() {
        let (mut lcd, mut sched) = text_setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::CURSOR);

        let underline_lit = |lcd: &Hd61830| {
            let mut row = vec![0; 240];
            lcd.render_scanline(7, &mut row);
            row[0] == 1
        };

        assert!(!underline_lit(&lcd));
        for _ in 0..31 {
            lcd.render_frame();
        }
        assert!(!lcd.cursor_phase());
        lcd.render_frame();
        assert!(lcd.cursor_phase());
        assert!(underline_lit(&lcd));
        for _ in 0..32 {
            lcd.render_frame();
        }
        assert!(!underline_lit(&lcd));
    }

    #[test]
    fn test_character_blink_at_cursor() {
        let (mut lcd, mut sched) = text_setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::BLINK);
        lcd.ram_mut().write_byte(0, 0x41);
        lcd.ram_mut().write_byte(1, 0x41);
        set_cursor(&mut lcd, &mut sched, 1);

        let mut row = vec![0; 240];
        lcd.render_scanline(0, &mut row);
        // Character under the cursor hidden in the off phase
        assert_eq!((row[0], row[6]), (1, 0));

        for _ in 0..32 {
            lcd.render_frame();
        }
        lcd.render_scanline(0, &mut row);
        assert_eq!((row[0], row[6]), (1, 1));
    }

    #[test]
    fn test_text_mode_reads_from_display_start() {
        let (mut lcd, mut sched) = text_setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::BLINK);
        command(&mut lcd, &mut sched, instr::DISPLAY_START_LOW, 0x00);
        command(&mut lcd, &mut sched, instr::DISPLAY_START_HIGH, 0x01);
        // Below the display start: not shown
        lcd.ram_mut().write_byte(0x0001, 0x41);
        lcd.ram_mut().write_byte(0x0100, 0x41);
        lcd.ram_mut().write_byte(0x0101, 0x41);
        set_cursor(&mut lcd, &mut sched, 0x0100);

        let mut row = vec![0; 240];
        lcd.render_scanline(0, &mut row);
        // Cell 0 sits at the cursor address and blinks off; cell 1 shows
        assert_eq!((row[0], row[6]), (0, 1));

        // Cursor at relative address 1 matches nothing on screen
        set_cursor(&mut lcd, &mut sched, 0x0001);
        lcd.render_scanline(0, &mut row);
        assert_eq!((row[0], row[6]), (1, 1));
    }

    #[test]
    fn test_external_character_generator() {
        let (mut lcd, mut sched) = text_setup();
        command(&mut lcd, &mut sched, instr::MODE_CONTROL, mode::DISPLAY_ON | mode::EXTERNAL_CG);
        lcd.set_external_cg(Box::new(|address: u16| if address == (2 << 12) | 0x05 { 0x02 } else { 0 }));
        lcd.ram_mut().write_byte(0, 0x05);

        let mut row = vec![0; 240];
        lcd.render_scanline(2, &mut row);
        assert_eq!(&row[..3], &[0, 1, 0]);
        lcd.render_scanline(1, &mut row);
        assert_eq!(row[1], 0);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut lcd, mut sched) = text_setup();
        set_cursor(&mut lcd, &mut sched, 0x4321);
        lcd.write_instruction(instr::DISPLAY_DATA_WRITE);
        lcd.write_data(0x99, &mut sched);
        for _ in 0..5 {
            lcd.render_frame();
        }

        let bytes = lcd.to_bytes();
        assert_eq!(bytes.len(), Hd61830::SNAPSHOT_SIZE);

        let mut restored = Hd61830::new(240, 64);
        assert_eq!(restored.from_bytes(&bytes).unwrap(), bytes.len());
        assert!(restored.is_busy());
        assert_eq!(restored.cursor_address(), 0x4322);
        assert_eq!(restored.pitch(), (6, 8));
        assert_eq!(restored.ram().read_byte(0x4321), 0x99);
        assert_eq!(restored.to_bytes(), bytes);

        assert!(matches!(
            restored.from_bytes(&bytes[..20]),
            Err(crate::DeviceError::SnapshotTooSmall)
        ));
    }
}
