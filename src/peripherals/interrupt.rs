//! Interrupt line controller
//!
//! Tracks the level of every (cpu, line) pair that any device drives. Lines
//! are edge-triggered from the devices' point of view: asserting an asserted
//! line or clearing a clear line changes nothing and is not forwarded to the
//! CPU. Several devices may share one line; the last write wins.
//!
//! Also hosts the raster-periodic generators used by arcade boards: assert a
//! line when the beam reaches a scanline, clear it again when that scanline
//! enters horizontal blanking.

use std::collections::BTreeMap;

use crate::cpu::{CpuControl, CpuId, LineId};
use crate::scheduler::{EventHandle, Scheduler};
use crate::screen::ScreenTiming;
use crate::snapshot::{put_handle, Reader};
use crate::{DeviceError, Result};

/// Current level of every line a device has touched
#[derive(Debug, Clone, Default)]
pub struct InterruptLines {
    lines: BTreeMap<(CpuId, LineId), bool>,
}

impl InterruptLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert a line. Returns true if the level changed.
    pub fn assert(&mut self, cpu: CpuId, line: LineId, cpus: &mut dyn CpuControl) -> bool {
        let level = self.lines.entry((cpu, line)).or_insert(false);
        if *level {
            return false;
        }
        *level = true;
        log::trace!("cpu{} {:?} asserted", cpu.0, line);
        cpus.assert_line(cpu, line);
        true
    }

    /// Clear a line. Returns true if the level changed.
    pub fn clear(&mut self, cpu: CpuId, line: LineId, cpus: &mut dyn CpuControl) -> bool {
        match self.lines.get_mut(&(cpu, line)) {
            Some(level) if *level => {
                *level = false;
                log::trace!("cpu{} {:?} cleared", cpu.0, line);
                cpus.clear_line(cpu, line);
                true
            }
            _ => false,
        }
    }

    pub fn is_asserted(&self, cpu: CpuId, line: LineId) -> bool {
        self.lines.get(&(cpu, line)).copied().unwrap_or(false)
    }

    /// Clear every asserted line
    pub fn reset(&mut self, cpus: &mut dyn CpuControl) {
        for (&(cpu, line), level) in self.lines.iter_mut() {
            if *level {
                *level = false;
                cpus.clear_line(cpu, line);
            }
        }
    }

    // ========== State Persistence ==========

    /// count(4) + entries of cpu(1) + line(2) + level(1)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.lines.len() * 4);
        buf.extend_from_slice(&(self.lines.len() as u32).to_le_bytes());
        for (&(cpu, line), &level) in &self.lines {
            buf.push(cpu.0);
            buf.extend_from_slice(&line.code().to_le_bytes());
            buf.push(level as u8);
        }
        buf
    }

    /// Restore line levels. The CPUs are expected to be restored from the
    /// same snapshot, so nothing is forwarded to them.
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = Reader::new(buf);
        let count = r.u32()?;
        let mut lines = BTreeMap::new();
        for _ in 0..count {
            let cpu = CpuId(r.u8()?);
            let line = LineId::from_code(r.u16()?).ok_or(DeviceError::CorruptSnapshot("line id"))?;
            lines.insert((cpu, line), r.bool()?);
        }
        self.lines = lines;
        Ok(r.position())
    }
}

/// Which scanlines of a frame a periodic interrupt fires on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanlineSchedule {
    /// The same scanlines every frame (sorted, deduplicated on build)
    Fixed(Vec<u32>),
    /// `first`, then every `step` lines; after `last`, continue at `restart`
    Stepped { first: u32, step: u32, last: u32, restart: u32 },
}

impl ScanlineSchedule {
    pub fn fixed(mut lines: Vec<u32>) -> Self {
        lines.sort_unstable();
        lines.dedup();
        ScanlineSchedule::Fixed(lines)
    }

    /// IRQ on scanline 0, 64, 128, 192, 256, and from then on 64 again
    pub fn every_64_lines() -> Self {
        ScanlineSchedule::Stepped {
            first: 0,
            step: 64,
            last: 256,
            restart: 64,
        }
    }

    pub fn first(&self) -> u32 {
        match self {
            ScanlineSchedule::Fixed(lines) => lines[0],
            ScanlineSchedule::Stepped { first, .. } => *first,
        }
    }

    /// Target after the one at `scanline`
    pub fn next_after(&self, scanline: u32) -> u32 {
        match self {
            ScanlineSchedule::Fixed(lines) => lines
                .iter()
                .copied()
                .find(|&l| l > scanline)
                .unwrap_or(lines[0]),
            // Stepping past `last` also restarts, so the target never
            // leaves the frame
            ScanlineSchedule::Stepped { step, last, restart, .. } => scanline
                .checked_add(*step)
                .filter(|&next| scanline < *last && next <= *last)
                .unwrap_or(*restart),
        }
    }

    fn validate(&self, total_scanlines: u32) -> Result<()> {
        let ok = match self {
            ScanlineSchedule::Fixed(lines) => {
                !lines.is_empty() && lines.iter().all(|&l| l < total_scanlines)
            }
            ScanlineSchedule::Stepped { first, step, last, restart } => {
                *step > 0
                    && *step < total_scanlines
                    && *first < total_scanlines
                    && *last < total_scanlines
                    && *restart < total_scanlines
            }
        };
        if ok {
            Ok(())
        } else {
            Err(DeviceError::InvalidTiming(format!(
                "scanline schedule {self:?} does not fit {total_scanlines} scanlines"
            )))
        }
    }
}

/// Timer events owned by the periodic generators; the payload is the
/// generator index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqEvent {
    Assert(u8),
    Clear(u8),
}

#[derive(Debug, Clone)]
struct Generator {
    cpu: CpuId,
    line: LineId,
    schedule: ScanlineSchedule,
    /// Scanline the pending assert event is aimed at
    target: u32,
    assert_event: Option<EventHandle>,
    clear_event: Option<EventHandle>,
}

/// Set of scanline-periodic assert/clear generators
#[derive(Debug, Clone)]
pub struct PeriodicInterrupts {
    screen: ScreenTiming,
    generators: Vec<Generator>,
}

impl PeriodicInterrupts {
    pub fn new(screen: ScreenTiming) -> Self {
        Self {
            screen,
            generators: Vec::new(),
        }
    }

    pub fn screen(&self) -> &ScreenTiming {
        &self.screen
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Register a generator that asserts `line` on each scheduled scanline
    /// and clears it when that scanline reaches HBLANK. The first assert is
    /// armed immediately. Returns the generator index.
    pub fn periodic_assert_then_clear_on_hblank<E>(
        &mut self,
        cpu: CpuId,
        line: LineId,
        schedule: ScanlineSchedule,
        sched: &mut Scheduler<E>,
    ) -> Result<u8>
    where
        E: Copy + From<IrqEvent>,
    {
        schedule.validate(self.screen.total_scanlines())?;
        // The clear edge must fall inside the asserted scanline
        let hblank_start = self.screen.hblank_start();
        if hblank_start == 0 || hblank_start >= self.screen.htotal() {
            return Err(DeviceError::InvalidTiming(format!(
                "periodic interrupt needs HBLANK start inside the line, got {hblank_start} of {}",
                self.screen.htotal()
            )));
        }
        if self.generators.len() > u8::MAX as usize {
            return Err(DeviceError::InvalidTiming("too many periodic interrupts".to_string()));
        }

        let index = self.generators.len() as u8;
        self.generators.push(Generator {
            cpu,
            line,
            target: schedule.first(),
            schedule,
            assert_event: None,
            clear_event: None,
        });
        self.arm(index, sched);
        Ok(index)
    }

    fn arm<E: Copy + From<IrqEvent>>(&mut self, index: u8, sched: &mut Scheduler<E>) {
        let generator = &mut self.generators[index as usize];
        generator.target = generator.schedule.first();
        let at = self.screen.time_at_or_after(sched.now(), generator.target, 0);
        generator.assert_event = Some(sched.schedule_at(at, IrqEvent::Assert(index).into()));
    }

    /// Cancel every pending event and re-arm each generator at its first
    /// scanline (machine reset)
    pub fn restart<E: Copy + From<IrqEvent>>(&mut self, sched: &mut Scheduler<E>) {
        self.stop(sched);
        for index in 0..self.generators.len() {
            self.arm(index as u8, sched);
        }
    }

    /// Cancel every pending event
    pub fn stop<E: Copy>(&mut self, sched: &mut Scheduler<E>) {
        for generator in &mut self.generators {
            for handle in [generator.assert_event.take(), generator.clear_event.take()].into_iter().flatten() {
                sched.cancel(handle);
            }
        }
    }

    /// Handle one of the generators' events. Must be called with the
    /// scheduler's time at the event's fire time.
    pub fn handle<E>(
        &mut self,
        event: IrqEvent,
        sched: &mut Scheduler<E>,
        lines: &mut InterruptLines,
        cpus: &mut dyn CpuControl,
    ) where
        E: Copy + From<IrqEvent>,
    {
        let now = sched.now();
        match event {
            IrqEvent::Assert(index) => {
                let Some(generator) = self.generators.get_mut(index as usize) else {
                    log::warn!("assert event for unknown generator {index}");
                    return;
                };
                let scanline = generator.target;
                lines.assert(generator.cpu, generator.line, cpus);

                // Clear edge at this scanline's HBLANK, then the next assert.
                // Both are computed from the fire time, so a late drain still
                // interleaves them in beam order.
                let clear_at = self.screen.next_time_at(now, scanline, self.screen.hblank_start());
                generator.clear_event = Some(sched.schedule_at(clear_at, IrqEvent::Clear(index).into()));

                generator.target = generator.schedule.next_after(scanline);
                let next_at = self.screen.next_time_at(now, generator.target, 0);
                generator.assert_event = Some(sched.schedule_at(next_at, IrqEvent::Assert(index).into()));
            }
            IrqEvent::Clear(index) => {
                let Some(generator) = self.generators.get_mut(index as usize) else {
                    log::warn!("clear event for unknown generator {index}");
                    return;
                };
                generator.clear_event = None;
                lines.clear(generator.cpu, generator.line, cpus);
            }
        }
    }

    // ========== State Persistence ==========

    /// Per generator: target(4) + assert handle + clear handle
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.generators.len() as u8);
        for generator in &self.generators {
            buf.extend_from_slice(&generator.target.to_le_bytes());
            put_handle(&mut buf, generator.assert_event);
            put_handle(&mut buf, generator.clear_event);
        }
        buf
    }

    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = Reader::new(buf);
        if r.u8()? as usize != self.generators.len() {
            return Err(DeviceError::CorruptSnapshot("periodic interrupt count"));
        }
        for generator in &mut self.generators {
            generator.target = r.u32()?;
            generator.assert_event = r.handle()?;
            generator.clear_event = r.handle()?;
        }
        Ok(r.position())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuAction, RecordingCpus};

    const MAIN: CpuId = CpuId(0);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Ev(IrqEvent);

    impl From<IrqEvent> for Ev {
        fn from(e: IrqEvent) -> Self {
            Ev(e)
        }
    }

    /// 1 MHz pixel clock, 10 pixels per line with HBLANK at 8, 262 lines
    fn screen() -> ScreenTiming {
        ScreenTiming::new(1_000_000, 10, 8, 262, 240).unwrap()
    }

    struct Rig {
        sched: Scheduler<Ev>,
        lines: InterruptLines,
        periodic: PeriodicInterrupts,
        cpus: RecordingCpus,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                sched: Scheduler::new(),
                lines: InterruptLines::new(),
                periodic: PeriodicInterrupts::new(screen()),
                cpus: RecordingCpus::new(1),
            }
        }

        fn run_to(&mut self, time: u64) {
            while let Some(fired) = self.sched.next_due(time) {
                self.periodic.handle(fired.event.0, &mut self.sched, &mut self.lines, &mut self.cpus);
            }
            self.sched.settle(time);
        }
    }

    #[test]
    fn test_assert_is_idempotent() {
        let mut lines = InterruptLines::new();
        let mut cpus = RecordingCpus::new(1);

        assert!(lines.assert(MAIN, LineId::Irq, &mut cpus));
        assert!(!lines.assert(MAIN, LineId::Irq, &mut cpus));
        assert!(lines.is_asserted(MAIN, LineId::Irq));
        assert_eq!(cpus.actions, vec![CpuAction::Assert(MAIN, LineId::Irq)]);

        assert!(lines.clear(MAIN, LineId::Irq, &mut cpus));
        assert!(!lines.clear(MAIN, LineId::Irq, &mut cpus));
        // Clearing a line nobody touched is also silent
        assert!(!lines.clear(MAIN, LineId::Firq, &mut cpus));
        assert_eq!(cpus.actions.len(), 2);
    }

    #[test]
    fn test_lines_are_independent_per_cpu() {
        let mut lines = InterruptLines::new();
        let mut cpus = RecordingCpus::new(2);
        lines.assert(CpuId(0), LineId::Irq, &mut cpus);
        lines.assert(CpuId(1), LineId::Firq, &mut cpus);

        assert!(!lines.is_asserted(CpuId(1), LineId::Irq));
        assert!(!lines.is_asserted(CpuId(0), LineId::Firq));

        lines.reset(&mut cpus);
        assert!(!cpus.is_asserted(CpuId(0), LineId::Irq));
        assert!(!cpus.is_asserted(CpuId(1), LineId::Firq));
    }

    #[test]
    fn test_lines_snapshot() {
        let mut lines = InterruptLines::new();
        let mut cpus = RecordingCpus::new(2);
        lines.assert(CpuId(1), LineId::Other(3), &mut cpus);
        lines.assert(CpuId(0), LineId::Nmi, &mut cpus);
        lines.clear(CpuId(0), LineId::Nmi, &mut cpus);

        let bytes = lines.to_bytes();
        let mut restored = InterruptLines::new();
        assert_eq!(restored.from_bytes(&bytes).unwrap(), bytes.len());
        assert!(restored.is_asserted(CpuId(1), LineId::Other(3)));
        assert!(!restored.is_asserted(CpuId(0), LineId::Nmi));
    }

    #[test]
    fn test_schedules() {
        let stepped = ScanlineSchedule::every_64_lines();
        let mut line = stepped.first();
        let mut seen = vec![line];
        for _ in 0..6 {
            line = stepped.next_after(line);
            seen.push(line);
        }
        assert_eq!(seen, vec![0, 64, 128, 192, 256, 64, 128]);

        let fixed = ScanlineSchedule::fixed(vec![92, 10, 92]);
        assert_eq!(fixed.first(), 10);
        assert_eq!(fixed.next_after(10), 92);
        assert_eq!(fixed.next_after(92), 10);
    }

    #[test]
    fn test_schedule_must_fit_screen() {
        let mut rig = Rig::new();
        let err = rig.periodic.periodic_assert_then_clear_on_hblank(
            MAIN,
            LineId::Irq,
            ScanlineSchedule::fixed(vec![300]),
            &mut rig.sched,
        );
        assert!(matches!(err, Err(DeviceError::InvalidTiming(_))));
        assert!(rig.periodic.is_empty());
        assert_eq!(rig.sched.pending_count(), 0);
    }

    #[test]
    fn test_hblank_must_start_inside_the_line() {
        for hblank_start in [0, 10] {
            let screen = ScreenTiming::new(1_000_000, 10, hblank_start, 262, 240).unwrap();
            let mut periodic = PeriodicInterrupts::new(screen);
            let mut sched = Scheduler::<Ev>::new();
            let err = periodic.periodic_assert_then_clear_on_hblank(
                MAIN,
                LineId::Irq,
                ScanlineSchedule::fixed(vec![64]),
                &mut sched,
            );
            assert!(matches!(err, Err(DeviceError::InvalidTiming(_))), "hblank at {hblank_start}");
            assert_eq!(sched.pending_count(), 0);
        }

        // Last pixel of the line is the latest clear edge allowed
        let mut periodic = PeriodicInterrupts::new(ScreenTiming::new(1_000_000, 10, 9, 262, 240).unwrap());
        let mut sched = Scheduler::<Ev>::new();
        assert!(periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::fixed(vec![64]), &mut sched)
            .is_ok());
    }

    #[test]
    fn test_oversized_step_is_rejected() {
        let mut rig = Rig::new();
        for step in [262, u32::MAX] {
            let schedule = ScanlineSchedule::Stepped {
                first: 1,
                step,
                last: 200,
                restart: 0,
            };
            let err = rig
                .periodic
                .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, schedule, &mut rig.sched);
            assert!(matches!(err, Err(DeviceError::InvalidTiming(_))), "step {step}");
        }
        assert!(rig.periodic.is_empty());
    }

    #[test]
    fn test_stepping_past_last_restarts() {
        let schedule = ScanlineSchedule::Stepped {
            first: 10,
            step: 100,
            last: 250,
            restart: 5,
        };
        assert_eq!(schedule.next_after(10), 110);
        assert_eq!(schedule.next_after(110), 210);
        // 310 would leave a 262-line frame
        assert_eq!(schedule.next_after(210), 5);

        let huge = ScanlineSchedule::Stepped {
            first: 1,
            step: u32::MAX,
            last: 200,
            restart: 0,
        };
        assert_eq!(huge.next_after(1), 0);
    }

    #[test]
    fn test_scanline_64_asserted_for_active_portion_only() {
        let mut rig = Rig::new();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::fixed(vec![64]), &mut rig.sched)
            .unwrap();

        let t = screen();
        let pixel = t.pixel_clock().base_ticks_per_tick();
        // Walk two frames one pixel at a time
        for time in (0..2 * t.frame_ticks()).step_by(pixel as usize) {
            rig.run_to(time);
            let pos = t.position(time);
            let expected = pos.current_scanline == 64 && !pos.in_hblank();
            assert_eq!(
                rig.lines.is_asserted(MAIN, LineId::Irq),
                expected,
                "frame {} line {} hpos {}",
                pos.frame,
                pos.current_scanline,
                pos.hpos
            );
        }
    }

    #[test]
    fn test_catch_up_interleaves_assert_and_clear() {
        let mut rig = Rig::new();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::every_64_lines(), &mut rig.sched)
            .unwrap();

        // One call spanning two full frames after a host stall
        rig.run_to(2 * screen().frame_ticks());

        let edges: Vec<_> = rig.cpus.actions.clone();
        // Frame 0: 0, 64, 128, 192, 256; frame 1: 64, 128, 192, 256; frame 2 line 0 not reached
        assert_eq!(edges.len(), 2 * 9);
        for pair in edges.chunks(2) {
            assert_eq!(pair[0], CpuAction::Assert(MAIN, LineId::Irq));
            assert_eq!(pair[1], CpuAction::Clear(MAIN, LineId::Irq));
        }
        assert!(!rig.lines.is_asserted(MAIN, LineId::Irq));
    }

    #[test]
    fn test_two_generators_share_a_cpu() {
        let mut rig = Rig::new();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::every_64_lines(), &mut rig.sched)
            .unwrap();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Firq, ScanlineSchedule::fixed(vec![92]), &mut rig.sched)
            .unwrap();

        let t = screen();
        rig.run_to(t.line_ticks() * 92 + 1);
        assert!(rig.lines.is_asserted(MAIN, LineId::Firq));
        assert!(!rig.lines.is_asserted(MAIN, LineId::Irq));

        rig.run_to(t.line_ticks() * 92 + 8 * 7680);
        assert!(!rig.lines.is_asserted(MAIN, LineId::Firq));
    }

    #[test]
    fn test_stop_cancels_everything() {
        let mut rig = Rig::new();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::fixed(vec![0]), &mut rig.sched)
            .unwrap();
        rig.run_to(1);
        assert_eq!(rig.sched.pending_count(), 2);

        rig.periodic.stop(&mut rig.sched);
        assert_eq!(rig.sched.pending_count(), 0);

        rig.periodic.restart(&mut rig.sched);
        assert_eq!(rig.sched.pending_count(), 1);
    }

    #[test]
    fn test_periodic_snapshot() {
        let mut rig = Rig::new();
        rig.periodic
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::every_64_lines(), &mut rig.sched)
            .unwrap();
        rig.run_to(screen().line_ticks() * 64 + 1);

        let bytes = rig.periodic.to_bytes();
        let mut restored = PeriodicInterrupts::new(screen());
        let mut scratch: Scheduler<Ev> = Scheduler::new();
        restored
            .periodic_assert_then_clear_on_hblank(MAIN, LineId::Irq, ScanlineSchedule::every_64_lines(), &mut scratch)
            .unwrap();
        assert_eq!(restored.from_bytes(&bytes).unwrap(), bytes.len());
        assert_eq!(restored.generators[0].target, 128);
        assert_eq!(restored.generators[0].assert_event, rig.periodic.generators[0].assert_event);
        assert!(restored.generators[0].clear_event.is_some());
    }
}
