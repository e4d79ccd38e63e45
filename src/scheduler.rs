//! Event Scheduler
//!
//! Keeps one monotonic machine time and a set of future events keyed by
//! absolute fire time. Uses a 7.68 GHz base clock rate as LCM of all hardware
//! clocks, so every device clock converts to base ticks with integer math.
//!
//! Events with the same fire time fire in the order they were scheduled.
//! Recurring events are re-armed from their own fire time, never from the
//! time they happened to be drained, so long catch-up runs do not drift.

use std::collections::BTreeMap;

use crate::{DeviceError, Result};

/// Base clock rate: 7,680,000,000 Hz (7.68 GHz)
pub const SCHED_BASE_CLOCK_RATE: u64 = 7_680_000_000;

/// A device clock expressed against the scheduler base rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    rate: u64,
}

impl Clock {
    /// 1 MHz, one tick per microsecond
    pub const MHZ_1: Clock = Clock::from_hz(1_000_000);

    /// Build a clock from a rate known to divide the base rate.
    pub const fn from_hz(rate: u64) -> Self {
        Self { rate }
    }

    /// Build a clock from a configured rate, rejecting rates the base clock
    /// cannot represent exactly.
    pub fn new(rate: u64) -> Result<Self> {
        if rate == 0 || SCHED_BASE_CLOCK_RATE % rate != 0 {
            return Err(DeviceError::InvalidClock(rate));
        }
        Ok(Self { rate })
    }

    /// Clock rate in Hz
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// base_ticks = SCHED_BASE_CLOCK_RATE / clock_rate
    pub fn base_ticks_per_tick(&self) -> u64 {
        SCHED_BASE_CLOCK_RATE / self.rate
    }

    /// Convert clock cycles to base ticks
    pub fn cycles_to_ticks(&self, cycles: u64) -> u64 {
        cycles * self.base_ticks_per_tick()
    }

    /// Convert base ticks to whole clock cycles (truncating)
    pub fn ticks_to_cycles(&self, ticks: u64) -> u64 {
        ticks / self.base_ticks_per_tick()
    }
}

/// Stable numeric encoding of an event payload, used by snapshots.
pub trait EventCode: Copy {
    fn code(&self) -> u32;
    fn from_code(code: u32) -> Option<Self>;
}

/// Handle to a scheduled event.
///
/// A handle stays valid until the event is cancelled or fires without
/// recurring. The slot it names may then be reused; the generation counter
/// makes the stale handle inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    index: u32,
    generation: u32,
}

impl EventHandle {
    /// Snapshot encoding (index in the low half, generation in the high half)
    pub fn to_raw(self) -> u64 {
        (self.index as u64) | ((self.generation as u64) << 32)
    }

    pub fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// An event taken from the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired<E> {
    pub handle: EventHandle,
    pub event: E,
    /// Time the event was due (the scheduler's `now` while it is handled)
    pub fire_time: u64,
}

#[derive(Debug, Clone)]
struct Entry<E> {
    event: E,
    fire_time: u64,
    seq: u64,
    /// 0 for one-shot events
    period: u64,
}

#[derive(Debug, Clone)]
struct Slot<E> {
    generation: u32,
    entry: Option<Entry<E>>,
}

/// The scheduler manages timed events
#[derive(Debug, Clone)]
pub struct Scheduler<E> {
    slots: Vec<Slot<E>>,
    free: Vec<u32>,
    /// Pending events ordered by (fire_time, seq)
    queue: BTreeMap<(u64, u64), u32>,
    /// Current time in base ticks
    now: u64,
    /// Insertion counter for FIFO tie-break
    next_seq: u64,
}

impl<E: Copy> Scheduler<E> {
    /// Create a new scheduler at time 0
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            queue: BTreeMap::new(),
            now: 0,
            next_seq: 0,
        }
    }

    /// Reset the scheduler: drop every event and rewind time.
    /// Outstanding handles become invalid.
    pub fn reset(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.entry.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.queue.clear();
        self.now = 0;
        self.next_seq = 0;
    }

    /// Current machine time in base ticks
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Number of pending events
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Fire time of the earliest pending event
    pub fn next_fire_time(&self) -> Option<u64> {
        self.queue.keys().next().map(|&(time, _)| time)
    }

    /// Schedule a one-shot event `delay` base ticks from now
    pub fn schedule(&mut self, delay: u64, event: E) -> EventHandle {
        self.insert(self.now.saturating_add(delay), 0, event)
    }

    /// Schedule a one-shot event at an absolute time.
    /// Times in the past fire on the next drain.
    pub fn schedule_at(&mut self, time: u64, event: E) -> EventHandle {
        self.insert(time.max(self.now), 0, event)
    }

    /// Schedule a recurring event, first firing `delay` from now
    pub fn schedule_periodic(&mut self, delay: u64, period: u64, event: E) -> Result<EventHandle> {
        self.schedule_periodic_at(self.now.saturating_add(delay), period, event)
    }

    /// Schedule a recurring event, first firing at an absolute time
    pub fn schedule_periodic_at(&mut self, time: u64, period: u64, event: E) -> Result<EventHandle> {
        if period == 0 {
            return Err(DeviceError::ZeroPeriod);
        }
        Ok(self.insert(time.max(self.now), period, event))
    }

    fn insert(&mut self, fire_time: u64, period: u64, event: E) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot { generation: 0, entry: None });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(Entry { event, fire_time, seq, period });
        self.queue.insert((fire_time, seq), index);

        EventHandle { index, generation: slot.generation }
    }

    fn live_entry(&self, handle: EventHandle) -> Option<&Entry<E>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Cancel a pending event. Returns false for stale or unknown handles.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        let Some(entry) = self.live_entry(handle) else {
            return false;
        };
        let key = (entry.fire_time, entry.seq);
        self.queue.remove(&key);
        self.release(handle.index);
        true
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
    }

    /// Check if a handle still names a pending event
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live_entry(handle).is_some()
    }

    /// Absolute fire time of a pending event
    pub fn fire_time(&self, handle: EventHandle) -> Option<u64> {
        self.live_entry(handle).map(|entry| entry.fire_time)
    }

    /// Base ticks remaining until a pending event fires (0 if due or gone)
    pub fn remaining(&self, handle: EventHandle) -> u64 {
        self.fire_time(handle)
            .map(|time| time.saturating_sub(self.now))
            .unwrap_or(0)
    }

    /// Take the earliest event due at or before `target`.
    ///
    /// Time moves to the event's fire time. Recurring events are re-armed at
    /// fire_time + period before being returned, so the handler may cancel
    /// them with the same handle. Events scheduled by the handler that are
    /// still due by `target` are returned by later calls.
    pub fn next_due(&mut self, target: u64) -> Option<Fired<E>> {
        let (&(fire_time, seq), &index) = self.queue.iter().next()?;
        if fire_time > target {
            return None;
        }
        self.queue.remove(&(fire_time, seq));
        self.now = self.now.max(fire_time);

        let generation = self.slots[index as usize].generation;
        let handle = EventHandle { index, generation };
        let entry = self.slots[index as usize]
            .entry
            .as_mut()
            .expect("queued slot holds an entry");
        let event = entry.event;

        if entry.period > 0 {
            entry.fire_time = fire_time + entry.period;
            entry.seq = self.next_seq;
            self.next_seq += 1;
            self.queue.insert((entry.fire_time, entry.seq), index);
        } else {
            self.release(index);
        }

        Some(Fired { handle, event, fire_time })
    }

    /// Move time forward to `target` after every due event has been taken.
    pub fn settle(&mut self, target: u64) {
        debug_assert!(
            self.next_fire_time().map_or(true, |time| time > target),
            "settle() with events still due"
        );
        self.now = self.now.max(target);
    }

    /// Fire every event due at or before `target`, in order, then move time to
    /// `target`. The handler may schedule or cancel events.
    pub fn advance_to<F>(&mut self, target: u64, mut handler: F)
    where
        F: FnMut(&mut Self, Fired<E>),
    {
        while let Some(fired) = self.next_due(target) {
            handler(self, fired);
        }
        self.settle(target);
    }
}

// ========== State Persistence ==========

impl<E: EventCode> Scheduler<E> {
    /// Header: now(8) + next_seq(8) + slot count(4)
    const HEADER_SIZE: usize = 20;
    /// Per slot: generation(4) + active(1) + event(4) + fire_time(8) + seq(8) + period(8)
    const SLOT_SIZE: usize = 33;

    /// Size of the current snapshot in bytes
    pub fn snapshot_size(&self) -> usize {
        Self::HEADER_SIZE + self.slots.len() * Self::SLOT_SIZE
    }

    /// Save scheduler state to bytes. Handles stay valid across a reload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.snapshot_size());
        buf.extend_from_slice(&self.now.to_le_bytes());
        buf.extend_from_slice(&self.next_seq.to_le_bytes());
        buf.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());

        for slot in &self.slots {
            buf.extend_from_slice(&slot.generation.to_le_bytes());
            match &slot.entry {
                Some(entry) => {
                    buf.push(1);
                    buf.extend_from_slice(&entry.event.code().to_le_bytes());
                    buf.extend_from_slice(&entry.fire_time.to_le_bytes());
                    buf.extend_from_slice(&entry.seq.to_le_bytes());
                    buf.extend_from_slice(&entry.period.to_le_bytes());
                }
                None => buf.extend_from_slice(&[0; Self::SLOT_SIZE - 4]),
            }
        }

        buf
    }

    /// Load scheduler state from bytes. Returns the number of bytes consumed.
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        let mut r = crate::snapshot::Reader::new(buf);
        let now = r.u64()?;
        let next_seq = r.u64()?;
        let count = r.u32()? as usize;

        let mut slots = Vec::with_capacity(count.min(buf.len() / Self::SLOT_SIZE));
        let mut free = Vec::new();
        let mut queue = BTreeMap::new();

        for index in 0..count {
            let generation = r.u32()?;
            let active = r.u8()? != 0;
            let code = r.u32()?;
            let fire_time = r.u64()?;
            let seq = r.u64()?;
            let period = r.u64()?;

            let entry = if active {
                let event = E::from_code(code).ok_or(DeviceError::CorruptSnapshot("event code"))?;
                if queue.insert((fire_time, seq), index as u32).is_some() {
                    return Err(DeviceError::CorruptSnapshot("duplicate event key"));
                }
                Some(Entry { event, fire_time, seq, period })
            } else {
                free.push(index as u32);
                None
            };
            slots.push(Slot { generation, entry });
        }

        free.reverse();

        self.slots = slots;
        self.free = free;
        self.queue = queue;
        self.now = now;
        self.next_seq = next_seq;
        Ok(r.position())
    }
}

impl<E: Copy> Default for Scheduler<E> {
    fn default() -> Self {
        Self::new()
    }
}
