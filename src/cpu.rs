//! CPU-stepping abstraction
//!
//! Instruction execution lives outside this crate. Devices only need to drive
//! a CPU's input lines, halt/run it, and occasionally force its program
//! counter; the machine also asks the host to execute up to a deadline.

use serde::Deserialize;

/// Index of a CPU within a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u8);

/// Named CPU input line
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineId {
    Irq,
    Firq,
    Nmi,
    /// Z80-style bus request
    BusRequest,
    /// Wait-state input
    Wait,
    /// Expansion-port DMA request on the host CPU
    Dma,
    Other(u8),
}

impl LineId {
    /// Stable numeric encoding for snapshots
    pub fn code(&self) -> u16 {
        match self {
            LineId::Irq => 0,
            LineId::Firq => 1,
            LineId::Nmi => 2,
            LineId::BusRequest => 3,
            LineId::Wait => 4,
            LineId::Dma => 5,
            LineId::Other(n) => 0x100 | *n as u16,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0 => LineId::Irq,
            1 => LineId::Firq,
            2 => LineId::Nmi,
            3 => LineId::BusRequest,
            4 => LineId::Wait,
            5 => LineId::Dma,
            0x100..=0x1FF => LineId::Other(code as u8),
            _ => return None,
        })
    }
}

/// What devices may do to the CPUs of a machine
pub trait CpuControl {
    fn assert_line(&mut self, cpu: CpuId, line: LineId);
    fn clear_line(&mut self, cpu: CpuId, line: LineId);
    fn set_program_counter(&mut self, cpu: CpuId, address: u32);
    fn halt(&mut self, cpu: CpuId);
    fn run(&mut self, cpu: CpuId);

    /// Pulse the CPU's reset input
    fn reset(&mut self, _cpu: CpuId) {}

    /// Execute every running CPU up to `time` (base ticks). Called by the
    /// machine between events; hosts without CPUs can ignore it.
    fn execute_until(&mut self, _time: u64) {}

    /// Cycles executed so far, for devices keyed by CPU cycle count
    fn total_cycles(&self, _cpu: CpuId) -> u64 {
        0
    }
}

/// Per-CPU state seen by [`CpuStates`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuRecord {
    pub asserted: Vec<LineId>,
    pub pc: Option<u32>,
    pub halted: bool,
    pub resets: u32,
    pub cycles: u64,
}

/// A CPU host with no instruction set: keeps each CPU's current line levels,
/// run state and cycle count, nothing else. Memory use is fixed by the CPU
/// count, so it can run for as long as the host likes (the wasm binding and
/// the demo tools use it).
#[derive(Debug, Clone, Default)]
pub struct CpuStates {
    cpus: Vec<CpuRecord>,
    /// Last time passed to execute_until
    time: u64,
    /// CPU clock used to derive cycle counts from time, if any
    cycle_ticks: Option<u64>,
}

impl CpuStates {
    pub fn new(count: usize) -> Self {
        Self {
            cpus: vec![CpuRecord::default(); count],
            ..Self::default()
        }
    }

    /// Count cycles for every CPU as time / `base_ticks_per_cycle`
    pub fn with_cycle_ticks(mut self, base_ticks_per_cycle: u64) -> Self {
        self.cycle_ticks = Some(base_ticks_per_cycle.max(1));
        self
    }

    /// State of `cpu`; `None` for a CPU no device has touched
    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuRecord> {
        self.cpus.get(cpu.0 as usize)
    }

    pub fn is_asserted(&self, cpu: CpuId, line: LineId) -> bool {
        self.cpu(cpu).is_some_and(|record| record.asserted.contains(&line))
    }

    /// Last time the machine ran the CPUs to
    pub fn time(&self) -> u64 {
        self.time
    }

    fn record(&mut self, cpu: CpuId) -> &mut CpuRecord {
        let index = cpu.0 as usize;
        if index >= self.cpus.len() {
            self.cpus.resize(index + 1, CpuRecord::default());
        }
        &mut self.cpus[index]
    }
}

impl CpuControl for CpuStates {
    fn assert_line(&mut self, cpu: CpuId, line: LineId) {
        let record = self.record(cpu);
        if !record.asserted.contains(&line) {
            record.asserted.push(line);
        }
    }

    fn clear_line(&mut self, cpu: CpuId, line: LineId) {
        self.record(cpu).asserted.retain(|&l| l != line);
    }

    fn set_program_counter(&mut self, cpu: CpuId, address: u32) {
        self.record(cpu).pc = Some(address);
    }

    fn halt(&mut self, cpu: CpuId) {
        self.record(cpu).halted = true;
    }

    fn run(&mut self, cpu: CpuId) {
        self.record(cpu).halted = false;
    }

    fn reset(&mut self, cpu: CpuId) {
        self.record(cpu).resets += 1;
    }

    fn execute_until(&mut self, time: u64) {
        if let Some(ticks) = self.cycle_ticks {
            let elapsed = time.saturating_sub(self.time) / ticks;
            for record in self.cpus.iter_mut().filter(|r| !r.halted) {
                record.cycles += elapsed;
            }
        }
        self.time = self.time.max(time);
    }

    fn total_cycles(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).map_or(0, |r| r.cycles)
    }
}

/// Something that happened to a CPU, in call order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuAction {
    Assert(CpuId, LineId),
    Clear(CpuId, LineId),
    SetPc(CpuId, u32),
    Halt(CpuId),
    Run(CpuId),
    Reset(CpuId),
}

/// [`CpuStates`] that also logs every call in order. The log grows without
/// bound; meant for tests and short traces.
#[derive(Debug, Clone, Default)]
pub struct RecordingCpus {
    states: CpuStates,
    pub actions: Vec<CpuAction>,
}

impl RecordingCpus {
    pub fn new(count: usize) -> Self {
        Self {
            states: CpuStates::new(count),
            actions: Vec::new(),
        }
    }

    pub fn with_cycle_ticks(mut self, base_ticks_per_cycle: u64) -> Self {
        self.states = self.states.with_cycle_ticks(base_ticks_per_cycle);
        self
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuRecord> {
        self.states.cpu(cpu)
    }

    pub fn is_asserted(&self, cpu: CpuId, line: LineId) -> bool {
        self.states.is_asserted(cpu, line)
    }

    pub fn time(&self) -> u64 {
        self.states.time()
    }
}

impl CpuControl for RecordingCpus {
    fn assert_line(&mut self, cpu: CpuId, line: LineId) {
        self.states.assert_line(cpu, line);
        self.actions.push(CpuAction::Assert(cpu, line));
    }

    fn clear_line(&mut self, cpu: CpuId, line: LineId) {
        self.states.clear_line(cpu, line);
        self.actions.push(CpuAction::Clear(cpu, line));
    }

    fn set_program_counter(&mut self, cpu: CpuId, address: u32) {
        self.states.set_program_counter(cpu, address);
        self.actions.push(CpuAction::SetPc(cpu, address));
    }

    fn halt(&mut self, cpu: CpuId) {
        self.states.halt(cpu);
        self.actions.push(CpuAction::Halt(cpu));
    }

    fn run(&mut self, cpu: CpuId) {
        self.states.run(cpu);
        self.actions.push(CpuAction::Run(cpu));
    }

    fn reset(&mut self, cpu: CpuId) {
        self.states.reset(cpu);
        self.actions.push(CpuAction::Reset(cpu));
    }

    fn execute_until(&mut self, time: u64) {
        self.states.execute_until(time);
    }

    fn total_cycles(&self, cpu: CpuId) -> u64 {
        self.states.total_cycles(cpu)
    }
}
