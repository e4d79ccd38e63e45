//! Print the interrupt line edges of a machine with beam positions.
//!
//! Usage: cargo run --example irq_trace [preset|config.json] [frames]
//! Presets: gridlee (default), c64_cpm, lcd_panel

use std::env;
use std::fs;
use std::process;

use chrono::Local;

use emu_devices::cpu::{CpuControl, CpuId, LineId};
use emu_devices::{CpuStates, Machine, MachineConfig};

/// CPU host that prints each line edge as it happens
struct TraceCpus<'a> {
    inner: CpuStates,
    edges: usize,
    machine_name: &'a str,
    screen: Option<emu_devices::ScreenTiming>,
}

impl TraceCpus<'_> {
    fn print(&mut self, cpu: CpuId, line: LineId, asserted: bool) {
        self.edges += 1;
        let beam = self
            .screen
            .map(|s| {
                let p = s.position(self.inner.time());
                format!("frame {:>3} line {:>3} hpos {:>3}", p.frame, p.current_scanline, p.hpos)
            })
            .unwrap_or_default();
        println!(
            "{} {:>14} {} cpu{} {:<10} {}",
            Local::now().format("%H:%M:%S%.3f"),
            self.inner.time(),
            self.machine_name,
            cpu.0,
            format!("{line:?}"),
            if asserted { "ASSERT" } else { "clear" },
        );
        if !beam.is_empty() {
            println!("{:>28}{}", "", beam);
        }
    }
}

impl CpuControl for TraceCpus<'_> {
    fn assert_line(&mut self, cpu: CpuId, line: LineId) {
        self.inner.assert_line(cpu, line);
        self.print(cpu, line, true);
    }

    fn clear_line(&mut self, cpu: CpuId, line: LineId) {
        self.inner.clear_line(cpu, line);
        self.print(cpu, line, false);
    }

    fn set_program_counter(&mut self, cpu: CpuId, address: u32) {
        self.inner.set_program_counter(cpu, address);
    }

    fn halt(&mut self, cpu: CpuId) {
        self.inner.halt(cpu);
    }

    fn run(&mut self, cpu: CpuId) {
        self.inner.run(cpu);
    }

    fn reset(&mut self, cpu: CpuId) {
        self.inner.reset(cpu);
    }

    fn execute_until(&mut self, time: u64) {
        self.inner.execute_until(time);
    }
}

fn load_config(arg: &str) -> Result<MachineConfig, String> {
    match arg {
        "gridlee" => Ok(MachineConfig::gridlee()),
        "c64_cpm" => Ok(MachineConfig::c64_cpm()),
        "lcd_panel" => Ok(MachineConfig::lcd_panel()),
        path => {
            let json = fs::read_to_string(path).map_err(|e| format!("{path}: {e}"))?;
            MachineConfig::from_json(&json).map_err(|e| format!("{path}: {e}"))
        }
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let preset = args.get(1).map_or("gridlee", String::as_str);
    let frames: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2);

    let config = match load_config(preset) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("irq_trace: {e}");
            process::exit(1);
        }
    };
    let mut machine = match Machine::new(&config) {
        Ok(machine) => machine,
        Err(e) => {
            eprintln!("irq_trace: {e}");
            process::exit(1);
        }
    };

    let screen = machine.screen().copied();
    let mut cpus = TraceCpus {
        inner: CpuStates::new(config.cpus.len()),
        edges: 0,
        machine_name: &config.name,
        screen,
    };
    machine.reset(&mut cpus);

    // Without a raster, trace one 60 Hz frame's worth of time per frame
    let frame_ticks = screen.map_or(emu_devices::SCHED_BASE_CLOCK_RATE / 60, |s| s.frame_ticks());
    machine.run_until(frames * frame_ticks, &mut cpus);

    println!(
        "{}: {} line edges in {} frames ({} base ticks)",
        config.name,
        cpus.edges,
        frames,
        machine.now()
    );
}
