//! Emulator supervisor.
//!
//! [`Emu`] wires the whole machine together: it builds the clock, the
//! MMU over a fresh backing store, one [`Core`] per configured core, and
//! the process arena, and it owns the optional random-process generator
//! thread. Admission assigns monotonically increasing process ids and
//! routes each process to core `pid % core_count`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::error;
use rand::Rng;

use crate::clock::Clock;
use crate::config::Config;
use crate::cpu::Core;
use crate::inst::{Instruction, Operand};
use crate::memory::BackingStore;
use crate::mmu::{MemoryStats, Mmu};
use crate::parser;
use crate::pcb::{Pcb, ProcessSnapshot, ProcessState, ProcessTable};
use crate::stats::CpuTimeline;

/// Admission path shared between the public API and the generator
/// thread. The lock serializes id assignment, arena insertion and core
/// enqueueing, so processes admitted in order also queue in order.
struct Admission {
    cores: Arc<Vec<Core>>,
    table: Arc<ProcessTable>,
    next_pid: Mutex<u64>,
}

impl Admission {
    fn admit(
        &self,
        name: Option<String>,
        memory_required: usize,
        text: Vec<Instruction>,
    ) -> crate::Result<u64> {
        let mut next = self.next_pid.lock().unwrap();
        let pid = *next;
        *next += 1;

        let name = name.unwrap_or_else(|| format!("Process_{pid}"));
        self.table.insert(Pcb::new(pid, name, memory_required, text));
        self.cores[pid as usize % self.cores.len()].assign(pid)?;
        Ok(pid)
    }
}

/// The emulator: cores, MMU, process arena and generator.
pub struct Emu {
    config: Config,
    clock: Arc<Clock>,
    mmu: Arc<Mmu>,
    table: Arc<ProcessTable>,
    timeline: Arc<CpuTimeline>,
    cores: Arc<Vec<Core>>,
    admission: Arc<Admission>,
    generator_running: Arc<AtomicBool>,
    generator: Mutex<Option<JoinHandle<()>>>,
}

impl Emu {
    /// Build an emulator with its own clock at the default tick period.
    pub fn new(config: Config) -> crate::Result<Self> {
        let clock = Arc::new(Clock::new());
        clock.start();
        Self::with_clock(config, clock)
    }

    /// Build an emulator over a caller-provided clock. The clock must be
    /// ticking (or be driven by hand) for the cores to make progress.
    pub fn with_clock(config: Config, clock: Arc<Clock>) -> crate::Result<Self> {
        let store = BackingStore::create(&config.backing_store)?;
        let mmu = Arc::new(Mmu::new(config.frame_size(), config.total_memory(), store));
        let table = Arc::new(ProcessTable::new());
        let timeline = Arc::new(CpuTimeline::new());

        let mut cores = Vec::with_capacity(config.num_cores);
        for id in 0..config.num_cores {
            cores.push(Core::spawn(
                id,
                config.scheduler,
                config.delay_per_execution,
                config.quantum_cycles,
                Arc::clone(&clock),
                Arc::clone(&mmu),
                Arc::clone(&table),
                Arc::clone(&timeline),
            )?);
        }
        let cores = Arc::new(cores);

        let admission = Arc::new(Admission {
            cores: Arc::clone(&cores),
            table: Arc::clone(&table),
            next_pid: Mutex::new(0),
        });

        Ok(Self {
            config,
            clock,
            mmu,
            table,
            timeline,
            cores,
            admission,
            generator_running: Arc::new(AtomicBool::new(false)),
            generator: Mutex::new(None),
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Admit a process with an explicit program.
    pub fn admit(
        &self,
        name: &str,
        memory_required: usize,
        text: Vec<Instruction>,
    ) -> crate::Result<u64> {
        self.admission.admit(Some(name.to_string()), memory_required, text)
    }

    /// Admit a process whose program is instruction source text.
    pub fn admit_source(
        &self,
        name: &str,
        memory_required: usize,
        source: &str,
    ) -> crate::Result<u64> {
        let text = parser::parse_program(source);
        self.admit(name, memory_required, text)
    }

    /// Admit a process with a sample program: a random-length run of
    /// `PRINT("Hello World!")` instructions.
    pub fn admit_random(&self, name: &str, memory_required: usize) -> crate::Result<u64> {
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(self.config.min_instructions..=self.config.max_instructions);
        let text = (0..count)
            .map(|_| Instruction::Print {
                message: "Hello World!".into(),
                variable: None,
            })
            .collect();
        self.admit(name, memory_required, text)
    }

    /// Start the batch process generator: every
    /// `batch-process-frequency` ticks it admits `Process_<n>` with a
    /// random program and a random power-of-two memory requirement.
    /// Starting a running generator is a no-op.
    pub fn start_generator(&self) -> crate::Result<()> {
        if self.generator_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = Arc::clone(&self.generator_running);
        let clock = Arc::clone(&self.clock);
        let admission = Arc::clone(&self.admission);
        let batch = self.config.batch_process_frequency;
        let instructions = self.config.min_instructions..=self.config.max_instructions;
        let memory_exponents =
            self.config.min_memory_per_process..=self.config.max_memory_per_process;

        let handle = thread::Builder::new()
            .name("generator".into())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                while running.load(Ordering::SeqCst) {
                    clock.wait(batch);
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let count = rng.gen_range(instructions.clone());
                    let text = random_program(&mut rng, count as usize);
                    let memory = 1usize << rng.gen_range(memory_exponents.clone());
                    if let Err(err) = admission.admit(None, memory, text) {
                        error!("generator: admission failed: {err}");
                        break;
                    }
                }
            })?;

        *self.generator.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the generator thread and wait for it to exit.
    pub fn stop_generator(&self) {
        self.generator_running.store(false, Ordering::SeqCst);
        let handle = self.generator.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether a process with `name` was ever admitted.
    pub fn is_contained(&self, name: &str) -> bool {
        self.table.find_by_name(name).is_some()
    }

    /// Whether `name` exists and has not terminated.
    pub fn is_running(&self, name: &str) -> bool {
        self.table
            .find_by_name(name)
            .and_then(|pid| self.table.state_of(pid))
            .map(|state| state != ProcessState::Terminated)
            .unwrap_or(false)
    }

    /// Log text of the process named `name`, with its id and state.
    pub fn process_log(&self, name: &str) -> Option<(u64, ProcessState, String)> {
        let pid = self.table.find_by_name(name)?;
        let state = self.table.state_of(pid)?;
        let log = self.table.log_of(pid)?;
        Some((pid, state, log))
    }

    /// Observable state of every admitted process.
    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        self.table.snapshot()
    }

    /// Mean of all cores' window utilizations, in percent.
    pub fn average_utilization(&self) -> f64 {
        let total: f64 = self.cores.iter().map(Core::utilization).sum();
        total / self.cores.len() as f64
    }

    /// `(busy, idle)` core counts.
    pub fn cores_used(&self) -> (usize, usize) {
        let used = self.cores.iter().filter(|core| core.is_busy()).count();
        (used, self.cores.len() - used)
    }

    /// Memory counters.
    pub fn memory_stats(&self) -> MemoryStats {
        self.mmu.stats()
    }

    /// `(active, total)` CPU ticks across all cores since startup.
    pub fn cpu_ticks(&self) -> (usize, usize) {
        self.timeline.query()
    }

    /// Name and resident memory of the process on each busy core.
    pub fn running_processes_memory(&self) -> Vec<(String, usize)> {
        self.cores
            .iter()
            .filter_map(|core| core.current_process())
            .map(|(pid, name)| (name, self.mmu.resident_bytes(pid)))
            .collect()
    }

    /// Stop everything: the generator, then the cores (instructions in
    /// flight complete first), then the clock. Idempotent.
    pub fn shutdown(&self) {
        self.stop_generator();
        for core in self.cores.iter() {
            core.shutdown();
        }
        // The clock must keep ticking while workers drain out of their
        // final waits.
        for core in self.cores.iter() {
            core.join();
        }
        self.clock.stop();
    }
}

impl Drop for Emu {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Random program mix used by the generator: arithmetic, declares,
/// prints, memory traffic and short sleeps. No `FOR` loops are generated.
fn random_program(rng: &mut impl Rng, count: usize) -> Vec<Instruction> {
    (0..count).map(|_| random_instruction(rng)).collect()
}

fn random_instruction(rng: &mut impl Rng) -> Instruction {
    let dest = random_identifier(rng);
    match rng.gen_range(0..7) {
        0 => Instruction::Add {
            dest,
            first: Operand::Literal(rng.gen_range(0..100)),
            second: Operand::Literal(rng.gen_range(0..100)),
        },
        1 => Instruction::Subtract {
            dest,
            first: Operand::Literal(rng.gen_range(0..100)),
            second: Operand::Literal(rng.gen_range(0..100)),
        },
        2 => Instruction::Declare {
            name: dest,
            value: Some(rng.gen_range(0..100)),
        },
        3 => Instruction::Print {
            message: dest,
            variable: None,
        },
        4 => Instruction::Read {
            dest,
            address: rng.gen_range(0..0xFFFF),
        },
        5 => Instruction::Write {
            address: rng.gen_range(0..0xFFFF),
            value: rng.gen_range(0..100),
        },
        _ => Instruction::Sleep {
            ticks: rng.gen_range(0..10),
        },
    }
}

/// A single uppercase letter. Collisions are welcome: they make the
/// generated programs share variables.
fn random_identifier(rng: &mut impl Rng) -> String {
    let letter = (b'A' + rng.gen_range(0..26u8)) as char;
    letter.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let mut config = Config::default();
        config.memory_per_frame = 4; // 16-byte frames
        config.max_overall_memory = 8; // 256 bytes, 16 slots
        config.backing_store = std::env::temp_dir().join(format!(
            "osmux-emu-test-{}-{n}.txt",
            process::id()
        ));
        config
    }

    fn fast_emu(config: Config) -> Emu {
        let clock = Arc::new(Clock::new());
        clock.start_with_period(Duration::from_millis(1));
        Emu::with_clock(config, clock).expect("build emulator")
    }

    fn wait_until(emu: &Emu, name: &str, terminated: bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while emu.is_running(name) == terminated {
            assert!(Instant::now() < deadline, "timed out waiting on {name}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_admit_and_run() {
        let emu = fast_emu(test_config());
        emu.admit_source("job", 16, "DECLARE(X, 1); PRINT(\"x=\", X)")
            .expect("admit");

        assert!(emu.is_contained("job"));
        wait_until(&emu, "job", true);

        let (pid, state, log) = emu.process_log("job").expect("log");
        assert_eq!(pid, 0);
        assert_eq!(state, ProcessState::Terminated);
        assert!(log.contains("x=1"));
    }

    #[test]
    fn test_pids_route_round_robin_over_cores() {
        let mut config = test_config();
        config.num_cores = 2;
        let emu = fast_emu(config);

        for i in 0..4 {
            emu.admit(&format!("p{i}"), 16, Vec::new()).expect("admit");
        }

        let snapshot = emu.snapshot();
        assert_eq!(snapshot.len(), 4);
        for (i, entry) in snapshot.iter().enumerate() {
            assert_eq!(entry.id, i as u64);
            assert_eq!(entry.name, format!("p{i}"));
        }
    }

    #[test]
    fn test_unknown_process_queries() {
        let emu = fast_emu(test_config());
        assert!(!emu.is_contained("nope"));
        assert!(!emu.is_running("nope"));
        assert!(emu.process_log("nope").is_none());
    }

    #[test]
    fn test_generator_admits_processes() {
        let mut config = test_config();
        config.min_instructions = 1;
        config.max_instructions = 3;
        let emu = fast_emu(config);

        emu.start_generator().expect("start generator");
        let deadline = Instant::now() + Duration::from_secs(10);
        while emu.snapshot().len() < 2 {
            assert!(Instant::now() < deadline, "generator admitted nothing");
            thread::sleep(Duration::from_millis(5));
        }
        emu.stop_generator();

        let snapshot = emu.snapshot();
        assert!(snapshot.iter().any(|p| p.name == "Process_0"));
    }

    #[test]
    fn test_admit_random_length_within_bounds() {
        let mut config = test_config();
        config.min_instructions = 2;
        config.max_instructions = 5;
        let emu = fast_emu(config);
        emu.admit_random("hello", 16).expect("admit");

        wait_until(&emu, "hello", true);
        let (_, _, log) = emu.process_log("hello").expect("log");
        let prints = log.matches("Hello World!").count();
        assert!((2..=5).contains(&prints), "got {prints} prints");
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let emu = fast_emu(test_config());
        emu.shutdown();
        emu.shutdown();
    }
}
