//! Emulated CPU cores: per-core scheduler and instruction executor.
//!
//! Every core runs a dedicated scheduler thread over its own FIFO ready
//! queue of process ids. Under FCFS a dispatched process executes to
//! completion; under round-robin it executes at most `quantum`
//! instructions per turn and is re-enqueued until its program counter
//! reaches the end of the text section. Frames are released only at
//! termination; between round-robin turns they stay resident and age
//! out naturally through LRU eviction.
//!
//! Each instruction consumes `delay_per_execution + 1` clock ticks before
//! it takes effect (the `+ 1` guarantees forward progress at zero delay);
//! every consumed tick is recorded as a busy sample. Idle loops and
//! `SLEEP` record idle samples. The sliding window of these samples
//! yields the core's recent utilization percentage.
//!
//! Lock discipline: the ready-queue lock is never held across a wait or
//! an MMU call, and the process-table lock is taken only after all tick
//! waits of an instruction, in the order table → MMU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};

use crate::clock::Clock;
use crate::config::SchedulerKind;
use crate::inst::{Instruction, Operand};
use crate::mmu::Mmu;
use crate::pcb::{ProcessState, ProcessTable};
use crate::stats::{CpuTimeline, UtilizationWindow};
use crate::store::{DeclareOutcome, LogicalStore};

/// Ticks an FCFS core sleeps when its ready queue is empty.
const IDLE_WAIT_TICKS: u64 = 10;

/// One emulated core and its scheduler thread.
pub struct Core {
    shared: Arc<CoreShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct CoreShared {
    id: usize,
    algorithm: SchedulerKind,
    quantum: u64,
    /// `delay_per_execution + 1` ticks consumed by every instruction.
    actual_delay: u64,
    running: AtomicBool,
    busy: AtomicBool,
    ready: Mutex<VecDeque<u64>>,
    current: Mutex<Option<u64>>,
    window: Mutex<UtilizationWindow>,
    timeline_track: usize,
    clock: Arc<Clock>,
    mmu: Arc<Mmu>,
    table: Arc<ProcessTable>,
    timeline: Arc<CpuTimeline>,
}

impl Core {
    /// Create a core and start its scheduler thread.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: usize,
        algorithm: SchedulerKind,
        delay_per_execution: u64,
        quantum: u64,
        clock: Arc<Clock>,
        mmu: Arc<Mmu>,
        table: Arc<ProcessTable>,
        timeline: Arc<CpuTimeline>,
    ) -> crate::Result<Self> {
        let shared = Arc::new(CoreShared {
            id,
            algorithm,
            quantum,
            actual_delay: delay_per_execution + 1,
            running: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            ready: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            window: Mutex::new(UtilizationWindow::new()),
            timeline_track: timeline.add_track(),
            clock,
            mmu,
            table,
            timeline,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("core-{id}"))
            .spawn(move || worker_shared.run())?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Admit a process to this core: mark it ready, create its page
    /// table, and enqueue it.
    pub fn assign(&self, pid: u64) -> crate::Result<()> {
        let Some(memory_required) = self.shared.table.memory_required_of(pid) else {
            warn!("core {}: assign of unknown process {pid}", self.shared.id);
            return Ok(());
        };

        self.shared.table.set_state(pid, ProcessState::Ready);
        self.shared.mmu.create_table(pid, memory_required)?;
        self.shared.ready.lock().unwrap().push_back(pid);
        Ok(())
    }

    /// Recent utilization over the sliding sample window, in percent.
    pub fn utilization(&self) -> f64 {
        self.shared.window.lock().unwrap().percent()
    }

    /// Whether the core is currently executing a process.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Id and name of the process currently on this core.
    pub fn current_process(&self) -> Option<(u64, String)> {
        let pid = (*self.shared.current.lock().unwrap())?;
        let name = self.shared.table.name_of(pid)?;
        Some((pid, name))
    }

    /// Ask the scheduler thread to stop. The instruction in flight runs
    /// to completion; no new instruction begins.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// Join the scheduler thread. Call [`Core::shutdown`] first and keep
    /// the clock ticking until this returns.
    pub fn join(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }
}

impl CoreShared {
    fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            let next = self.ready.lock().unwrap().pop_front();

            let Some(pid) = next else {
                // Nothing to do: sleep and record the idle period. RR
                // polls every tick so a re-enqueued process is picked up
                // promptly.
                let ticks = match self.algorithm {
                    SchedulerKind::Fcfs => IDLE_WAIT_TICKS,
                    SchedulerKind::RoundRobin => 1,
                };
                self.clock.wait(ticks);
                self.record(false);
                continue;
            };

            self.busy.store(true, Ordering::SeqCst);
            match self.algorithm {
                SchedulerKind::Fcfs => self.run_to_completion(pid),
                SchedulerKind::RoundRobin => self.run_slice(pid),
            }
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    /// FCFS turn: execute every remaining instruction, then terminate.
    fn run_to_completion(&self, pid: u64) {
        if !self.load_or_requeue(pid) {
            return;
        }

        *self.current.lock().unwrap() = Some(pid);
        self.table.set_state(pid, ProcessState::Running);

        if let Some(program) = self.table.program_of(pid) {
            let start = self.table.program_counter_of(pid).unwrap_or(0);
            for index in start..program.len() {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.execute(pid, &program[index]);
                self.table.with(pid, |pcb| pcb.program_counter += 1);
            }
        }

        self.mmu.release(pid);
        self.table.set_state(pid, ProcessState::Terminated);
        *self.current.lock().unwrap() = None;
    }

    /// Round-robin turn: execute at most `quantum` instructions. Frames
    /// stay resident between turns; release happens only at the terminal
    /// program counter.
    fn run_slice(&self, pid: u64) {
        if !self.load_or_requeue(pid) {
            return;
        }

        *self.current.lock().unwrap() = Some(pid);
        self.table.set_state(pid, ProcessState::Running);

        let mut finished = false;
        if let Some(program) = self.table.program_of(pid) {
            let start = self.table.program_counter_of(pid).unwrap_or(0);
            let end = (start + self.quantum as usize).min(program.len());
            for index in start..end {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                self.execute(pid, &program[index]);
                self.table.with(pid, |pcb| pcb.program_counter += 1);
            }
            finished = self.table.program_counter_of(pid).unwrap_or(0) >= program.len();
        }

        if finished {
            self.mmu.release(pid);
            self.table.set_state(pid, ProcessState::Terminated);
        } else {
            self.table.set_state(pid, ProcessState::Ready);
            self.ready.lock().unwrap().push_back(pid);
        }
        *self.current.lock().unwrap() = None;
    }

    /// Fault the process's pages in. On insufficient frames the process
    /// goes back to the ready queue for a later retry.
    fn load_or_requeue(&self, pid: u64) -> bool {
        if self.mmu.load_process(pid) {
            return true;
        }
        self.table.set_state(pid, ProcessState::Ready);
        self.ready.lock().unwrap().push_back(pid);
        false
    }

    /// Execute one instruction against the process's state.
    ///
    /// `FOR` bodies are inlined and atomic with respect to preemption:
    /// the running flag is only consulted between top-level instructions,
    /// never between body iterations.
    fn execute(&self, pid: u64, instruction: &Instruction) {
        trace!("core {}: process {pid}: {}", self.id, instruction.mnemonic());
        self.clock.wait(self.actual_delay);
        for _ in 0..self.actual_delay {
            self.record(true);
        }

        match instruction {
            Instruction::Declare { name, value } => {
                self.table.with(pid, |pcb| {
                    let outcome = pcb
                        .process
                        .store
                        .insert_with_value(name, value.unwrap_or(0));
                    match outcome {
                        DeclareOutcome::Inserted | DeclareOutcome::AlreadyPresent => {}
                        DeclareOutcome::Full => {
                            pcb.append_log("DECLARE aborted: variable store full");
                        }
                    }
                });
            }
            Instruction::Add {
                dest,
                first,
                second,
            } => self.arithmetic(pid, "ADD", dest, first, second, true),
            Instruction::Subtract {
                dest,
                first,
                second,
            } => self.arithmetic(pid, "SUBTRACT", dest, first, second, false),
            Instruction::Print { message, variable } => {
                self.table.with(pid, |pcb| match variable {
                    Some(name) => match pcb.process.store.value_of(name) {
                        Some(value) => pcb.append_log(&format!("{message}{value}")),
                        None => {
                            pcb.append_log(&format!("PRINT aborted: unknown variable {name}"))
                        }
                    },
                    None => pcb.append_log(message),
                });
            }
            Instruction::Read { dest, address } => {
                let address = format!("{address:04X}");
                self.table.with(pid, |pcb| {
                    match self.mmu.read(pid, &address, 2) {
                        Some(hex) => {
                            let value = u16::from_str_radix(&hex, 16).unwrap_or_default();
                            // The destination auto-declares like any
                            // other written variable.
                            if pcb.process.store.insert_with_value(dest, 0)
                                == DeclareOutcome::Full
                            {
                                pcb.append_log("READ aborted: variable store full");
                            } else {
                                pcb.process.store.set_value(dest, value);
                            }
                        }
                        None => {
                            pcb.append_log(&format!("READ aborted: invalid address {address}"))
                        }
                    }
                });
            }
            Instruction::Write { address, value } => {
                let address = format!("{address:04X}");
                let data = format!("{value:04X}");
                self.table.with(pid, |pcb| {
                    if !self.mmu.write(pid, &address, &data) {
                        pcb.append_log(&format!("WRITE aborted: invalid address {address}"));
                    }
                });
            }
            Instruction::Sleep { ticks } => {
                self.table.set_state(pid, ProcessState::Waiting);
                self.clock.wait(u64::from(*ticks));
                self.table.set_state(pid, ProcessState::Running);
                for _ in 0..*ticks {
                    self.record(false);
                }
            }
            Instruction::For { body, count } => {
                for _ in 0..*count {
                    for inner in body {
                        self.execute(pid, inner);
                    }
                }
            }
        }
    }

    /// Wrapping 16-bit arithmetic with auto-declared variable operands.
    fn arithmetic(
        &self,
        pid: u64,
        mnemonic: &str,
        dest: &str,
        first: &Operand,
        second: &Operand,
        add: bool,
    ) {
        self.table.with(pid, |pcb| {
            if pcb.process.store.insert_with_value(dest, 0) == DeclareOutcome::Full {
                pcb.append_log(&format!("{mnemonic} aborted: variable store full"));
                return;
            }

            let Some(a) = resolve(&mut pcb.process.store, first) else {
                pcb.append_log(&format!("{mnemonic} aborted: variable store full"));
                return;
            };
            let Some(b) = resolve(&mut pcb.process.store, second) else {
                pcb.append_log(&format!("{mnemonic} aborted: variable store full"));
                return;
            };

            let result = if add {
                a.wrapping_add(b)
            } else {
                a.wrapping_sub(b)
            };
            pcb.process.store.set_value(dest, result);
        });
    }

    /// Record one busy/idle sample in the window and the system timeline.
    fn record(&self, busy: bool) {
        self.window.lock().unwrap().record(busy);
        self.timeline.record(self.timeline_track, busy);
    }
}

/// Resolve an operand to its value. Variable operands auto-declare with
/// value zero; `None` means the store is full and the instruction must
/// abort without mutating state.
fn resolve(store: &mut LogicalStore, operand: &Operand) -> Option<u16> {
    match operand {
        Operand::Literal(value) => Some(*value),
        Operand::Variable(name) => {
            if store.insert_with_value(name, 0) == DeclareOutcome::Full {
                return None;
            }
            store.value_of(name)
        }
    }
}
