//! Process control blocks and the process arena.
//!
//! The supervisor owns every PCB in a [`ProcessTable`] indexed by process
//! id (ids are assigned monotonically from zero, so the arena is a plain
//! vector). Cores hold only process ids in their ready queues and reach
//! the PCB through short-lived table operations; nothing keeps a PCB
//! reference across a clock wait. The program text is immutable after
//! admission, so cores take a cheap `Arc` snapshot of it at the start of
//! a turn.

use std::sync::{Arc, Mutex};

use crate::inst::Instruction;
use crate::store::LogicalStore;

/// Scheduling state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Admitted but not yet enqueued.
    New,
    /// Waiting in a core's ready queue.
    Ready,
    /// Executing on a core.
    Running,
    /// Blocked in a `SLEEP` instruction.
    Waiting,
    /// Finished; frames released.
    Terminated,
}

/// The execution state of a process: its variable store and program text.
#[derive(Debug, Clone)]
pub struct Process {
    /// Per-process logical variable table.
    pub store: LogicalStore,
    /// The text section. Immutable once admitted.
    pub text: Arc<Vec<Instruction>>,
}

/// Process control block.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub id: u64,
    pub name: String,
    pub state: ProcessState,
    /// Index of the next top-level instruction to execute.
    pub program_counter: usize,
    pub priority: usize,
    /// Bytes of virtual memory the process was admitted with.
    pub memory_required: usize,
    /// Output log; `PRINT` and execution diagnostics append here.
    pub log: String,
    pub process: Process,
}

impl Pcb {
    /// Create a new PCB in the `New` state.
    pub fn new(id: u64, name: String, memory_required: usize, text: Vec<Instruction>) -> Self {
        Self {
            id,
            name,
            state: ProcessState::New,
            program_counter: 0,
            priority: 0,
            memory_required,
            log: String::from("Log:\n"),
            process: Process {
                store: LogicalStore::new(),
                text: Arc::new(text),
            },
        }
    }

    /// Append one line to the process log.
    pub fn append_log(&mut self, line: &str) {
        self.log.push_str(line);
        self.log.push('\n');
    }
}

/// Observable state of one process, for listings and reports.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub id: u64,
    pub name: String,
    pub state: ProcessState,
}

/// Supervisor-owned arena of all PCBs, indexed by process id.
pub struct ProcessTable {
    inner: Mutex<Vec<Pcb>>,
}

impl ProcessTable {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
        }
    }

    /// Number of processes ever admitted.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Whether no process was admitted yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a freshly admitted PCB. Its id must be the next index.
    pub fn insert(&self, pcb: Pcb) {
        let mut pcbs = self.inner.lock().unwrap();
        debug_assert_eq!(pcb.id as usize, pcbs.len());
        pcbs.push(pcb);
    }

    /// Run `f` on the PCB of `pid` under the arena lock. Keep `f` short;
    /// it must never wait on the clock or enqueue to a core.
    pub fn with<R>(&self, pid: u64, f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
        let mut pcbs = self.inner.lock().unwrap();
        pcbs.get_mut(pid as usize).map(f)
    }

    /// Set the scheduling state of `pid`.
    pub fn set_state(&self, pid: u64, state: ProcessState) {
        self.with(pid, |pcb| pcb.state = state);
    }

    /// Current state of `pid`.
    pub fn state_of(&self, pid: u64) -> Option<ProcessState> {
        self.with(pid, |pcb| pcb.state)
    }

    /// Name of `pid`.
    pub fn name_of(&self, pid: u64) -> Option<String> {
        self.with(pid, |pcb| pcb.name.clone())
    }

    /// Program counter of `pid`.
    pub fn program_counter_of(&self, pid: u64) -> Option<usize> {
        self.with(pid, |pcb| pcb.program_counter)
    }

    /// Memory requirement of `pid` in bytes.
    pub fn memory_required_of(&self, pid: u64) -> Option<usize> {
        self.with(pid, |pcb| pcb.memory_required)
    }

    /// Snapshot of the program text of `pid`.
    pub fn program_of(&self, pid: u64) -> Option<Arc<Vec<Instruction>>> {
        self.with(pid, |pcb| Arc::clone(&pcb.process.text))
    }

    /// Log text of `pid`.
    pub fn log_of(&self, pid: u64) -> Option<String> {
        self.with(pid, |pcb| pcb.log.clone())
    }

    /// Id of the process named `name`, if any.
    pub fn find_by_name(&self, name: &str) -> Option<u64> {
        let pcbs = self.inner.lock().unwrap();
        pcbs.iter().find(|pcb| pcb.name == name).map(|pcb| pcb.id)
    }

    /// Observable state of every process, in admission order.
    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let pcbs = self.inner.lock().unwrap();
        pcbs.iter()
            .map(|pcb| ProcessSnapshot {
                id: pcb.id,
                name: pcb.name.clone(),
                state: pcb.state,
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
