//! Configuration file reader.
//!
//! `config.txt` is line-oriented, whitespace-delimited key/value text:
//!
//! ```text
//! num-cores 4
//! scheduling-algorithm RR
//! quantum-cycles 5
//! batch-process-frequency 1
//! min-instructions 100
//! max-instructions 100
//! delay-per-execution 0
//! memory-per-frame 16
//! min-memory-per-process 64
//! max-memory-per-process 64
//! max-overall-memory 1024
//! ```
//!
//! All memory sizes must be powers of two and are stored as exponents.
//! Malformed values are fatal at load time; unknown keys are ignored with
//! a debug log, and a missing file falls back to the defaults.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{EmuError, Result};

/// Default path of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config.txt";

/// Default path of the backing store file.
pub const DEFAULT_BACKING_STORE_PATH: &str = "backing-store.txt";

/// Scheduling algorithm run by every core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// First come, first served: a dispatched process runs to completion.
    Fcfs,
    /// Preemptive round-robin with a per-turn instruction quantum.
    RoundRobin,
}

/// Emulator configuration.
///
/// Memory fields hold the exponent of the configured power-of-two value;
/// use [`Config::frame_size`] and friends for byte counts.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of emulated cores, clamped to `[1, 128]`.
    pub num_cores: usize,
    /// Scheduling algorithm.
    pub scheduler: SchedulerKind,
    /// Round-robin quantum in instructions, clamped to `[1, u32::MAX]`.
    pub quantum_cycles: u64,
    /// Ticks between generator admissions, clamped to `[1, u32::MAX]`.
    pub batch_process_frequency: u64,
    /// Smallest random program length.
    pub min_instructions: u64,
    /// Largest random program length.
    pub max_instructions: u64,
    /// Extra ticks consumed by every instruction.
    pub delay_per_execution: u64,
    /// log2 of the frame size in bytes.
    pub memory_per_frame: u32,
    /// log2 of the smallest per-process memory.
    pub min_memory_per_process: u32,
    /// log2 of the largest per-process memory.
    pub max_memory_per_process: u32,
    /// log2 of the physical memory size in bytes.
    pub max_overall_memory: u32,
    /// Backing store file location. Not a `config.txt` key; set by the
    /// binary's command line (and by tests, which need isolated files).
    pub backing_store: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cores: 1,
            scheduler: SchedulerKind::Fcfs,
            quantum_cycles: 1,
            batch_process_frequency: 1,
            min_instructions: 1,
            max_instructions: 1,
            delay_per_execution: 0,
            memory_per_frame: 6,
            min_memory_per_process: 6,
            max_memory_per_process: 6,
            max_overall_memory: 6,
            backing_store: PathBuf::from(DEFAULT_BACKING_STORE_PATH),
        }
    }
}

impl Config {
    /// Bytes per frame.
    pub fn frame_size(&self) -> usize {
        1usize << self.memory_per_frame
    }

    /// Total physical memory in bytes.
    pub fn total_memory(&self) -> usize {
        1usize << self.max_overall_memory
    }

    /// Load a configuration file.
    ///
    /// A missing file is tolerated (the defaults apply, with a warning);
    /// a present but malformed file is a fatal [`EmuError::Config`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) => {
                warn!("{} not readable ({err}); using defaults", path.display());
                return Ok(Self::default());
            }
        };

        let mut config = Self::default();
        config.parse(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse config text into `self`. Keys may appear in any order; later
    /// occurrences win.
    fn parse(&mut self, text: &str) -> Result<()> {
        for line in text.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let (key, value) = match tokens.as_slice() {
                [] => continue,
                [key, value] => (*key, *value),
                _ => {
                    return Err(EmuError::Config(format!(
                        "expected `key value`, got: {line:?}"
                    )))
                }
            };

            match key {
                "num-cores" => {
                    self.num_cores = parse_number(key, value)?.clamp(1, 128) as usize;
                }
                "scheduling-algorithm" => {
                    self.scheduler = match value {
                        "FCFS" => SchedulerKind::Fcfs,
                        "RR" => SchedulerKind::RoundRobin,
                        other => {
                            return Err(EmuError::Config(format!(
                                "unknown scheduling algorithm {other:?}"
                            )))
                        }
                    };
                }
                "quantum-cycles" => {
                    self.quantum_cycles = parse_number(key, value)?.clamp(1, u32::MAX as u64);
                }
                "batch-process-frequency" => {
                    self.batch_process_frequency =
                        parse_number(key, value)?.clamp(1, u32::MAX as u64);
                }
                "min-instructions" => {
                    self.min_instructions = parse_number(key, value)?.min(u32::MAX as u64);
                }
                "max-instructions" => {
                    self.max_instructions = parse_number(key, value)?.clamp(1, u32::MAX as u64);
                }
                "delay-per-execution" => {
                    self.delay_per_execution = parse_number(key, value)?.min(u32::MAX as u64);
                }
                "memory-per-frame" => {
                    self.memory_per_frame = parse_exponent(key, value)?;
                }
                "min-memory-per-process" => {
                    self.min_memory_per_process = parse_exponent(key, value)?;
                }
                "max-memory-per-process" => {
                    self.max_memory_per_process = parse_exponent(key, value)?;
                }
                "max-overall-memory" => {
                    self.max_overall_memory = parse_exponent(key, value)?;
                }
                other => {
                    debug!("ignoring unknown config key {other:?}");
                }
            }
        }

        Ok(())
    }

    /// Cross-field checks that keep the rest of the emulator free of
    /// degenerate cases (empty random ranges, frames larger than the
    /// physical memory holding them).
    fn validate(&self) -> Result<()> {
        if self.min_instructions > self.max_instructions {
            return Err(EmuError::Config(format!(
                "min-instructions ({}) exceeds max-instructions ({})",
                self.min_instructions, self.max_instructions
            )));
        }
        if self.min_memory_per_process > self.max_memory_per_process {
            return Err(EmuError::Config(format!(
                "min-memory-per-process (2^{}) exceeds max-memory-per-process (2^{})",
                self.min_memory_per_process, self.max_memory_per_process
            )));
        }
        if self.memory_per_frame > self.max_overall_memory {
            return Err(EmuError::Config(format!(
                "memory-per-frame (2^{}) exceeds max-overall-memory (2^{})",
                self.memory_per_frame, self.max_overall_memory
            )));
        }
        Ok(())
    }
}

/// Parse an unsigned decimal value.
fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| EmuError::Config(format!("{key}: {value:?} is not an unsigned number")))
}

/// Parse a power-of-two byte count and return its exponent.
fn parse_exponent(key: &str, value: &str) -> Result<u32> {
    let bytes = parse_number(key, value)?;
    if bytes == 0 || !bytes.is_power_of_two() {
        return Err(EmuError::Config(format!(
            "{key}: {value} is not a power of two"
        )));
    }
    Ok(bytes.trailing_zeros())
}
