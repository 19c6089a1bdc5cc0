//! System configuration loaded from `config.txt` during `initialize`.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

pub const CONFIG_FILE: &str = "config.txt";

const MIN_CPUS: u32 = 1;
const MAX_CPUS: u32 = 128;

/// Process address-space bounds in bytes. Applies both to `screen` commands
/// and to generated processes.
pub const MIN_PROC_MEM: u32 = 64;
pub const MAX_PROC_MEM: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Fcfs,
    Rr,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Fcfs => write!(f, "fcfs"),
            SchedulerKind::Rr => write!(f, "rr"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Fifo,
    Lru,
}

impl fmt::Display for ReplacementPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplacementPolicy::Fifo => write!(f, "fifo"),
            ReplacementPolicy::Lru => write!(f, "lru"),
        }
    }
}

/// Immutable after a successful `initialize`.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_cpu: u32,
    pub scheduler: SchedulerKind,
    pub quantum_cycles: u32,
    pub batch_process_freq: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    pub delays_per_exec: u32,
    pub max_overall_mem: u32,
    pub mem_per_frame: u32,
    pub min_mem_per_proc: u32,
    pub max_mem_per_proc: u32,
    pub replacement_policy: ReplacementPolicy,
}

impl Config {
    /// Read and validate `path`. Any failure leaves no state behind.
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let cfg = Config::parse(&text)
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(cfg)
    }

    /// Parse whitespace-separated `key value` pairs. Unknown keys are
    /// skipped together with their value token.
    pub fn parse(text: &str) -> Result<Config> {
        let mut num_cpu: u32 = 0;
        let mut scheduler = String::new();
        let mut quantum_cycles: u32 = 0;
        let mut batch_process_freq: u64 = 0;
        let mut min_ins: u32 = 0;
        let mut max_ins: u32 = 0;
        let mut delays_per_exec: u32 = 0;
        let mut max_overall_mem: u32 = 0;
        let mut mem_per_frame: u32 = 0;
        let mut min_mem_per_proc: u32 = 0;
        let mut max_mem_per_proc: u32 = 0;
        let mut replacement_policy = String::new();

        let mut tokens = text.split_whitespace();
        while let Some(key) = tokens.next() {
            let value = match tokens.next() {
                Some(v) => v,
                None => bail!("key '{}' has no value", key),
            };
            match key {
                "num-cpu" => num_cpu = parse_number(key, value)?,
                "scheduler" => scheduler = value.to_string(),
                "quantum-cycles" => quantum_cycles = parse_number(key, value)?,
                "batch-process-freq" => batch_process_freq = parse_number(key, value)?,
                "min-ins" => min_ins = parse_number(key, value)?,
                "max-ins" => max_ins = parse_number(key, value)?,
                "delays-per-exec" => delays_per_exec = parse_number(key, value)?,
                "max-overall-mem" => max_overall_mem = parse_number(key, value)?,
                "mem-per-frame" => mem_per_frame = parse_number(key, value)?,
                "min-mem-per-proc" => min_mem_per_proc = parse_number(key, value)?,
                "max-mem-per-proc" => max_mem_per_proc = parse_number(key, value)?,
                "replacement-policy" => replacement_policy = value.to_string(),
                _ => {} // unknown key: value token already consumed
            }
        }

        let scheduler = match scheduler.as_str() {
            "fcfs" => SchedulerKind::Fcfs,
            "rr" => SchedulerKind::Rr,
            other => bail!("scheduler must be 'fcfs' or 'rr', got '{}'", other),
        };
        let replacement_policy = match replacement_policy.as_str() {
            "fifo" => ReplacementPolicy::Fifo,
            "lru" => ReplacementPolicy::Lru,
            other => bail!("replacement-policy must be 'fifo' or 'lru', got '{}'", other),
        };

        let cfg = Config {
            num_cpu,
            scheduler,
            quantum_cycles,
            batch_process_freq,
            min_ins,
            max_ins,
            delays_per_exec,
            max_overall_mem,
            mem_per_frame,
            min_mem_per_proc,
            max_mem_per_proc,
            replacement_policy,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !(MIN_CPUS..=MAX_CPUS).contains(&self.num_cpu) {
            bail!("num-cpu must be in [{}, {}]", MIN_CPUS, MAX_CPUS);
        }
        if self.quantum_cycles < 1 {
            bail!("quantum-cycles must be at least 1");
        }
        if self.batch_process_freq < 1 {
            bail!("batch-process-freq must be at least 1");
        }
        if self.min_ins < 1 {
            bail!("min-ins must be at least 1");
        }
        if self.max_ins < self.min_ins {
            bail!("max-ins must be >= min-ins");
        }
        if !self.mem_per_frame.is_power_of_two() {
            bail!("mem-per-frame must be a power of two");
        }
        if self.max_overall_mem == 0 || self.max_overall_mem % self.mem_per_frame != 0 {
            bail!("mem-per-frame must divide max-overall-mem");
        }
        if self.min_mem_per_proc < MIN_PROC_MEM || self.max_mem_per_proc > MAX_PROC_MEM {
            bail!(
                "per-process memory must stay within [{}, {}]",
                MIN_PROC_MEM,
                MAX_PROC_MEM
            );
        }
        if self.min_mem_per_proc > self.max_mem_per_proc {
            bail!("min-mem-per-proc must be <= max-mem-per-proc");
        }
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        (self.max_overall_mem / self.mem_per_frame) as usize
    }
}

/// A process address space must be a power of two in [64, 65536] bytes.
pub fn is_valid_mem_size(size: u32) -> bool {
    (MIN_PROC_MEM..=MAX_PROC_MEM).contains(&size) && size.is_power_of_two()
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("key '{}' has non-numeric value '{}'", key, value))
}
