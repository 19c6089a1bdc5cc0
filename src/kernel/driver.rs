//! Holds the virtual system environment and hands it to the subsystems.
//!
//! One `Driver` is created per `initialize` and shared (via `Arc`) between
//! the shell and the scheduler thread. There are no hidden globals: every
//! subsystem reaches state through this handle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::io::backing_store::BackingStore;
use crate::kernel::clock::Clock;
use crate::kernel::memory::MemoryManager;
use crate::kernel::process::{Pid, Process, ProcessSnapshot};
use crate::kernel::scheduler::QueueSet;
use crate::kernel::stats::Stats;

pub struct CpuUtilization {
    pub cores_used: u32,
    pub cores_available: u32,
    pub percent: f64,
}

pub struct Driver {
    cfg: Config,
    pub clock: Arc<Clock>,
    pub stats: Arc<Stats>,
    pub memory: MemoryManager,
    pub(crate) queues: Mutex<QueueSet>,
    generating: AtomicBool,
    shutdown: AtomicBool,
    next_pid: AtomicU32,
}

impl Driver {
    pub fn new(cfg: Config, store: BackingStore) -> Arc<Driver> {
        let clock = Arc::new(Clock::new());
        let stats = Arc::new(Stats::new());
        let memory = MemoryManager::new(&cfg, clock.clone(), stats.clone(), store);
        let queues = Mutex::new(QueueSet::new(cfg.num_cpu as usize));
        Arc::new(Driver {
            cfg,
            clock,
            stats,
            memory,
            queues,
            generating: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            next_pid: AtomicU32::new(1),
        })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn next_pid(&self) -> Pid {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    /// Admit a process: install its page table, then enqueue it ready.
    pub fn admit(&self, process: Process) {
        self.memory.allocate(process.id, process.memory_size);
        log::debug!("admitting {} to ready queue", process.name);
        let mut queues = self.queues.lock().unwrap();
        queues.ready.push_back(process);
    }

    /// Idempotent; in-flight processes are unaffected either way.
    pub fn start_generation(&self) {
        self.generating.store(true, Ordering::SeqCst);
    }

    pub fn stop_generation(&self) {
        self.generating.store(false, Ordering::SeqCst);
    }

    pub fn is_generating(&self) -> bool {
        self.generating.load(Ordering::SeqCst)
    }

    /// Cooperative: the scheduler thread observes this at the next tick
    /// boundary.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run `f` on the named process wherever it currently sits. The PCB
    /// never leaves the queue mutex; callers get a result, not a reference.
    pub fn find_process<R>(&self, name: &str, f: impl FnOnce(&Process) -> R) -> Option<R> {
        let queues = self.queues.lock().unwrap();
        let result = queues.iter_all().find(|p| p.name == name).map(f);
        result
    }

    /// Snapshots in listing order: ready, running, sleeping, finished.
    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        let queues = self.queues.lock().unwrap();
        queues.iter_all().map(Process::snapshot).collect()
    }

    /// Cores actively executing; fault-stalled processes occupy a core but
    /// do not count.
    pub fn cpu_utilization(&self) -> CpuUtilization {
        let queues = self.queues.lock().unwrap();
        let total = queues.cores.len() as u32;
        let used = queues
            .cores
            .iter()
            .filter(|slot| matches!(slot, Some(p) if !p.is_waiting))
            .count() as u32;
        let percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        CpuUtilization {
            cores_used: used,
            cores_available: total - used,
            percent,
        }
    }
}
