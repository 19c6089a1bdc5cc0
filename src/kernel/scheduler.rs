//! Tick-driven scheduler: queue set, dispatch phases, and the background
//! thread that paces the simulation.
//!
//! Each tick runs Wake -> Execute -> Dispatch, every phase inside its own
//! critical section on the queue mutex. Core slots are data: the
//! interpreter advances them sequentially, there is no per-core thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SchedulerKind;
use crate::kernel::clock::Tick;
use crate::kernel::driver::Driver;
use crate::kernel::generator::Generator;
use crate::kernel::interpreter::{self, ExecContext};
use crate::kernel::process::{Process, ProcessState};

/// Real-time pacing between ticks; pure presentation, never correctness.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Ready / sleeping / finished queues plus the per-core slots, guarded as
/// one unit by the driver's queue mutex.
pub struct QueueSet {
    pub ready: VecDeque<Process>,
    pub sleeping: VecDeque<Process>,
    pub finished: VecDeque<Process>,
    pub cores: Vec<Option<Process>>,
}

impl QueueSet {
    pub fn new(num_cpu: usize) -> QueueSet {
        QueueSet {
            ready: VecDeque::new(),
            sleeping: VecDeque::new(),
            finished: VecDeque::new(),
            cores: (0..num_cpu).map(|_| None).collect(),
        }
    }

    /// Every process in listing order: ready, running, sleeping, finished.
    pub fn iter_all(&self) -> impl Iterator<Item = &Process> {
        self.ready
            .iter()
            .chain(self.cores.iter().filter_map(Option::as_ref))
            .chain(self.sleeping.iter())
            .chain(self.finished.iter())
    }
}

pub struct Scheduler {
    driver: Arc<Driver>,
    generator: Generator,
}

impl Scheduler {
    pub fn new(driver: Arc<Driver>) -> Scheduler {
        Scheduler::with_generator(driver, Generator::new())
    }

    pub fn with_generator(driver: Arc<Driver>, generator: Generator) -> Scheduler {
        Scheduler { driver, generator }
    }

    /// Spawn the background scheduler thread. It runs until the driver's
    /// shutdown flag is raised, then exits at the next tick boundary.
    pub fn spawn(driver: Arc<Driver>) -> std::io::Result<SchedulerHandle> {
        let scheduler = Scheduler::new(driver);
        let thread = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || scheduler.run_loop())?;
        Ok(SchedulerHandle { thread })
    }

    fn run_loop(mut self) {
        log::info!("scheduler thread running");
        while !self.driver.is_shutdown() {
            for line in self.run_tick() {
                println!("{}", line);
            }
            thread::sleep(TICK_INTERVAL);
        }
        log::info!("scheduler thread stopped");
    }

    /// One logical tick. Returns the console lines the tick produced so
    /// callers (thread loop or tests) decide where they go.
    pub fn run_tick(&mut self) -> Vec<String> {
        let tick = self.driver.clock.advance();
        self.sample_utilization();
        self.generate(tick);
        self.wake_sleeping(tick);
        let console = self.execute_cores(tick);
        self.dispatch();
        console
    }

    /// Utilization is sampled once per tick, before execution; a stalled
    /// (page-faulted) process occupies its core but is not active.
    fn sample_utilization(&self) {
        let queues = self.driver.queues.lock().unwrap();
        let total = queues.cores.len() as u64;
        let active = queues
            .cores
            .iter()
            .filter(|slot| matches!(slot, Some(p) if !p.is_waiting))
            .count() as u64;
        self.driver.stats.record_tick(active, total - active);
    }

    fn generate(&mut self, tick: Tick) {
        if !self.driver.is_generating() || !self.generator.due(tick, self.driver.cfg()) {
            return;
        }
        let pid = self.driver.next_pid();
        if let Some(process) = self.generator.maybe_generate(tick, self.driver.cfg(), pid) {
            self.driver.admit(process);
        }
    }

    /// Move every sleeper whose wake tick has arrived back to ready,
    /// preserving arrival order.
    fn wake_sleeping(&self, tick: Tick) {
        let mut queues = self.driver.queues.lock().unwrap();
        let mut still_sleeping = VecDeque::new();
        while let Some(mut p) = queues.sleeping.pop_front() {
            if p.sleep_until_tick <= tick {
                log::debug!("{} waking up", p.name);
                p.state = ProcessState::Ready;
                queues.ready.push_back(p);
            } else {
                still_sleeping.push_back(p);
            }
        }
        queues.sleeping = still_sleeping;
    }

    /// Run one instruction on every occupied core, then route each process
    /// by its resulting state. The PCB is taken out of its slot for
    /// execution and reinserted only if it stays running.
    fn execute_cores(&self, tick: Tick) -> Vec<String> {
        let driver = &self.driver;
        let round_robin = driver.cfg().scheduler == SchedulerKind::Rr;
        let mut console = Vec::new();
        let mut queues = driver.queues.lock().unwrap();

        for slot in 0..queues.cores.len() {
            let Some(mut p) = queues.cores[slot].take() else {
                continue;
            };

            {
                let mut ctx = ExecContext {
                    cfg: driver.cfg(),
                    memory: &driver.memory,
                    console: &mut console,
                };
                interpreter::execute(&mut p, tick, &mut ctx);
            }

            match p.state {
                ProcessState::Finished | ProcessState::MemoryViolated => {
                    log::debug!("{} done ({})", p.name, p.state.label());
                    queues.finished.push_back(p);
                }
                ProcessState::Sleeping => {
                    queues.sleeping.push_back(p);
                }
                _ => {
                    // Quantum is charged per occupied tick, except while
                    // stalled on a page fault.
                    if round_robin && !p.is_waiting {
                        p.quantum_ticks_left = p.quantum_ticks_left.saturating_sub(1);
                        if p.quantum_ticks_left == 0 {
                            log::debug!("{} preempted", p.name);
                            p.state = ProcessState::Ready;
                            queues.ready.push_back(p);
                            continue;
                        }
                    }
                    queues.cores[slot] = Some(p);
                }
            }
        }

        console
    }

    /// Fill empty cores from the front of the ready queue.
    fn dispatch(&self) {
        let driver = &self.driver;
        let round_robin = driver.cfg().scheduler == SchedulerKind::Rr;
        let mut queues = driver.queues.lock().unwrap();

        for slot in 0..queues.cores.len() {
            if queues.cores[slot].is_some() {
                continue;
            }
            let Some(mut p) = queues.ready.pop_front() else {
                break;
            };
            p.state = ProcessState::Running;
            if round_robin {
                p.quantum_ticks_left = driver.cfg().quantum_cycles;
            }
            log::debug!("dispatching {} to core {}", p.name, slot);
            queues.cores[slot] = Some(p);
        }
    }
}

pub struct SchedulerHandle {
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Wait for the scheduler thread to observe shutdown and exit.
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("scheduler thread panicked");
        }
    }
}
