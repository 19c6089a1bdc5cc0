//! Demand-paged memory manager.
//!
//! A fixed pool of frames is shared by every process. Page tables are
//! created eagerly at `allocate` but frames are claimed only on first
//! access; a full pool evicts a victim chosen by the configured policy.
//! One mutex guards frames and page tables; the queue mutex may be held
//! while calling in here, never the reverse.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{Config, ReplacementPolicy};
use crate::io::backing_store::BackingStore;
use crate::kernel::clock::{Clock, Tick};
use crate::kernel::process::Pid;
use crate::kernel::stats::Stats;

struct Frame {
    owner_pid: Option<Pid>,
    page_num: u32,
    dirty: bool,
    allocated_tick: Tick,
    last_accessed_tick: Tick,
}

impl Frame {
    fn free() -> Frame {
        Frame {
            owner_pid: None,
            page_num: 0,
            dirty: false,
            allocated_tick: 0,
            last_accessed_tick: 0,
        }
    }
}

/// `None` entry = page not resident.
type PageTable = HashMap<u32, Option<usize>>;

struct MemoryState {
    frames: Vec<Frame>,
    page_tables: HashMap<Pid, PageTable>,
}

pub struct MemoryManager {
    mem_per_frame: u32,
    policy: ReplacementPolicy,
    state: Mutex<MemoryState>,
    clock: Arc<Clock>,
    stats: Arc<Stats>,
    store: BackingStore,
}

impl MemoryManager {
    pub fn new(
        cfg: &Config,
        clock: Arc<Clock>,
        stats: Arc<Stats>,
        store: BackingStore,
    ) -> MemoryManager {
        let frames = (0..cfg.total_frames()).map(|_| Frame::free()).collect();
        MemoryManager {
            mem_per_frame: cfg.mem_per_frame,
            policy: cfg.replacement_policy,
            state: Mutex::new(MemoryState {
                frames,
                page_tables: HashMap::new(),
            }),
            clock,
            stats,
            store,
        }
    }

    fn page_of(&self, addr: u32) -> u32 {
        addr / self.mem_per_frame
    }

    /// Install an all-NotResident page table covering `size` bytes. Pure
    /// demand paging: no frame is claimed here.
    pub fn allocate(&self, pid: Pid, size: u32) {
        let num_pages = size.div_ceil(self.mem_per_frame);
        let mut state = self.state.lock().unwrap();
        let table = state.page_tables.entry(pid).or_default();
        for page in 0..num_pages {
            table.insert(page, None);
        }
    }

    /// Release every frame owned by `pid` and drop its page table.
    pub fn deallocate(&self, pid: Pid) {
        let mut state = self.state.lock().unwrap();
        for frame in &mut state.frames {
            if frame.owner_pid == Some(pid) {
                *frame = Frame::free();
            }
        }
        state.page_tables.remove(&pid);
    }

    /// Residency check. A hit refreshes the frame's access stamp so LRU
    /// sees real usage, not just swap-in order.
    pub fn is_resident(&self, pid: Pid, addr: u32) -> bool {
        let page = self.page_of(addr);
        let mut state = self.state.lock().unwrap();
        let frame_idx = match state.page_tables.get(&pid).and_then(|t| t.get(&page)) {
            Some(&Some(idx)) => idx,
            _ => return false,
        };
        state.frames[frame_idx].last_accessed_tick = self.clock.now();
        true
    }

    /// Bring the page containing `addr` into a frame, evicting if the pool
    /// is full. No-op when already resident.
    pub fn request_page(&self, pid: Pid, addr: u32) {
        let page = self.page_of(addr);
        let mut state = self.state.lock().unwrap();

        if let Some(&Some(_)) = state.page_tables.get(&pid).and_then(|t| t.get(&page)) {
            return;
        }

        let frame_idx = match Self::find_free_frame(&state) {
            Some(idx) => idx,
            None => {
                let victim = self.select_victim(&state);
                self.swap_out(&mut state, victim);
                victim
            }
        };

        self.swap_in(&mut state, pid, page, frame_idx);
    }

    /// Mark the frame holding `addr` dirty. No-op when not resident.
    pub fn mark_dirty(&self, pid: Pid, addr: u32) {
        let page = self.page_of(addr);
        let mut state = self.state.lock().unwrap();
        if let Some(&Some(idx)) = state.page_tables.get(&pid).and_then(|t| t.get(&page)) {
            state.frames[idx].dirty = true;
        }
    }

    fn find_free_frame(state: &MemoryState) -> Option<usize> {
        state.frames.iter().position(|f| f.owner_pid.is_none())
    }

    /// FIFO evicts the oldest swap-in, LRU the longest-untouched frame.
    /// Ties go to the lowest frame index.
    fn select_victim(&self, state: &MemoryState) -> usize {
        let stamp = |f: &Frame| match self.policy {
            ReplacementPolicy::Fifo => f.allocated_tick,
            ReplacementPolicy::Lru => f.last_accessed_tick,
        };
        let mut victim = 0;
        let mut oldest = Tick::MAX;
        for (idx, frame) in state.frames.iter().enumerate() {
            if stamp(frame) < oldest {
                oldest = stamp(frame);
                victim = idx;
            }
        }
        victim
    }

    fn swap_out(&self, state: &mut MemoryState, frame_idx: usize) {
        let (owner, page) = {
            let frame = &state.frames[frame_idx];
            match frame.owner_pid {
                Some(owner) => (owner, frame.page_num),
                None => return,
            }
        };

        if let Err(err) = self.store.log_swap_out(owner, page, frame_idx) {
            log::warn!("backing store append failed: {}", err);
        }
        if let Some(table) = state.page_tables.get_mut(&owner) {
            table.insert(page, None);
        }
        state.frames[frame_idx] = Frame::free();
        self.stats.record_page_out();
        log::debug!("swap out: pid {} page {} frame {}", owner, page, frame_idx);
    }

    fn swap_in(&self, state: &mut MemoryState, pid: Pid, page: u32, frame_idx: usize) {
        if let Err(err) = self.store.log_swap_in(pid, page, frame_idx) {
            log::warn!("backing store append failed: {}", err);
        }

        let now = self.clock.now();
        state.frames[frame_idx] = Frame {
            owner_pid: Some(pid),
            page_num: page,
            dirty: false,
            allocated_tick: now,
            last_accessed_tick: now,
        };
        state
            .page_tables
            .entry(pid)
            .or_default()
            .insert(page, Some(frame_idx));
        self.stats.record_page_in();
        log::debug!("swap in: pid {} page {} frame {}", pid, page, frame_idx);
    }

    pub fn total_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.frames.len() as u64 * self.mem_per_frame as u64
    }

    pub fn used_bytes(&self) -> u64 {
        let state = self.state.lock().unwrap();
        let occupied = state.frames.iter().filter(|f| f.owner_pid.is_some()).count();
        occupied as u64 * self.mem_per_frame as u64
    }

    pub fn free_bytes(&self) -> u64 {
        self.total_bytes() - self.used_bytes()
    }

    /// Resident set size of one process in bytes.
    pub fn resident_bytes(&self, pid: Pid) -> u64 {
        let state = self.state.lock().unwrap();
        let owned = state
            .frames
            .iter()
            .filter(|f| f.owner_pid == Some(pid))
            .count();
        owned as u64 * self.mem_per_frame as u64
    }

    #[cfg(test)]
    fn frame_owner(&self, frame_idx: usize) -> Option<Pid> {
        self.state.lock().unwrap().frames[frame_idx].owner_pid
    }

    #[cfg(test)]
    fn frame_dirty(&self, frame_idx: usize) -> bool {
        self.state.lock().unwrap().frames[frame_idx].dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerKind;
    use std::fs;
    use std::path::PathBuf;

    fn test_config(max_mem: u32, frame: u32, policy: ReplacementPolicy) -> Config {
        Config {
            num_cpu: 1,
            scheduler: SchedulerKind::Fcfs,
            quantum_cycles: 1,
            batch_process_freq: 1,
            min_ins: 1,
            max_ins: 1,
            delays_per_exec: 0,
            max_overall_mem: max_mem,
            mem_per_frame: frame,
            min_mem_per_proc: 64,
            max_mem_per_proc: 65536,
            replacement_policy: policy,
        }
    }

    fn store_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("csopesy-mem-{}-{}.txt", std::process::id(), tag))
    }

    fn manager(tag: &str, cfg: &Config) -> (MemoryManager, Arc<Clock>, Arc<Stats>, PathBuf) {
        let clock = Arc::new(Clock::new());
        let stats = Arc::new(Stats::new());
        let path = store_path(tag);
        let store = BackingStore::create(&path).unwrap();
        let mm = MemoryManager::new(cfg, clock.clone(), stats.clone(), store);
        (mm, clock, stats, path)
    }

    #[test]
    fn test_allocate_is_lazy() {
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, _clock, stats, path) = manager("lazy", &cfg);

        mm.allocate(1, 128);
        assert_eq!(mm.used_bytes(), 0);
        assert!(!mm.is_resident(1, 0));
        assert_eq!(stats.paged_in(), 0);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_request_page_claims_free_frame() {
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, _clock, stats, path) = manager("claim", &cfg);

        mm.allocate(1, 128);
        mm.request_page(1, 70); // page 1
        assert!(mm.is_resident(1, 70));
        assert!(mm.is_resident(1, 127)); // same page
        assert!(!mm.is_resident(1, 0)); // page 0 untouched
        assert_eq!(stats.paged_in(), 1);
        assert_eq!(stats.paged_out(), 0);
        assert_eq!(mm.used_bytes(), 64);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_request_page_idempotent_when_resident() {
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, _clock, stats, path) = manager("idem", &cfg);

        mm.allocate(1, 64);
        mm.request_page(1, 0);
        mm.request_page(1, 0);
        assert_eq!(stats.paged_in(), 1);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_fifo_evicts_earliest_allocated() {
        // Two frames, three processes touching one page each: the first
        // swap-in is the victim.
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, clock, stats, path) = manager("fifo", &cfg);

        for pid in 1..=3 {
            mm.allocate(pid, 64);
        }
        clock.advance();
        mm.request_page(1, 0);
        clock.advance();
        mm.request_page(2, 0);
        clock.advance();
        mm.request_page(3, 0);

        assert_eq!(stats.paged_in(), 3);
        assert_eq!(stats.paged_out(), 1);
        assert!(!mm.is_resident(1, 0)); // earliest allocation evicted
        assert!(mm.is_resident(2, 0));
        assert!(mm.is_resident(3, 0));

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "SwapIn: PID 1 Page 0 into Frame 0",
                "SwapIn: PID 2 Page 0 into Frame 1",
                "SwapOut: PID 1 Page 0 from Frame 0",
                "SwapIn: PID 3 Page 0 into Frame 0",
            ]
        );
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let cfg = test_config(128, 64, ReplacementPolicy::Lru);
        let (mm, clock, _stats, path) = manager("lru", &cfg);

        for pid in 1..=3 {
            mm.allocate(pid, 64);
        }
        clock.advance();
        mm.request_page(1, 0);
        clock.advance();
        mm.request_page(2, 0);
        clock.advance();
        mm.is_resident(1, 0); // touch pid 1: pid 2 is now least recent
        clock.advance();
        mm.request_page(3, 0);

        assert!(mm.is_resident(1, 0));
        assert!(!mm.is_resident(2, 0));
        assert!(mm.is_resident(3, 0));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_single_frame_pool_always_evicts() {
        let cfg = test_config(64, 64, ReplacementPolicy::Fifo);
        let (mm, clock, stats, path) = manager("single", &cfg);

        mm.allocate(1, 64);
        mm.allocate(2, 64);
        clock.advance();
        mm.request_page(1, 0);
        clock.advance();
        mm.request_page(2, 0);

        assert_eq!(stats.paged_in(), 2);
        assert_eq!(stats.paged_out(), 1);
        assert!(!mm.is_resident(1, 0));
        assert!(mm.is_resident(2, 0));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_deallocate_frees_frames_and_table() {
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, clock, _stats, path) = manager("dealloc", &cfg);

        mm.allocate(1, 128);
        clock.advance();
        mm.request_page(1, 0);
        mm.request_page(1, 64);
        assert_eq!(mm.resident_bytes(1), 128);

        mm.deallocate(1);
        assert_eq!(mm.resident_bytes(1), 0);
        assert_eq!(mm.used_bytes(), 0);
        assert!(!mm.is_resident(1, 0));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_dirty_flag_follows_owner() {
        let cfg = test_config(128, 64, ReplacementPolicy::Fifo);
        let (mm, clock, _stats, path) = manager("dirty", &cfg);

        mm.allocate(1, 64);
        clock.advance();
        mm.request_page(1, 0);
        assert!(!mm.frame_dirty(0));
        mm.mark_dirty(1, 0);
        assert_eq!(mm.frame_owner(0), Some(1));
        assert!(mm.frame_dirty(0));
        fs::remove_file(path).unwrap();
    }
}
