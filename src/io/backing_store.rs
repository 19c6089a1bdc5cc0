//! Append-only swap log backing the simulated page pool.
//!
//! Swapping is informational: the log records traffic, no page contents are
//! persisted. The file is truncated when the emulator initializes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::kernel::process::Pid;

pub const BACKING_STORE_FILE: &str = "csopesy-backing-store.txt";

pub struct BackingStore {
    path: PathBuf,
}

impl BackingStore {
    /// Create (truncating any previous run's log) at `path`.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<BackingStore> {
        let path = path.as_ref().to_path_buf();
        File::create(&path)?;
        Ok(BackingStore { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_swap_out(&self, pid: Pid, page: u32, frame: usize) -> std::io::Result<()> {
        self.append(&format!(
            "SwapOut: PID {} Page {} from Frame {}",
            pid, page, frame
        ))
    }

    pub fn log_swap_in(&self, pid: Pid, page: u32, frame: usize) -> std::io::Result<()> {
        self.append(&format!(
            "SwapIn: PID {} Page {} into Frame {}",
            pid, page, frame
        ))
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", line)
    }
}
