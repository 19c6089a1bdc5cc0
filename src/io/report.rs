//! `report-util` output: CPU utilization plus the process listing, written
//! to `csopesy-log.txt` (rewritten on every call).

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::kernel::driver::Driver;

pub const REPORT_FILE: &str = "csopesy-log.txt";

/// Render the utilization header and per-process listing. `screen -ls`
/// prints the same text to the console.
pub fn render(driver: &Driver) -> String {
    let util = driver.cpu_utilization();
    let mut out = format!("CPU Utilization: {:.2}%\n", util.percent);
    out.push_str("Processes:\n");
    for snap in driver.snapshots() {
        out.push_str(&format!("{} [{}]\n", snap.name, snap.state.label()));
    }
    out
}

pub fn write_report(driver: &Driver, path: impl AsRef<Path>) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(render(driver).as_bytes())
}
