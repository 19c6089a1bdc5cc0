//! Logger backend for the `log` facade.
//!
//! Emulator diagnostics (dispatch, preemption, swaps) go to stderr so they
//! never interleave with simulated process output on stdout. The level is
//! taken from the `LOG` environment variable, default `info`.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let color = match record.level() {
                Level::Error => 31,
                Level::Warn => 93,
                Level::Info => 34,
                Level::Debug => 32,
                Level::Trace => 90,
            };
            eprintln!(
                "\u{1B}[{}m{:>5} [{}] {}\u{1B}[0m",
                color,
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    static LOGGER: StderrLogger = StderrLogger;

    if log::set_logger(&LOGGER).is_ok() {
        let filter = match std::env::var("LOG").as_deref() {
            Ok("error") | Ok("ERROR") => LevelFilter::Error,
            Ok("warn") | Ok("WARN") => LevelFilter::Warn,
            Ok("debug") | Ok("DEBUG") => LevelFilter::Debug,
            Ok("trace") | Ok("TRACE") => LevelFilter::Trace,
            Ok("off") | Ok("OFF") => LevelFilter::Off,
            _ => LevelFilter::Info,
        };
        log::set_max_level(filter);
    }
}
