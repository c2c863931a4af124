//! Process-tagged logging.
//!
//! Log lines carry a timestamp, the pid, and, inside a worker process,
//! the worker's slot index. All processes write to stderr; [`attach`]
//! switches a freshly forked worker over to its tagged format.

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};

use log::LevelFilter;

/// Slot index of this process, or -1 in the dispatcher.
static WORKER: AtomicI64 = AtomicI64::new(-1);

/// Initializes logging. `level` overrides the `RUST_LOG` environment.
pub fn init(level: Option<LevelFilter>) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    );
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder
        .format(|buf, record| {
            let pid = std::process::id();
            match WORKER.load(Ordering::Relaxed) {
                -1 => writeln!(buf, "[{} {:5} pid {}] {}", buf.timestamp(),
                               record.level(), pid, record.args()),
                slot => writeln!(buf, "[{} {:5} pid {} worker {}] {}",
                                 buf.timestamp(), record.level(), pid, slot,
                                 record.args()),
            }
        })
        .init();
}

/// Re-points this process' log output at the given worker slot.
///
/// Called in the child right after fork.
pub fn attach(slot: usize) {
    WORKER.store(slot as i64, Ordering::Relaxed);
}
