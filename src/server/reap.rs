//! Child exit collection.
//!
//! The SIGCHLD handler itself only writes a byte into a pipe; the
//! dispatcher notices the readable pipe in its select set and calls
//! [`Supervisor::drain`] to collect the exited children outside of
//! signal context.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{error, info, warn};

use crate::sys::{self, ExitStatus};

use super::pool::WorkerPool;

static PIPE_WR: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_sigchld(_signal: libc::c_int) {
    let fd = PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let token = [1u8];
        unsafe {
            libc::write(fd, token.as_ptr() as *const libc::c_void, 1);
        }
    }
}

//------------ Supervisor ---------------------------------------------------

/// Owns the notification pipe and the SIGCHLD disposition.
pub struct Supervisor {
    pipe_rd: RawFd,
    pipe_wr: RawFd,
}

impl Supervisor {
    /// Creates the pipe and installs the signal handler.
    ///
    /// Must happen before the first worker is forked or an early exit
    /// could go unnoticed.
    pub fn install() -> anyhow::Result<Supervisor> {
        let (pipe_rd, pipe_wr) = sys::pipe()?;
        PIPE_WR.store(pipe_wr, Ordering::Relaxed);
        sys::install_sigchld(on_sigchld)?;
        Ok(Supervisor { pipe_rd, pipe_wr })
    }

    /// The descriptor the dispatcher watches for exit notifications.
    pub fn notify_fd(&self) -> RawFd {
        self.pipe_rd
    }

    /// Both pipe ends, for closing in forked children.
    pub fn fds(&self) -> [RawFd; 2] {
        [self.pipe_rd, self.pipe_wr]
    }

    /// Collects every exited child and frees its pool slot.
    pub fn drain(&self, pool: &mut WorkerPool) {
        self.flush_pipe();
        loop {
            match sys::reap_child() {
                Ok(Some((pid, status))) => {
                    match status {
                        ExitStatus::Exited(0) => {
                            info!("Worker with pid {} finished", pid);
                        }
                        ExitStatus::Exited(code) => {
                            warn!("Worker with pid {} exited with code {}",
                                  pid, code);
                        }
                        ExitStatus::Signaled(signal) => {
                            warn!("Worker with pid {} killed by signal {}",
                                  pid, signal);
                        }
                    }
                    pool.release(pid);
                }
                Ok(None) => break,
                Err(err) => {
                    error!("Can't collect exited worker: {}", err);
                    break;
                }
            }
        }
    }

    /// Discards the pending notification bytes.
    fn flush_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            let res = unsafe {
                libc::read(
                    self.pipe_rd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if res <= 0 {
                break;
            }
        }
    }
}
