//! The worker pool: one forked process per served connection.

use std::net::TcpStream;
use std::os::unix::io::RawFd;

use log::{error, info, trace};

use crate::config::Config;
use crate::logger;
use crate::smtp::session::Session;
use crate::store::FsStore;
use crate::sys::{self, ForkResult};

//------------ WorkerPool ---------------------------------------------------

#[derive(Debug)]
struct Slot {
    index: usize,
    busy: bool,
    pid: Option<libc::pid_t>,
}

/// A fixed table of worker slots, one per concurrently served client.
///
/// Slots are created once and recycled for the life of the server. A
/// busy slot remembers the child pid so the supervisor can hand it back
/// on exit.
pub struct WorkerPool {
    slots: Vec<Slot>,
}

/// The result of trying to place a connection.
pub enum Acquire {
    /// A worker owns the connection now.
    Launched(usize),
    /// Every slot is busy; the caller must reject the connection.
    Exhausted(TcpStream),
}

impl WorkerPool {
    pub fn new(n_workers: usize) -> WorkerPool {
        WorkerPool {
            slots: (0..n_workers)
                .map(|index| Slot { index, busy: false, pid: None })
                .collect(),
        }
    }

    /// Assigns `stream` to an idle slot and forks the worker for it.
    ///
    /// The child closes the `inherited` descriptors (listener,
    /// supervisor pipe), runs the session to completion and exits; the
    /// parent closes its copy of the client socket.
    pub fn acquire(&mut self, stream: TcpStream, config: &Config,
                   inherited: &[RawFd]) -> anyhow::Result<Acquire> {
        let index = match self.claim() {
            Some(index) => index,
            None => return Ok(Acquire::Exhausted(stream)),
        };
        let forked = sys::fork();
        match forked {
            Err(err) => {
                self.reset(index);
                Err(err)
            }
            Ok(ForkResult::Child) => {
                logger::attach(index);
                for &fd in inherited {
                    sys::close_fd(fd);
                }
                // The session engine expects a blocking socket.
                let _ = stream.set_nonblocking(false);
                let outcome = std::panic::catch_unwind(
                    std::panic::AssertUnwindSafe(|| {
                        let mut store = FsStore::new(config);
                        Session::new(stream, &mut store, config).run();
                    }),
                );
                std::process::exit(if outcome.is_ok() { 0 } else { 1 });
            }
            Ok(ForkResult::Parent(pid)) => {
                self.slots[index].pid = Some(pid);
                info!("Worker {} started, pid {}", index, pid);
                // Ownership of the socket moved to the child; dropping
                // closes the parent's copy.
                drop(stream);
                Ok(Acquire::Launched(index))
            }
        }
    }

    /// Returns the slot owned by `pid` to the pool.
    pub fn release(&mut self, pid: libc::pid_t) -> bool {
        match self
            .slots
            .iter()
            .position(|slot| slot.busy && slot.pid == Some(pid))
        {
            Some(index) => {
                trace!("Worker {} with pid {} released", index, pid);
                self.reset(index);
                true
            }
            None => {
                error!("No busy worker with pid {}", pid);
                false
            }
        }
    }

    fn claim(&mut self) -> Option<usize> {
        let slot = self.slots.iter_mut().find(|slot| !slot.busy)?;
        slot.busy = true;
        Some(slot.index)
    }

    fn reset(&mut self, index: usize) {
        self.slots[index].busy = false;
        self.slots[index].pid = None;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn busy(&self) -> usize {
        self.slots.iter().filter(|slot| slot.busy).count()
    }
}
