//! The accept loop.
//!
//! The parent process sits in `select` on three kinds of descriptors:
//! the listening socket, the supervisor's notification pipe, and the
//! sockets of rejected clients that are waiting to be torn down.

use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, error, info, warn};

use crate::config::Config;
use crate::smtp::reply;
use crate::sys;

use super::pool::{Acquire, WorkerPool};
use super::reap::Supervisor;

//------------ Dispatcher ---------------------------------------------------

pub struct Dispatcher {
    listener: TcpListener,
    supervisor: Supervisor,
    pool: WorkerPool,
    config: Config,

    /// Rejected clients whose sockets we keep until they hang up.
    ///
    /// The write half is already shut down; once the socket selects
    /// readable the client has either read our reply or gone away, and
    /// we can close without losing the rejection notice.
    rejected: Vec<TcpStream>,
}

impl Dispatcher {
    pub fn new(listener: TcpListener, config: Config)
               -> anyhow::Result<Dispatcher> {
        let supervisor = Supervisor::install()?;
        let pool = WorkerPool::new(config.n_workers);
        Ok(Dispatcher {
            listener,
            supervisor,
            pool,
            config,
            rejected: Vec::new(),
        })
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        info!("Accepting connections with {} workers",
              self.pool.capacity());
        loop {
            let mut watched = vec![
                self.listener.as_raw_fd(),
                self.supervisor.notify_fd(),
            ];
            watched.extend(self.rejected.iter().map(|s| s.as_raw_fd()));

            let ready = match sys::select_readable(&watched)? {
                Some(ready) => ready,
                // Interrupted; rebuild the set and try again.
                None => continue,
            };

            if ready.contains(&self.supervisor.notify_fd()) {
                self.supervisor.drain(&mut self.pool);
            }
            self.sweep_rejected(&ready);
            if ready.contains(&self.listener.as_raw_fd()) {
                self.accept_one()?;
            }
        }
    }

    /// Closes rejected sockets that have become readable.
    fn sweep_rejected(&mut self, ready: &[RawFd]) {
        self.rejected.retain(|sock| {
            if ready.contains(&sock.as_raw_fd()) {
                debug!("Dropping rejected connection");
                false
            } else {
                true
            }
        });
    }

    fn accept_one(&mut self) -> anyhow::Result<()> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(());
            }
            Err(err) => {
                error!("Can't accept new client: {}", err);
                return Ok(());
            }
        };
        info!("Connection from {}", peer);

        let mut inherited = vec![self.listener.as_raw_fd()];
        inherited.extend(self.supervisor.fds());
        inherited.extend(self.rejected.iter().map(|s| s.as_raw_fd()));

        match self.pool.acquire(stream, &self.config, &inherited)? {
            Acquire::Launched(_) => Ok(()),
            Acquire::Exhausted(stream) => {
                self.reject(stream);
                Ok(())
            }
        }
    }

    /// Turns an unplaceable client away with a temporary failure.
    fn reject(&mut self, mut stream: TcpStream) {
        warn!("All workers busy; rejecting client");
        if let Err(err) = reply::send_error(&mut stream, 421,
                                            "no more workers") {
            debug!("Can't notify rejected client: {}", err);
            return;
        }
        if stream.shutdown(Shutdown::Write).is_err() {
            return;
        }
        self.rejected.push(stream);
    }
}
