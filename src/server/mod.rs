//! The server proper: socket setup, privilege drop, accept loop.

pub mod dispatch;
pub mod pool;
pub mod reap;

use std::net::{Ipv4Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::FromRawFd;

use anyhow::{anyhow, Context};
use log::info;

use crate::config::Config;
use crate::sys;

use self::dispatch::Dispatcher;

const BACKLOG: libc::c_int = 8;

/// Brings the server up and runs the accept loop.
///
/// The socket is bound while still privileged; privileges are dropped
/// before the socket starts listening so a bug in the protocol code
/// never runs as root.
pub fn run(config: Config) -> anyhow::Result<()> {
    let addr = resolve(&config.listen_host)?;
    let fd = sys::bind_tcp(addr, config.listen_port)?;
    sys::drop_privileges(&config.user, &config.group, &config.root_dir)?;
    sys::listen(fd, BACKLOG)?;
    sys::set_nonblocking(fd)?;
    info!("Listening on {}:{}", config.listen_host, config.listen_port);

    sys::ignore_sigpipe()?;
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    Dispatcher::new(listener, config)?.run()
}

fn resolve(host: &str) -> anyhow::Result<Ipv4Addr> {
    if let Ok(addr) = host.parse() {
        return Ok(addr);
    }
    (host, 0)
        .to_socket_addrs()
        .with_context(|| format!("can't resolve listen host '{}'", host))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            anyhow!("listen host '{}' has no IPv4 address", host)
        })
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolves_literals_and_names() {
        assert_eq!(resolve("127.0.0.1").unwrap(),
                   Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(resolve("0.0.0.0").unwrap(),
                   Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(resolve("localhost").unwrap(),
                   Ipv4Addr::new(127, 0, 0, 1));
        assert!(resolve("no.such.host.invalid").is_err());
    }
}
