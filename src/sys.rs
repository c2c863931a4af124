//! Thin wrappers around the libc calls the server needs.
//!
//! Everything here translates `-1`/errno into an error carrying the
//! failing call's name; policy lives in the callers.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{anyhow, Context};


//------------ Process control ----------------------------------------------

/// Return type of [`fork`].
pub enum ForkResult {
    /// In the parent, with the pid of the new child.
    Parent(libc::pid_t),
    /// In the child.
    Child,
}

/// Creates a child process.
pub fn fork() -> anyhow::Result<ForkResult> {
    match unsafe { libc::fork() } {
        -1 => Err(anyhow!("fork: {}", io::Error::last_os_error())),
        0 => Ok(ForkResult::Child),
        pid => Ok(ForkResult::Parent(pid)),
    }
}

/// How a reaped child terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

/// Reaps one terminated child without blocking.
///
/// Returns `None` once no more terminated children are pending.
pub fn reap_child() -> anyhow::Result<Option<(libc::pid_t, ExitStatus)>> {
    let mut status: libc::c_int = 0;
    loop {
        match unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) } {
            -1 => {
                let err = io::Error::last_os_error();
                return match err.raw_os_error() {
                    Some(libc::ECHILD) => Ok(None),
                    Some(libc::EINTR) => continue,
                    _ => Err(anyhow!("waitpid: {}", err)),
                };
            }
            0 => return Ok(None),
            pid => {
                let exit = if libc::WIFEXITED(status) {
                    ExitStatus::Exited(libc::WEXITSTATUS(status))
                } else if libc::WIFSIGNALED(status) {
                    ExitStatus::Signaled(libc::WTERMSIG(status))
                } else {
                    // Neither exit nor signal; we never ask for stop
                    // events, so report the raw status.
                    ExitStatus::Exited(status)
                };
                return Ok(Some((pid, exit)));
            }
        }
    }
}


//------------ Signals and the self-pipe ------------------------------------

/// Creates a non-blocking, close-on-exec pipe.
pub fn pipe() -> anyhow::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(anyhow!("pipe: {}", io::Error::last_os_error()));
    }
    for fd in fds {
        set_nonblocking(fd)?;
        if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
            return Err(anyhow!("fcntl(FD_CLOEXEC): {}",
                               io::Error::last_os_error()));
        }
    }
    Ok((fds[0], fds[1]))
}

/// Installs `handler` for SIGCHLD.
pub fn install_sigchld(handler: extern "C" fn(libc::c_int))
                       -> anyhow::Result<()> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler as libc::sighandler_t;
    sa.sa_flags = libc::SA_NOCLDSTOP;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    if unsafe { libc::sigaction(libc::SIGCHLD, &sa, std::ptr::null_mut()) }
        != 0
    {
        return Err(anyhow!("sigaction: {}", io::Error::last_os_error()));
    }
    Ok(())
}

/// Ignores SIGPIPE so writes to closed peers fail with EPIPE instead.
pub fn ignore_sigpipe() -> anyhow::Result<()> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = libc::SIG_IGN;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    if unsafe { libc::sigaction(libc::SIGPIPE, &sa, std::ptr::null_mut()) }
        != 0
    {
        return Err(anyhow!("sigaction: {}", io::Error::last_os_error()));
    }
    Ok(())
}


//------------ Readiness wait -----------------------------------------------

/// Blocks until one of `fds` is readable.
///
/// Returns the ready descriptors, or `None` if the wait was interrupted
/// by a signal and should simply be retried.
pub fn select_readable(fds: &[RawFd]) -> anyhow::Result<Option<Vec<RawFd>>> {
    let mut set: libc::fd_set = unsafe { mem::zeroed() };
    let mut max = 0;
    unsafe {
        libc::FD_ZERO(&mut set);
        for &fd in fds {
            libc::FD_SET(fd, &mut set);
            max = max.max(fd);
        }
    }
    let ret = unsafe {
        libc::select(max + 1, &mut set, std::ptr::null_mut(),
                     std::ptr::null_mut(), std::ptr::null_mut())
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(anyhow!("select: {}", err));
    }
    let ready = fds
        .iter()
        .copied()
        .filter(|&fd| unsafe { libc::FD_ISSET(fd, &set) })
        .collect();
    Ok(Some(ready))
}


//------------ Listening socket ---------------------------------------------

/// Creates an IPv4 TCP socket bound to `addr:port` but not yet listening.
///
/// Binding and listening are split so privileges can be dropped between
/// the two steps.
pub fn bind_tcp(addr: Ipv4Addr, port: u16) -> anyhow::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(anyhow!("socket: {}", io::Error::last_os_error()));
    }
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR,
                         &one as *const _ as *const libc::c_void,
                         mem::size_of::<libc::c_int>() as libc::socklen_t);
    }
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr = libc::in_addr { s_addr: u32::from(addr).to_be() };
    let ret = unsafe {
        libc::bind(fd, &sa as *const _ as *const libc::sockaddr,
                   mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
    };
    if ret != 0 {
        let err = io::Error::last_os_error();
        close_fd(fd);
        return Err(anyhow!("bind {}:{}: {}", addr, port, err));
    }
    Ok(fd)
}

/// Starts listening on a bound socket.
pub fn listen(fd: RawFd, backlog: i32) -> anyhow::Result<()> {
    if unsafe { libc::listen(fd, backlog) } != 0 {
        return Err(anyhow!("listen: {}", io::Error::last_os_error()));
    }
    Ok(())
}

/// Puts a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(anyhow!("fcntl(F_GETFL): {}", io::Error::last_os_error()));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }
        == -1
    {
        return Err(anyhow!("fcntl(F_SETFL): {}", io::Error::last_os_error()));
    }
    Ok(())
}

/// Closes a descriptor, swallowing errors.
pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}


//------------ Privileges ----------------------------------------------------

/// Chroots into `root_dir` and switches to `user`/`group`.
///
/// Without root privileges the chroot and id switch cannot work; in that
/// case a warning is logged and the process keeps its identity, which is
/// the useful behavior for development setups.
pub fn drop_privileges(user: &str, group: &str, root_dir: &Path)
                       -> anyhow::Result<()> {
    std::fs::create_dir_all(root_dir)
        .with_context(|| format!("creating {}", root_dir.display()))?;

    if unsafe { libc::geteuid() } != 0 {
        log::warn!("Not running as root; skipping chroot and setuid");
        return Ok(());
    }

    let usr = users::get_user_by_name(user)
        .ok_or_else(|| anyhow!("User {} not found", user))?;
    let grp = users::get_group_by_name(group)
        .ok_or_else(|| anyhow!("Group {} not found", group))?;

    let c_root = std::ffi::CString::new(root_dir.to_string_lossy().as_bytes())
        .context("root dir contains a NUL byte")?;
    if unsafe { libc::chroot(c_root.as_ptr()) } != 0 {
        return Err(anyhow!("chroot {}: {}", root_dir.display(),
                           io::Error::last_os_error()));
    }
    std::env::set_current_dir("/").context("chdir into chroot")?;

    if unsafe { libc::setgid(grp.gid()) } != 0 {
        return Err(anyhow!("setgid {}: {}", group,
                           io::Error::last_os_error()));
    }
    if unsafe { libc::setuid(usr.uid()) } != 0 {
        return Err(anyhow!("setuid {}: {}", user,
                           io::Error::last_os_error()));
    }
    log::info!("Dropped privileges to {}:{} in {}", user, group,
               root_dir.display());
    Ok(())
}
