//! The byte transport a session runs on.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

/// A blocking, exclusively owned connection to one client.
///
/// The session engine's only suspension point is a blocking read on this
/// transport; a read of zero bytes means the peer has gone away. After
/// the closing reply the write side is shut down while reads continue
/// to drain trailing client bytes.
pub trait Transport: Read + Write {
    /// Half-closes the connection for writing.
    fn shutdown_write(&mut self) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }
}
