//! Building and sending protocol replies.
//!
//! The three-digit codes and the wording of the error replies are part
//! of the wire contract and must not drift.

use std::io::{self, Write};

use super::buf::SendBuf;

//------------ Reply --------------------------------------------------------

/// A reply under construction.
///
/// Single-line replies are written as `<code> <text>`; when more lines
/// are added, every line but the last uses the `<code>-<text>`
/// continuation form.
#[derive(Debug)]
pub struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16) -> Reply {
        debug_assert!((200..600).contains(&code));
        Reply { code, lines: Vec::new() }
    }

    pub fn line(mut self, text: impl Into<String>) -> Reply {
        self.lines.push(text.into());
        self
    }

    /// Queues the finished reply in `send`.
    pub fn push_to(self, send: &mut SendBuf) {
        let last = self.lines.len().saturating_sub(1);
        for (idx, text) in self.lines.iter().enumerate() {
            let sep = if idx == last { ' ' } else { '-' };
            send.push_bytes(format!("{}{}{}\r\n", self.code, sep, text)
                                .as_bytes());
        }
    }
}

/// Queues a one-line reply.
pub fn reply(send: &mut SendBuf, code: u16, text: &str) {
    Reply::new(code).line(text).push_to(send);
}

/// Writes a status line straight to a socket, bypassing any session.
///
/// Used by the dispatcher to reject a connection the worker pool cannot
/// take; failures only get logged since the connection is being dropped
/// anyway.
pub fn send_error<W: Write>(sock: &mut W, code: u16, text: &str)
                            -> io::Result<()> {
    let line = format!("{} {}\r\n", code, text);
    sock.write_all(line.as_bytes())?;
    sock.flush()
}
