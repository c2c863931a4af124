//! The session protocol engine.
//!
//! One `Session` serves one accepted connection, inside the worker
//! process that owns it. The engine is an explicit state machine: every
//! state is a method returning the next state, and the run loop spins
//! until the terminal state. Its only suspension point is the blocking
//! read on the transport.

use std::io;

use log::{debug, info, trace, warn};

use crate::config::Config;

use super::buf::{RecvBuf, SendBuf};
use super::command::{self, Verb};
use super::handler::Handler;
use super::reply::{reply, Reply};
use super::syntax;
use super::transport::Transport;

/// Frame delimiter while awaiting a command line.
const CRLF: &[u8] = b"\r\n";
/// Frame delimiter while awaiting a message body.
const BODY_END: &[u8] = b"\r\n.\r\n";

//------------ State and Resume ---------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Init,
    Welcome,
    AwaitCommand,
    AwaitData,
    ReadFrame,
    CommandArrived,
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    ProcessBody,
    Rset,
    ResetAck,
    NextCommand,
    SyntaxError,
    LocalError,
    CloseWithError,
    CloseConnection,
    Release,
    Terminal,
}

/// Where to continue once a complete frame has been extracted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resume {
    Command,
    Body,
    ResetAck,
}

//------------ Session ------------------------------------------------------

/// The per-connection protocol engine.
pub struct Session<'a, T: Transport, H: Handler> {
    transport: T,
    handler: &'a mut H,
    config: &'a Config,

    state: State,
    /// Unprocessed bytes read from the transport.
    raw: RecvBuf,
    /// The most recently extracted frame, without its delimiter.
    frame: RecvBuf,
    delimiter: &'static [u8],
    resume: Option<Resume>,

    /// Domain declared by HELO/EHLO, immutable once set.
    helo: Option<String>,
    /// The transaction in progress and the last command matched in it.
    pending: Option<command::Match>,
    should_retry: bool,
    can_retry: bool,
    /// Error the session must terminate with.
    error: Option<(u16, String)>,

    sender: Option<String>,
    recipients: Vec<String>,

    send: SendBuf,
    write_closed: bool,
}

impl<'a, T: Transport, H: Handler> Session<'a, T, H> {
    pub fn new(transport: T, handler: &'a mut H, config: &'a Config)
               -> Self {
        Session {
            transport,
            handler,
            config,
            state: State::Init,
            raw: RecvBuf::new(),
            frame: RecvBuf::new(),
            delimiter: CRLF,
            resume: None,
            helo: None,
            pending: None,
            should_retry: false,
            can_retry: false,
            error: None,
            sender: None,
            recipients: Vec::new(),
            send: SendBuf::new(),
            write_closed: false,
        }
    }

    /// A session that greets the client with `code` and closes.
    pub fn rejected(transport: T, handler: &'a mut H, config: &'a Config,
                    code: u16, message: &str) -> Self {
        let mut session = Session::new(transport, handler, config);
        session.error = Some((code, message.into()));
        session
    }

    /// Runs the engine to completion.
    pub fn run(mut self) {
        debug!("Session started");
        while self.state != State::Terminal {
            let next = self.step();
            trace!("{:?} -> {:?}", self.state, next);
            self.state = next;
        }
        debug!("Session finished");
    }

    fn step(&mut self) -> State {
        match self.state {
            State::Init => self.init(),
            State::Welcome => self.welcome(),
            State::AwaitCommand => self.await_command(),
            State::AwaitData => self.await_data(),
            State::ReadFrame => self.read_frame(),
            State::CommandArrived => self.command_arrived(),
            State::Helo => self.helo_or_ehlo(false),
            State::Ehlo => self.helo_or_ehlo(true),
            State::Mail => self.mail(),
            State::Rcpt => self.rcpt(),
            State::Data => self.data(),
            State::ProcessBody => self.process_body(),
            State::Rset => self.rset(),
            State::ResetAck => self.reset_ack(),
            State::NextCommand => self.next_command(),
            State::SyntaxError => self.syntax_error(),
            State::LocalError => self.local_error(),
            State::CloseWithError => self.close_with_error(),
            State::CloseConnection => self.close_connection(),
            State::Release => self.release(),
            State::Terminal => State::Terminal,
        }
    }

    //--- Setup and framing

    fn init(&mut self) -> State {
        self.delimiter = CRLF;
        State::Welcome
    }

    fn welcome(&mut self) -> State {
        if self.error.is_some() {
            return State::CloseWithError;
        }
        reply(&mut self.send, 220,
              &format!("{} ESMTP mailroom", self.config.hostname));
        State::AwaitCommand
    }

    fn await_command(&mut self) -> State {
        self.resume = Some(Resume::Command);
        State::AwaitData
    }

    /// The suspension point: flush replies, then block until the
    /// transport has bytes for us.
    fn await_data(&mut self) -> State {
        if let Err(err) = self.send.flush_to(&mut self.transport) {
            warn!("Write to client failed: {}", err);
            self.resume = None;
            return State::Release;
        }
        if self.write_closed {
            // Closing handshake sent; drain whatever trails until EOF.
            return match self.raw.read_from(&mut self.transport) {
                Ok(0) => {
                    self.resume = None;
                    State::Release
                }
                Ok(_) => {
                    self.raw.clear();
                    State::AwaitData
                }
                Err(ref err) if retryable(err) => State::AwaitData,
                Err(_) => {
                    self.resume = None;
                    State::Release
                }
            };
        }
        // A pipelining client may already have delivered the next frame.
        if self.raw.find(self.delimiter).is_some() {
            return State::ReadFrame;
        }
        match self.raw.read_from(&mut self.transport) {
            Ok(0) => {
                debug!("Peer closed the connection");
                self.resume = None;
                State::Release
            }
            Ok(_) => State::ReadFrame,
            Err(ref err) if retryable(err) => State::AwaitData,
            Err(err) => {
                warn!("Read from client failed: {}", err);
                self.resume = None;
                State::Release
            }
        }
    }

    fn read_frame(&mut self) -> State {
        if self.raw.len() > self.config.max_message_size {
            warn!("Client exceeded the {} byte message ceiling",
                  self.config.max_message_size);
            self.abort_transaction();
            reply(&mut self.send, 552, "Message exceeds maximum size");
            return State::NextCommand;
        }
        match self.raw.find(self.delimiter) {
            Some(pos) => {
                self.frame.clear();
                self.frame.append(&self.raw.as_slice()[..pos]);
                self.raw.consume_prefix(pos + self.delimiter.len());
                match self.resume.take() {
                    Some(Resume::Command) => State::CommandArrived,
                    Some(Resume::Body) => State::ProcessBody,
                    other => {
                        debug_assert!(
                            other.is_none(),
                            "frame completed under {:?} continuation",
                            other
                        );
                        State::LocalError
                    }
                }
            }
            None => State::AwaitData,
        }
    }

    //--- Command sequencing

    fn command_arrived(&mut self) -> State {
        if self.frame.is_empty() {
            // Idle read, keep waiting for a real command.
            return State::AwaitCommand;
        }
        // A transaction that has run through all its commands is done;
        // close it out before judging what comes next.
        if let Some(m) = self.pending {
            if m.transaction().is_last(m.cmd) {
                trace!("Transaction {} complete", m.transaction().name);
                self.pending = None;
                self.can_retry = false;
            }
        }
        let (word, arg_off) = {
            let (verb, off) = command::split_verb(self.frame.as_slice());
            (String::from_utf8_lossy(verb).into_owned(), off)
        };
        let m = match command::lookup(&word) {
            Some(m) => m,
            None => {
                debug!("Unknown command {:?}", word);
                reply(&mut self.send, 500, "Unknown command");
                return State::NextCommand;
            }
        };
        if m.transaction().immediate {
            self.frame.consume_prefix(arg_off);
            return target(m.verb());
        }
        let accepted = if self.should_retry {
            self.pending == Some(m)
        } else if let Some(p) = self.pending {
            p.txn == m.txn
                && (m.cmd == p.cmd + 1 || (self.can_retry && m.cmd == p.cmd))
        } else {
            m.cmd == 0
        };
        if !accepted {
            debug!("Command {} out of sequence", word);
            reply(&mut self.send, 421,
                  "Command out of sequence; try again later");
            return State::NextCommand;
        }
        self.frame.consume_prefix(arg_off);
        self.pending = Some(m);
        self.should_retry = false;
        self.can_retry = false;
        target(m.verb())
    }

    //--- Command handlers

    fn helo_or_ehlo(&mut self, extended: bool) -> State {
        let arg = String::from_utf8_lossy(self.frame.as_slice()).into_owned();
        let domain = match syntax::helo_domain(&arg) {
            Some(domain) => domain,
            None => {
                reply(&mut self.send, 500, "Invalid domain");
                return State::NextCommand;
            }
        };
        if self.helo.is_some() {
            reply(&mut self.send, 500, "Domain already declared");
            return State::NextCommand;
        }
        info!("Client announces itself as {}", domain);
        self.helo = Some(domain.to_owned());
        if extended {
            Reply::new(250)
                .line(self.config.hostname.clone())
                .line("8BITMIME")
                .line(format!("SIZE {}", self.config.max_message_size))
                .push_to(&mut self.send);
        } else {
            reply(&mut self.send, 250, &self.config.hostname);
        }
        State::NextCommand
    }

    fn mail(&mut self) -> State {
        // Set before parsing so a failed attempt may be repeated.
        self.should_retry = true;
        let arg = String::from_utf8_lossy(self.frame.as_slice()).into_owned();
        let sender = match syntax::mail_from(&arg) {
            Some(sender) => sender,
            None => return State::SyntaxError,
        };
        if sender.is_empty() {
            info!("Mail from the null sender");
        } else {
            info!("Mail from <{}>", sender);
        }
        self.sender = Some(sender.to_owned());
        self.should_retry = false;
        reply(&mut self.send, 250, "Ok");
        State::NextCommand
    }

    fn rcpt(&mut self) -> State {
        self.should_retry = true;
        let arg = String::from_utf8_lossy(self.frame.as_slice()).into_owned();
        let rcpt = match syntax::rcpt_to(&arg) {
            Some(rcpt) => rcpt,
            None => return State::SyntaxError,
        };
        if !self.handler.recipient_exists(rcpt) {
            // A no-op outcome, not a success: the retry flag stays set.
            info!("Rejecting unknown recipient <{}>", rcpt);
            reply(&mut self.send, 550, "No such recipient here");
            return State::NextCommand;
        }
        self.recipients.push(rcpt.to_owned());
        self.should_retry = false;
        self.can_retry = true;
        reply(&mut self.send, 250, "Ok");
        State::NextCommand
    }

    fn data(&mut self) -> State {
        self.delimiter = BODY_END;
        // The marker lets a body consisting of a lone terminating dot
        // match the delimiter without special casing.
        self.raw.prepend(CRLF);
        reply(&mut self.send, 354,
              "Start mail input; end with <CRLF>.<CRLF>");
        self.resume = Some(Resume::Body);
        State::AwaitData
    }

    fn process_body(&mut self) -> State {
        self.delimiter = CRLF;
        let body = self.frame.as_slice();
        let body = body.strip_prefix(CRLF).unwrap_or(body);
        let sender = self.sender.as_deref().unwrap_or("");
        match self.handler.store_message(sender, &self.recipients, body) {
            Ok(id) => {
                info!("Message of {} bytes queued as {}", body.len(), id);
                reply(&mut self.send, 250, &format!("Ok, queued as {}", id));
            }
            Err(err) => {
                warn!("Storing message failed: {:#}", err);
                reply(&mut self.send, 554, "Transaction failed");
            }
        }
        self.sender = None;
        self.recipients.clear();
        State::NextCommand
    }

    fn rset(&mut self) -> State {
        self.resume = Some(Resume::ResetAck);
        State::Release
    }

    fn reset_ack(&mut self) -> State {
        reply(&mut self.send, 250, "Ok");
        State::NextCommand
    }

    fn next_command(&mut self) -> State {
        self.frame.clear();
        State::AwaitCommand
    }

    //--- Error and teardown states

    fn syntax_error(&mut self) -> State {
        reply(&mut self.send, 500, "Syntax error");
        State::NextCommand
    }

    fn local_error(&mut self) -> State {
        self.error = Some((451, "Local error in processing".into()));
        State::CloseWithError
    }

    fn close_with_error(&mut self) -> State {
        match self.error.take() {
            None => State::NextCommand,
            Some((code, message)) => {
                reply(&mut self.send, code, &message);
                State::CloseConnection
            }
        }
    }

    fn close_connection(&mut self) -> State {
        reply(&mut self.send, 221, "Bye");
        if let Err(err) = self.send.flush_to(&mut self.transport) {
            warn!("Write to client failed: {}", err);
            self.resume = None;
            return State::Release;
        }
        if let Err(err) = self.transport.shutdown_write() {
            trace!("Shutdown failed: {}", err);
        }
        self.write_closed = true;
        self.resume = None;
        State::AwaitData
    }

    fn release(&mut self) -> State {
        // Best effort; the peer may already be gone.
        let _ = self.send.flush_to(&mut self.transport);
        self.raw.clear();
        self.frame.clear();
        self.delimiter = CRLF;
        self.helo = None;
        self.pending = None;
        self.should_retry = false;
        self.can_retry = false;
        self.sender = None;
        self.recipients.clear();
        match self.resume.take() {
            Some(Resume::ResetAck) => State::ResetAck,
            _ => State::Terminal,
        }
    }

    /// Drops the in-progress transaction after an oversized read.
    fn abort_transaction(&mut self) {
        self.raw.clear();
        self.delimiter = CRLF;
        self.resume = None;
        self.pending = None;
        self.should_retry = false;
        self.can_retry = false;
        self.sender = None;
        self.recipients.clear();
    }
}

/// The state a command verb dispatches to once accepted.
fn target(verb: Verb) -> State {
    match verb {
        Verb::Helo => State::Helo,
        Verb::Ehlo => State::Ehlo,
        Verb::Mail => State::Mail,
        Verb::Rcpt => State::Rcpt,
        Verb::Data => State::Data,
        Verb::Rset => State::Rset,
        Verb::Quit => State::CloseConnection,
    }
}

fn retryable(err: &io::Error) -> bool {
    matches!(err.kind(),
             io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}
