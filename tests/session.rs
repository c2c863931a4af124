//! End-to-end session tests against a scripted client.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use pretty_assertions::assert_eq;

use mailroom::config::Config;
use mailroom::smtp::handler::Handler;
use mailroom::smtp::session::Session;
use mailroom::smtp::transport::Transport;

//------------ Scripted client ----------------------------------------------

/// Feeds a fixed script of byte chunks and captures everything written.
///
/// Each element of the script becomes one `read` result, so tests
/// control exactly how the client's bytes arrive. An exhausted script
/// reads as end of file.
struct Script {
    input: VecDeque<Vec<u8>>,
    output: Vec<u8>,
    shutdowns: usize,
}

impl Script {
    fn new(chunks: &[&[u8]]) -> Script {
        Script {
            input: chunks.iter().map(|c| c.to_vec()).collect(),
            output: Vec::new(),
            shutdowns: 0,
        }
    }

    fn lines(chunks: &[&str]) -> Script {
        let joined: Vec<Vec<u8>> = chunks
            .iter()
            .map(|line| format!("{}\r\n", line).into_bytes())
            .collect();
        Script {
            input: joined.into(),
            output: Vec::new(),
            shutdowns: 0,
        }
    }
}

impl Read for Script {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(mut chunk) = self.input.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.input.push_front(chunk.split_off(n));
        }
        Ok(n)
    }
}

impl Write for Script {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for &mut Script {
    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdowns += 1;
        Ok(())
    }
}

//------------ Recording handler --------------------------------------------

#[derive(Default)]
struct Recorder {
    stored: Vec<(String, Vec<String>, Vec<u8>)>,
    fail_store: bool,
}

impl Handler for Recorder {
    fn recipient_exists(&self, address: &str) -> bool {
        !address.ends_with("@nowhere.test")
    }

    fn store_message(&mut self, sender: &str, recipients: &[String],
                     body: &[u8]) -> anyhow::Result<String> {
        if self.fail_store {
            anyhow::bail!("queue directory gone");
        }
        self.stored.push((sender.into(), recipients.to_vec(),
                          body.to_vec()));
        Ok(format!("<{}@mx.test>", self.stored.len()))
    }
}

//------------ Helpers ------------------------------------------------------

fn run(script: &mut Script, handler: &mut Recorder, config: &Config) {
    Session::new(script, handler, config).run();
}

fn replies(script: &Script) -> Vec<String> {
    String::from_utf8(script.output.clone())
        .unwrap()
        .split("\r\n")
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

//------------ Tests --------------------------------------------------------

#[test]
fn greets_and_says_goodbye() {
    let mut script = Script::lines(&["QUIT"]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script),
               vec!["220 localhost ESMTP mailroom", "221 Bye"]);
    assert_eq!(script.shutdowns, 1);
}

#[test]
fn peer_hangup_ends_the_session_silently() {
    let mut script = Script::lines(&["HELO client.test"]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script),
               vec!["220 localhost ESMTP mailroom", "250 localhost"]);
    assert_eq!(script.shutdowns, 0);
}

#[test]
fn full_transaction_stores_the_message() {
    let mut script = Script::lines(&[
        "HELO client.test",
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        "Subject: hello\r\n\r\nFirst line.\r\nSecond line.\r\n.",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 localhost",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "250 Ok, queued as <1@mx.test>",
        "221 Bye",
    ]);
    assert_eq!(handler.stored.len(), 1);
    let (sender, recipients, body) = &handler.stored[0];
    assert_eq!(sender, "a@b.com");
    assert_eq!(recipients, &vec!["c@d.com".to_string()]);
    assert_eq!(
        body.as_slice(),
        b"Subject: hello\r\n\r\nFirst line.\r\nSecond line.".as_slice(),
    );
}

#[test]
fn chunk_boundaries_do_not_matter() {
    // Same dialogue as above, delivered in awkward pieces.
    let mut script = Script::new(&[
        b"HELO cli",
        b"ent.test\r\nMAIL FROM:<a@b.com>\r\nRCPT TO:<c@d.com>\r\nDA",
        b"TA\r\nBody",
        b" text\r",
        b"\n.\r\nQUIT\r\n",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 localhost",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "250 Ok, queued as <1@mx.test>",
        "221 Bye",
    ]);
    assert_eq!(handler.stored[0].2, b"Body text");
}

#[test]
fn ehlo_lists_capabilities() {
    let mut config = Config::default();
    config.hostname = "mx.test".into();
    config.max_message_size = 4096;
    let mut script = Script::lines(&["EHLO client.test", "QUIT"]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &config);

    assert_eq!(replies(&script), vec![
        "220 mx.test ESMTP mailroom",
        "250-mx.test",
        "250-8BITMIME",
        "250 SIZE 4096",
        "221 Bye",
    ]);
}

#[test]
fn declared_domain_is_immutable() {
    let mut script = Script::lines(&[
        "HELO one.test",
        "HELO two.test",
        "EHLO three.test",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 localhost",
        "500 Domain already declared",
        "500 Domain already declared",
        "221 Bye",
    ]);
}

#[test]
fn out_of_sequence_commands_are_refused() {
    let mut script = Script::lines(&[
        "RCPT TO:<c@d.com>",
        "MAIL FROM:<a@b.com>",
        "DATA",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "421 Command out of sequence; try again later",
        "250 Ok",
        "421 Command out of sequence; try again later",
        "221 Bye",
    ]);
}

#[test]
fn unknown_and_malformed_commands() {
    let mut script = Script::lines(&[
        "NOOP",
        "HELO not a domain",
        "MAIL FROM:missing-brackets",
        "MAIL FROM:<a@b.com>",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "500 Unknown command",
        "500 Invalid domain",
        "500 Syntax error",
        "250 Ok",
        "221 Bye",
    ]);
}

#[test]
fn failed_mail_may_be_repeated_but_nothing_else() {
    let mut script = Script::lines(&[
        "MAIL FROM:bad",
        "RCPT TO:<c@d.com>",
        "MAIL FROM:<a@b.com>",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "500 Syntax error",
        "421 Command out of sequence; try again later",
        "250 Ok",
        "221 Bye",
    ]);
}

#[test]
fn unknown_recipient_gets_550_and_may_retry() {
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<x@nowhere.test>",
        "RCPT TO:<c@d.com>",
        "RCPT TO:<e@f.com>",
        "DATA",
        "hi\r\n.",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 Ok",
        "550 No such recipient here",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "250 Ok, queued as <1@mx.test>",
        "221 Bye",
    ]);
    assert_eq!(handler.stored[0].1,
               vec!["c@d.com".to_string(), "e@f.com".to_string()]);
}

#[test]
fn rset_clears_everything() {
    let mut script = Script::lines(&[
        "HELO one.test",
        "MAIL FROM:<a@b.com>",
        "RSET",
        // A fresh start: HELO is legal again, RCPT is not.
        "RCPT TO:<c@d.com>",
        "HELO two.test",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 localhost",
        "250 Ok",
        "250 Ok",
        "421 Command out of sequence; try again later",
        "250 localhost",
        "221 Bye",
    ]);
}

#[test]
fn quit_mid_transaction_discards_it() {
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 Ok",
        "250 Ok",
        "221 Bye",
    ]);
    assert!(handler.stored.is_empty());
}

#[test]
fn transaction_completion_reopens_the_sequence() {
    // After a finished transaction a second full one must go through.
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        "one\r\n.",
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        "two\r\n.",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(handler.stored.len(), 2);
    assert_eq!(handler.stored[0].2, b"one");
    assert_eq!(handler.stored[1].2, b"two");
}

#[test]
fn empty_lines_are_ignored() {
    let mut script = Script::new(&[b"\r\n\r\nQUIT\r\n"]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script),
               vec!["220 localhost ESMTP mailroom", "221 Bye"]);
}

#[test]
fn oversized_message_aborts_but_session_survives() {
    let mut config = Config::default();
    config.max_message_size = 64;
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        // Far beyond the ceiling and never terminated.
        &"x".repeat(200),
        "MAIL FROM:<a@b.com>",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &config);

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "552 Message exceeds maximum size",
        "250 Ok",
        "221 Bye",
    ]);
    assert!(handler.stored.is_empty());
}

#[test]
fn store_failure_reports_transaction_failed() {
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        "hi\r\n.",
        "QUIT",
    ]);
    let mut handler = Recorder { fail_store: true, ..Default::default() };
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "554 Transaction failed",
        "221 Bye",
    ]);
}

#[test]
fn body_of_a_single_dot_is_empty() {
    let mut script = Script::lines(&[
        "MAIL FROM:<a@b.com>",
        "RCPT TO:<c@d.com>",
        "DATA",
        ".",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(handler.stored.len(), 1);
    assert_eq!(handler.stored[0].2, b"");
}

#[test]
fn null_sender_is_accepted() {
    let mut script = Script::lines(&[
        "MAIL FROM:<>",
        "RCPT TO:<c@d.com>",
        "DATA",
        "hi\r\n.",
        "QUIT",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(handler.stored[0].0, "");
}

#[test]
fn pipelined_commands_are_served_in_order() {
    let mut script = Script::new(&[
        b"MAIL FROM:<a@b.com>\r\nRCPT TO:<c@d.com>\r\nDATA\r\nhi\r\n.\r\nQUIT\r\n",
    ]);
    let mut handler = Recorder::default();
    run(&mut script, &mut handler, &Config::default());

    assert_eq!(replies(&script), vec![
        "220 localhost ESMTP mailroom",
        "250 Ok",
        "250 Ok",
        "354 Start mail input; end with <CRLF>.<CRLF>",
        "250 Ok, queued as <1@mx.test>",
        "221 Bye",
    ]);
}

#[test]
fn rejected_session_greets_with_the_error() {
    let mut script = Script::new(&[]);
    let mut handler = Recorder::default();
    let config = Config::default();
    Session::rejected(&mut script, &mut handler, &config,
                      421, "no more workers")
        .run();

    assert_eq!(replies(&script), vec!["421 no more workers", "221 Bye"]);
}
