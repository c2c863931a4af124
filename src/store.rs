//! Filesystem message store and the local recipient directory.
//!
//! An accepted message is rewritten before it hits the queue: the store
//! stamps its own From, Date, Message-ID and To headers, keeps the
//! client's Subject (or substitutes a placeholder) and any other
//! headers it does not recognize, and appends the body unchanged.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use log::{info, trace};
use regex::bytes::Regex;
use thiserror::Error;
use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

use crate::config::Config;
use crate::smtp::handler::Handler;
use crate::smtp::syntax;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cannot write message file: {0}")]
    Io(#[from] io::Error),
    #[error("cannot format message date: {0}")]
    Date(#[from] time::error::Format),
}

/// Header block terminator inside a message.
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Headers the store generates itself; client copies are dropped.
const REWRITTEN: &[&str] = &["From", "To", "Date", "Message-ID"];

fn header_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^([A-Za-z0-9-]+):[ \t]*([^\r\n]*)")
            .expect("header pattern is valid")
    })
}

//------------ FsStore ------------------------------------------------------

/// Stores messages as single files in the queue directory.
pub struct FsStore {
    queue_dir: PathBuf,
    hostname: String,
    local_domains: Vec<String>,
    seq: u64,
}

impl FsStore {
    pub fn new(config: &Config) -> FsStore {
        FsStore {
            queue_dir: config.effective_queue_dir(),
            hostname: config.hostname.clone(),
            local_domains: config.local_domains.clone(),
            seq: 0,
        }
    }

    fn next_queue_name(&mut self) -> (String, String) {
        self.seq += 1;
        let secs = OffsetDateTime::now_utc().unix_timestamp();
        let pid = std::process::id();
        let file = format!("{}-{}-{}-{}", secs, self.hostname, pid, self.seq);
        let id = format!("<{}.{}.{}@{}>", secs, pid, self.seq, self.hostname);
        (file, id)
    }
}

impl Handler for FsStore {
    fn recipient_exists(&self, address: &str) -> bool {
        let Some((_, domain)) = syntax::address_parts(address) else {
            return false;
        };
        self.local_domains.is_empty()
            || self
                .local_domains
                .iter()
                .any(|local| local.eq_ignore_ascii_case(domain))
    }

    fn store_message(&mut self, sender: &str, recipients: &[String],
                     body: &[u8]) -> anyhow::Result<String> {
        let (file_name, queue_id) = self.next_queue_name();
        let path = self.queue_dir.join(&file_name);
        info!("Saving message to {}", path.display());

        let (client_headers, content) = split_headers(body);
        let message = compose(sender, recipients, &queue_id,
                              &client_headers, content)
            .map_err(StoreError::from)?;

        fs::create_dir_all(&self.queue_dir).map_err(StoreError::from)?;
        let mut file = File::create(&path).map_err(StoreError::from)?;
        file.write_all(&message).map_err(StoreError::from)?;
        Ok(queue_id)
    }
}

//------------ Header rewriting ---------------------------------------------

/// One header from the client, name already case-normalized.
#[derive(Debug, PartialEq, Eq)]
struct ClientHeader {
    name: String,
    value: Vec<u8>,
}

/// Splits a message into its parsed header block and the body.
///
/// Without an empty separator line the whole input counts as body.
fn split_headers(data: &[u8]) -> (Vec<ClientHeader>, &[u8]) {
    let Some(end) = find(data, HEADER_END) else {
        return (Vec::new(), data);
    };
    let region = &data[..end + 2];
    let body = &data[end + HEADER_END.len()..];
    let mut headers = Vec::new();
    for caps in header_pattern().captures_iter(region) {
        let name = String::from_utf8_lossy(&caps[1]).into_owned();
        headers.push(ClientHeader {
            name: normalize(&name),
            value: caps[2].to_vec(),
        });
        trace!("Client header {}", headers[headers.len() - 1].name);
    }
    (headers, body)
}

/// `subject-line` becomes `Subject-line`.
fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (idx, ch) in name.chars().enumerate() {
        if idx == 0 {
            out.extend(ch.to_uppercase());
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

fn compose(sender: &str, recipients: &[String], queue_id: &str,
           client_headers: &[ClientHeader], body: &[u8])
           -> Result<Vec<u8>, time::error::Format> {
    let mut out = Vec::with_capacity(body.len() + 256);
    let from = if sender.is_empty() {
        "<>".to_string()
    } else {
        format!("{} <{}>", sender, sender)
    };
    let date = OffsetDateTime::now_utc().format(&Rfc2822)?;
    push_header(&mut out, "From", from.as_bytes());
    push_header(&mut out, "Date", date.as_bytes());
    push_header(&mut out, "Message-ID", queue_id.as_bytes());
    push_header(&mut out, "To", recipients.join("; ").as_bytes());

    match client_headers.iter().find(|h| h.name == "Subject") {
        Some(subject) => push_header(&mut out, "Subject", &subject.value),
        None => push_header(&mut out, "Subject", b"<No subject>"),
    }
    for header in client_headers {
        if header.name != "Subject"
            && !REWRITTEN.contains(&header.name.as_str())
        {
            push_header(&mut out, &header.name, &header.value);
        }
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    Ok(out)
}

fn push_header(out: &mut Vec<u8>, name: &str, value: &[u8]) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}
