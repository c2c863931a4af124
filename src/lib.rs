//! A small store-and-forward mail receiver.
//!
//! The parent process accepts connections and forks one worker per
//! client; each worker runs an SMTP session and writes accepted
//! messages into the queue directory.

pub mod config;
pub mod logger;
pub mod server;
pub mod smtp;
pub mod store;
pub mod sys;
