//! The SMTP side of the house.

pub mod buf;
pub mod command;
pub mod handler;
pub mod reply;
pub mod session;
pub mod syntax;
pub mod transport;
