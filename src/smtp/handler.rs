//! The collaborator seam of the session engine.

/// What a session needs from the outside world.
///
/// The engine itself only speaks the protocol; deciding whether a
/// recipient exists and persisting an accepted message are somebody
/// else's business. The server wires in the filesystem store; tests
/// substitute their own.
pub trait Handler {
    /// Whether mail for `address` can be accepted here.
    fn recipient_exists(&self, address: &str) -> bool;

    /// Persists a finished message, returning its queue identifier.
    fn store_message(
        &mut self,
        sender: &str,
        recipients: &[String],
        body: &[u8],
    ) -> anyhow::Result<String>;
}
