use thiserror::Error;

/// Failures raised by the client itself, before any network call is made.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The push channel is down. Outbound frames fail fast instead of being
    /// queued for later delivery.
    #[error("push session is not connected")]
    NotConnected,
    /// No open conversation and not enough identity data to create one.
    #[error("no conversation is open and no counterpart is known")]
    MissingConversationTarget,
    /// The client has been closed and will not accept further calls.
    #[error("client is closed")]
    Closed,
}
