use thiserror::Error;

/// Why a line could not be queued for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session is closed")]
    Closed,

    #[error("session outbox is full")]
    Full,
}
