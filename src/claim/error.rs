use thiserror::Error;

/// Error type for claim store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// The store could not be reached or refused to answer.
    #[error("claim store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error reply.
    #[error("claim store rejected request: {0}")]
    Rejected(String),
    /// The store answered with something other than created / already present.
    #[error("unexpected claim store reply: {0}")]
    UnexpectedReply(String),
}
