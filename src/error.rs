//! ampscale error types

use crate::grad::GroupId;

/// ampscale result type
pub type Result<T> = std::result::Result<T, Error>;

/// ampscale errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid constructor or setter argument
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// Persisted scaler state that cannot be restored
    #[error("invalid scaler state: {reason}")]
    InvalidState {
        /// Description of what went wrong
        reason: String,
    },

    /// Gradients of a group were unscaled twice before `update()`
    #[error("gradients of {group} were already unscaled since the last update")]
    AlreadyUnscaled {
        /// The offending parameter group
        group: GroupId,
    },

    /// A group was stepped already, so it can neither be unscaled nor stepped again
    #[error("{group} already stepped since the last update")]
    AlreadyStepped {
        /// The offending parameter group
        group: GroupId,
    },

    /// Checkpoint I/O or serialization error
    #[error("checkpoint error: {reason}")]
    CheckpointError {
        /// Description of what went wrong
        reason: String,
    },
}
