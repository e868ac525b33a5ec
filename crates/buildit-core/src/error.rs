//! Error types for BuildIt.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("hook {hook} failed: {message}")]
    Hook { hook: &'static str, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a failure raised by a user-supplied hook.
    pub fn hook(hook: &'static str, message: impl Into<String>) -> Self {
        Self::Hook {
            hook,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
