//! Core error taxonomy
//!
//! Every failure that reaches the dispatcher is one of a few kinds, and each
//! kind has one user-facing reaction. Chat transport failures are kept apart
//! from git host failures so users are not told GitHub is down when Telegram
//! rejected a call.

use thiserror::Error;

use crate::codec::CodecError;
use crate::providers::{ErrorClass, ProviderError};
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum NotesError {
    /// Bad credential, unknown repository/branch/path
    #[error("Invalid input: {0}")]
    InputValidation(String),

    /// Network, server or authentication failure mid-operation
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Branch kept moving for every attempt
    #[error("Branch '{branch}' changed during {attempts} attempts")]
    ConcurrentMutationConflict { branch: String, attempts: usize },

    /// Stale token or callback for a step that is no longer active
    #[error("State mismatch: {0}")]
    StateMismatch(String),

    /// The chat API rejected or dropped a call
    #[error("Chat transport failed: {0}")]
    ChatUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ProviderError> for NotesError {
    fn from(err: ProviderError) -> Self {
        match err.classify() {
            ErrorClass::InputValidation => NotesError::InputValidation(err.to_string()),
            ErrorClass::Unavailable => NotesError::ProviderUnavailable(err.to_string()),
            ErrorClass::Conflict => match err {
                ProviderError::RefConflict { branch, .. } => {
                    NotesError::ConcurrentMutationConflict { branch, attempts: 1 }
                }
                other => NotesError::ProviderUnavailable(other.to_string()),
            },
        }
    }
}

impl From<CodecError> for NotesError {
    fn from(err: CodecError) -> Self {
        NotesError::StateMismatch(err.to_string())
    }
}

impl NotesError {
    /// Wrap a failure of the chat transport
    pub fn chat(err: ProviderError) -> Self {
        NotesError::ChatUnavailable(err.to_string())
    }

    /// Reply shown to the chat user
    pub fn user_message(&self) -> String {
        match self {
            NotesError::InputValidation(detail) => format!("That did not work: {}", detail),
            NotesError::ProviderUnavailable(_) => {
                "GitHub is not reachable right now. Please try again.".to_string()
            }
            NotesError::ConcurrentMutationConflict { .. } => {
                "The branch changed while saving. Please retry.".to_string()
            }
            NotesError::StateMismatch(_) => "This button has expired.".to_string(),
            NotesError::ChatUnavailable(_) => {
                "Telegram did not accept that request. Please try again.".to_string()
            }
            NotesError::Store(_) => "Something went wrong. Please try again.".to_string(),
        }
    }
}
