//! Prompt cycle error types.

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The conversation log rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The completion engine could not be set up or failed outright.
    #[error("completion failed: {0}")]
    Upstream(#[from] LlmError),
}
