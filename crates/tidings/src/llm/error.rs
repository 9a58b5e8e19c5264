//! Completion engine error types.

use thiserror::Error;

pub type LlmResult<T> = Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("stream setup failed: {0}")]
    StreamSetup(#[from] reqwest_eventsource::CannotCloneRequestError),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream returned no choices")]
    EmptyResponse,

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
}
