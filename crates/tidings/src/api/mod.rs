//! HTTP and streaming API.

mod error;
mod handlers;
mod routes;
mod socket;
mod sse;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{
    AppState, HANDOFF_BUFFER, MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, SocketSettings,
    WRITE_WAIT,
};
