//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::chat::ChatService;
use crate::event::Broker;
use crate::store::ConversationStore;

/// Time allowed to write one frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between pongs from the peer.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping interval. Must be shorter than [`PONG_WAIT`].
pub const PING_PERIOD: Duration = Duration::from_secs(15);

/// Largest inbound frame accepted from a socket client.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// Payloads buffered between a socket's relay and write loops.
pub const HANDOFF_BUFFER: usize = 100;

/// Socket transport timings.
#[derive(Debug, Clone, Copy)]
pub struct SocketSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_size: usize,
    pub handoff_buffer: usize,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            max_message_size: MAX_MESSAGE_SIZE,
            handoff_buffer: HANDOFF_BUFFER,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub chat: ChatService,
    pub store: Arc<dyn ConversationStore>,
    pub broker: Arc<dyn Broker>,
    pub socket: SocketSettings,
    /// Allowed CORS origins. Empty allows any.
    pub cors_origins: Vec<String>,
    /// Fires on server shutdown; ends every live stream.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        chat: ChatService,
        store: Arc<dyn ConversationStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            chat,
            store,
            broker,
            socket: SocketSettings::default(),
            cors_origins: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_socket_settings(mut self, socket: SocketSettings) -> Self {
        self.socket = socket;
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
