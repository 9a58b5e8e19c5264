//! Test utilities and common setup.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tidings::api::{self, AppState};
use tidings::cache::MemoryCache;
use tidings::chat::ChatService;
use tidings::context::ContextManager;
use tidings::event::{Broker, MemoryBroker};
use tidings::llm::{MockModel, ModelRegistry};
use tidings::store::{ConversationStore, MemoryStore};
use tokio::net::TcpListener;

/// Name the scripted model is registered under; also the default.
pub const MODEL: &str = "gpt-3";

/// Fragments the scripted model streams for every prompt.
pub const FRAGMENTS: [&str; 3] = ["Hello", ", ", "world"];

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub broker: Arc<MemoryBroker>,
    pub model: Arc<MockModel>,
}

/// Application wired entirely in memory around a scripted model.
pub fn test_app() -> TestApp {
    let memory = Arc::new(MemoryBroker::new());
    let broker: Arc<dyn Broker> = memory.clone();
    let store: Arc<dyn ConversationStore> = Arc::new(MemoryStore::new());
    let contexts = ContextManager::new(Arc::new(MemoryCache::new()), store.clone());

    let model = Arc::new(MockModel::new(MODEL, FRAGMENTS));
    let mut models = ModelRegistry::new(MODEL);
    models.register(MODEL, model.clone());

    let chat = ChatService::new(broker.clone(), store.clone(), contexts, Arc::new(models));
    let state = AppState::new(chat, store, broker);
    let router = api::create_router(state.clone());

    TestApp {
        router,
        state,
        broker: memory,
        model,
    }
}

/// Serve `router` on an ephemeral local port.
pub async fn spawn_server(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}
