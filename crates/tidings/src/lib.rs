//! Live conversation streaming for language-model completions.
//!
//! A prompt posted to a conversation is persisted, answered by a completion
//! model, and fanned out to every client watching that conversation over
//! WebSocket or Server-Sent Events.

pub mod api;
pub mod cache;
pub mod chat;
pub mod config;
pub mod context;
pub mod event;
pub mod llm;
pub mod store;
