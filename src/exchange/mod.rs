// =============================================================================
// Exchange gateway — Bithumb REST + WebSocket
// =============================================================================

pub mod client;
pub mod stream;

pub use client::BithumbClient;
pub use stream::{run_bithumb_stream, StreamEvent, StreamHandlers};
