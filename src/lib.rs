//! Client SDK for realtime push updates delivered as text event streams.
//!
//! The crate is organized by concern:
//! - `stream`: framing, streaming sessions, feature adapters and the
//!   push-channel supervisor.
//! - `context`: the authenticated session value every stream reads its
//!   credential from.
//! - `retry`: reconnect delay policy and timeout helpers.

/// Authenticated session context shared by adapters and the supervisor.
pub mod context;
/// Reconnect policy and timeout helpers used across the SDK.
pub mod retry;
/// Event-stream framing, sessions, adapters and push-channel supervision.
pub mod stream;

pub use context::SessionContext;
pub use stream::framer::Frame;
