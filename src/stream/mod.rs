//! Realtime stream modules.
//!
//! - `framer`: incremental decoding of chunked text into frames.
//! - `client`: HTTP transport that opens event streams with a bearer credential.
//! - `session`: one open stream with cancellation and terminal state tracking.
//! - `chat`, `sync`, `notifications`: feature adapters dispatching frames to
//!   caller-owned state.
//! - `supervisor`: keeps one push channel alive across transport failures.

/// Chat token streaming adapter.
pub mod chat;
/// HTTP stream transport and request types.
pub mod client;
/// Event-stream frame decoder.
pub mod framer;
/// Push notification adapter.
pub mod notifications;
/// Stream session lifecycle and cancellation.
pub mod session;
/// Push-channel reconnection supervisor.
pub mod supervisor;
/// Sync progress adapter.
pub mod sync;
