//! Sync job progress streaming.
//!
//! A sync stream carries progress snapshots until a `complete` or `error`
//! frame. Each snapshot replaces the caller's [`ProgressState`] wholesale.

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::context::SessionContext;
use crate::stream::client::{StreamClient, StreamClientError, StreamRequest};
use crate::stream::framer::Frame;
use crate::stream::session::{
    unless_cancelled, CancelHandle, Dispatch, SessionEnd, StreamError, StreamFeature,
    StreamSession,
};

pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const COMPLETE_EVENT: &str = "complete";
pub const ERROR_EVENT: &str = "error";
/// Message surfaced when an `error` frame names no cause.
pub const DEFAULT_SYNC_ERROR: &str = "Sync failed";

/// Snapshot of a running sync job.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressState {
    pub running: bool,
    pub completed: u64,
    pub total: u64,
    pub percent: f64,
    pub saved_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Integration to sync, or every connected one when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration: Option<String>,
}

/// How a sync stream ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    Failed { message: String },
    /// The server closed the stream without a terminal event.
    Ended,
    Cancelled,
}

/// Result of applying one sync frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncStep {
    Continue,
    Complete,
    Failed(String),
}

/// Applies one sync frame to the progress state.
pub fn apply_sync_frame(progress: &watch::Sender<ProgressState>, frame: &Frame) -> SyncStep {
    if frame.is(HEARTBEAT_EVENT) {
        return SyncStep::Continue;
    }

    match serde_json::from_str::<ProgressState>(&frame.data) {
        Ok(state) => {
            progress.send_replace(state);
        }
        Err(err) => debug!(
            event = "sync_progress_unparseable",
            name = %frame.event,
            error = %err
        ),
    }

    match frame.event.as_str() {
        COMPLETE_EVENT => SyncStep::Complete,
        ERROR_EVENT => SyncStep::Failed(error_message(&frame.data)),
        _ => SyncStep::Continue,
    }
}

fn error_message(data: &str) -> String {
    let payload = serde_json::from_str::<ErrorPayload>(data).unwrap_or_default();
    payload
        .error
        .or(payload.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SYNC_ERROR.to_string())
}

/// Drives an open sync session into `progress`.
///
/// Stops pulling frames at `complete` or `error` even if the server keeps
/// the stream open.
pub async fn consume_sync<S, B>(
    session: &mut StreamSession<S>,
    progress: &watch::Sender<ProgressState>,
) -> Result<SyncOutcome, StreamError>
where
    S: Stream<Item = Result<B, StreamClientError>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut terminal = None;
    let end = session
        .drive(|frame| match apply_sync_frame(progress, &frame) {
            SyncStep::Continue => Dispatch::Continue,
            step => {
                terminal = Some(step);
                Dispatch::Stop
            }
        })
        .await?;

    let outcome = match (end, terminal) {
        (_, Some(SyncStep::Failed(message))) => {
            warn!(event = "sync_failed", message = %message);
            SyncOutcome::Failed { message }
        }
        (_, Some(_)) => SyncOutcome::Completed,
        (SessionEnd::Cancelled, None) => SyncOutcome::Cancelled,
        (_, None) => SyncOutcome::Ended,
    };
    Ok(outcome)
}

/// Sync adapter bound to a client and an authenticated session.
#[derive(Clone, Debug)]
pub struct SyncStream {
    client: StreamClient,
    context: SessionContext,
}

impl SyncStream {
    pub fn new(client: StreamClient, context: SessionContext) -> Self {
        Self { client, context }
    }

    /// Starts a sync job and streams its progress into `progress`.
    ///
    /// Cancelling before the stream is open returns [`SyncOutcome::Cancelled`].
    pub async fn start(
        &self,
        request: &SyncRequest,
        progress: &watch::Sender<ProgressState>,
        cancel: &CancelHandle,
    ) -> Result<SyncOutcome, StreamError> {
        let request_failed = |source| StreamError::RequestFailed {
            feature: StreamFeature::Sync,
            source,
        };
        let stream_request = StreamRequest::post(&self.client.options().paths.sync, request)
            .map_err(request_failed)?;
        let opened =
            unless_cancelled(cancel, self.client.open_stream(&stream_request, &self.context)).await;
        let Some(opened) = opened else {
            return Ok(SyncOutcome::Cancelled);
        };
        let frames = opened.map_err(request_failed)?;

        let mut session = StreamSession::new(StreamFeature::Sync, frames, cancel);
        consume_sync(&mut session, progress).await
    }
}
