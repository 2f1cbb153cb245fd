//! Stream session lifecycle.
//!
//! A [`StreamSession`] owns one open stream: the transport handle wrapped in a
//! [`FrameStream`], the caller's cancellation signal and the terminal state.
//! Frames are pulled one at a time; cancellation is checked at every pull, and
//! the terminal transition drops the transport so no connection stays open.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::stream::client::{ChunkStream, StreamClientError};
use crate::stream::framer::{Frame, FrameStream};

/// Feature a stream belongs to, used to label errors and logs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StreamFeature {
    Chat,
    Sync,
    Notifications,
}

impl fmt::Display for StreamFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Chat => "chat",
            Self::Sync => "sync",
            Self::Notifications => "notifications",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the feature adapters.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream could not be opened; no frame was pulled.
    #[error("{feature} request failed: {source}")]
    RequestFailed {
        feature: StreamFeature,
        #[source]
        source: StreamClientError,
    },

    /// The transport failed after the stream was established.
    #[error("{feature} stream interrupted: {source}")]
    Interrupted {
        feature: StreamFeature,
        #[source]
        source: StreamClientError,
    },
}

impl StreamError {
    pub fn feature(&self) -> StreamFeature {
        match self {
            Self::RequestFailed { feature, .. } | Self::Interrupted { feature, .. } => *feature,
        }
    }
}

/// Lifecycle state of a [`StreamSession`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Open,
    /// The stream ended or the adapter stopped consuming it.
    Closed,
    /// The transport failed mid-stream.
    Errored,
    /// The caller cancelled the session.
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// What an adapter wants after handling one frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dispatch {
    Continue,
    /// Stop pulling frames and close the session.
    Stop,
}

/// How a driven session ended without error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionEnd {
    /// The dispatch callback asked to stop.
    Stopped,
    /// The server ended the stream.
    Exhausted,
    /// The caller cancelled the session.
    Cancelled,
}

/// Handle used to request cancellation of a session.
///
/// Cancelling is idempotent and cancelling a session that already reached a
/// terminal state has no effect.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves once the flag is raised. Never resolves if the sender is gone.
pub(crate) async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `open` unless the caller cancels first.
///
/// Returns `None` when cancelled, dropping `open` mid-flight.
pub(crate) async fn unless_cancelled<F: Future>(cancel: &CancelHandle, open: F) -> Option<F::Output> {
    let mut cancelled = cancel.subscribe();
    tokio::select! {
        biased;
        _ = flag_raised(&mut cancelled) => {
            debug!(event = "stream_open_cancelled");
            None
        }
        output = open => Some(output),
    }
}

/// One open stream owned by an adapter.
pub struct StreamSession<S = ChunkStream> {
    feature: StreamFeature,
    frames: Option<FrameStream<S>>,
    cancel: watch::Receiver<bool>,
    state: SessionState,
    frames_seen: u64,
}

impl<S> fmt::Debug for StreamSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("feature", &self.feature)
            .field("state", &self.state)
            .field("frames_seen", &self.frames_seen)
            .finish_non_exhaustive()
    }
}

impl<S, B> StreamSession<S>
where
    S: Stream<Item = Result<B, StreamClientError>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(feature: StreamFeature, frames: FrameStream<S>, cancel: &CancelHandle) -> Self {
        Self {
            feature,
            frames: Some(frames),
            cancel: cancel.subscribe(),
            state: SessionState::Open,
            frames_seen: 0,
        }
    }

    pub fn feature(&self) -> StreamFeature {
        self.feature
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of frames handed out so far.
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Pulls the next frame.
    ///
    /// Returns `Ok(None)` once the session is terminal: the stream ended, the
    /// session was closed, or the caller cancelled. A transport failure
    /// returns [`StreamError::Interrupted`] once and leaves the session
    /// `Errored`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, StreamError> {
        if self.state.is_terminal() {
            return Ok(None);
        }
        if *self.cancel.borrow() {
            self.finish(SessionState::Aborted);
            return Ok(None);
        }
        let Some(frames) = self.frames.as_mut() else {
            return Ok(None);
        };

        let next = tokio::select! {
            biased;
            _ = flag_raised(&mut self.cancel) => None,
            item = frames.next() => Some(item),
        };

        match next {
            None => {
                self.finish(SessionState::Aborted);
                Ok(None)
            }
            Some(Some(Ok(frame))) => {
                self.frames_seen += 1;
                Ok(Some(frame))
            }
            Some(Some(Err(source))) => {
                self.finish(SessionState::Errored);
                Err(StreamError::Interrupted {
                    feature: self.feature,
                    source,
                })
            }
            Some(None) => {
                self.finish(SessionState::Closed);
                Ok(None)
            }
        }
    }

    /// Pulls frames and hands each to `on_frame` until the stream ends, the
    /// callback returns [`Dispatch::Stop`] or the caller cancels.
    pub async fn drive<F>(&mut self, mut on_frame: F) -> Result<SessionEnd, StreamError>
    where
        F: FnMut(Frame) -> Dispatch,
    {
        while let Some(frame) = self.next_frame().await? {
            if on_frame(frame) == Dispatch::Stop {
                self.close();
                return Ok(SessionEnd::Stopped);
            }
        }

        Ok(match self.state {
            SessionState::Aborted => SessionEnd::Cancelled,
            _ => SessionEnd::Exhausted,
        })
    }

    /// Closes the session and releases the transport. No-op once terminal.
    pub fn close(&mut self) {
        if !self.state.is_terminal() {
            self.finish(SessionState::Closed);
        }
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.frames = None;
        debug!(
            event = "stream_session_finished",
            feature = %self.feature,
            state = ?state,
            frames = self.frames_seen
        );
    }
}
