//! Push-channel supervision.
//!
//! A [`ReconnectionSupervisor`] keeps exactly one push channel alive for one
//! [`SessionContext`]. It runs as a single background task that owns the
//! channel and the pending reconnect delay, so at most one of each exists at
//! any instant:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//! Connected    -> Disconnected            (transport error or end of stream)
//! Disconnected -> Connecting              (after the fixed delay)
//! *            -> TornDown                (teardown, revocation, context dropped)
//! ```
//!
//! Delays run on the tokio clock, so a paused runtime drives them in tests.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use secrecy::SecretString;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::retry::ReconnectPolicy;
use crate::stream::client::{ChunkStream, StreamClient, StreamClientError, StreamRequest};
use crate::stream::framer::{Frame, FrameStream};
use crate::stream::session::flag_raised;

/// Opens push channels.
pub trait PushConnector: Send + Sync + 'static {
    /// Opens one push channel authenticated with `credential`.
    fn connect(
        &self,
        credential: SecretString,
    ) -> impl Future<Output = Result<FrameStream<ChunkStream>, StreamClientError>> + Send;
}

impl PushConnector for StreamClient {
    async fn connect(
        &self,
        credential: SecretString,
    ) -> Result<FrameStream<ChunkStream>, StreamClientError> {
        let request = StreamRequest::get(self.options().paths.notifications.clone());
        self.open_with_credential(&request, &credential).await
    }
}

/// Connection state of a supervised push channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: no further connection attempts are made.
    TornDown,
}

/// Handle to a supervised push channel.
///
/// Dropping the handle tears the channel down.
#[derive(Debug)]
pub struct ReconnectionSupervisor {
    teardown: Arc<watch::Sender<bool>>,
    state_tx: Arc<watch::Sender<ChannelState>>,
    state: watch::Receiver<ChannelState>,
    attempts: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl ReconnectionSupervisor {
    /// Starts supervising a push channel for `context`.
    ///
    /// Any push channel previously started for the same context is torn
    /// down first. Every frame received on the channel is passed to
    /// `on_frame` in arrival order.
    pub fn spawn<C, F>(
        connector: C,
        context: &SessionContext,
        policy: ReconnectPolicy,
        on_frame: F,
    ) -> Self
    where
        C: PushConnector,
        F: FnMut(Frame) + Send + 'static,
    {
        let (teardown_tx, teardown_rx) = watch::channel(false);
        let teardown = Arc::new(teardown_tx);
        context.replace_push_channel(Arc::clone(&teardown));

        let (state_tx, state_rx) = watch::channel(ChannelState::Disconnected);
        let state_tx = Arc::new(state_tx);
        let attempts = Arc::new(AtomicU64::new(0));
        let credential = context.subscribe();
        let authenticated = credential.borrow().is_some();
        let worker = Worker {
            connector,
            authenticated,
            credential,
            policy,
            on_frame,
            teardown: teardown_rx,
            state: Arc::clone(&state_tx),
            attempts: Arc::clone(&attempts),
        };

        Self {
            teardown,
            state_tx,
            state: state_rx,
            attempts,
            task: Some(tokio::spawn(worker.run())),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// Number of connection attempts made so far.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Closes the channel, cancels any pending reconnect and waits for the
    /// supervisor task to stop.
    pub async fn teardown(mut self) {
        self.teardown.send_replace(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReconnectionSupervisor {
    fn drop(&mut self) {
        self.teardown.send_replace(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        publish_state(&self.state_tx, ChannelState::TornDown);
    }
}

enum Wake {
    /// The channel failed or ended; reconnect after the delay.
    Lost,
    TornDown,
}

struct Worker<C, F> {
    connector: C,
    /// Whether the context held a credential at any point since spawn.
    authenticated: bool,
    credential: watch::Receiver<Option<SecretString>>,
    policy: ReconnectPolicy,
    on_frame: F,
    teardown: watch::Receiver<bool>,
    state: Arc<watch::Sender<ChannelState>>,
    attempts: Arc<AtomicU64>,
}

impl<C, F> Worker<C, F>
where
    C: PushConnector,
    F: FnMut(Frame) + Send + 'static,
{
    async fn run(mut self) {
        loop {
            let credential = self.credential.borrow_and_update().clone();
            let Some(credential) = credential else {
                if self.authenticated {
                    info!(event = "push_channel_revoked");
                    break;
                }
                self.set_state(ChannelState::Disconnected);
                if !self.wait_for_credential().await {
                    break;
                }
                continue;
            };
            self.authenticated = true;

            if let Wake::TornDown = self.connect_and_pump(credential).await {
                break;
            }

            self.set_state(ChannelState::Disconnected);
            let attempt = self.attempts.load(Ordering::SeqCst);
            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                event = "push_channel_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64
            );
            if !self.wait_delay(delay).await {
                break;
            }
        }

        self.set_state(ChannelState::TornDown);
        info!(
            event = "push_channel_torn_down",
            attempts = self.attempts.load(Ordering::SeqCst)
        );
    }

    async fn connect_and_pump(&mut self, credential: SecretString) -> Wake {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ChannelState::Connecting);
        debug!(event = "push_channel_connecting", attempt);

        let connected = tokio::select! {
            biased;
            _ = flag_raised(&mut self.teardown) => return Wake::TornDown,
            _ = revoked(&mut self.credential) => return Wake::TornDown,
            result = self.connector.connect(credential) => result,
        };
        let mut frames = match connected {
            Ok(frames) => frames,
            Err(err) => {
                warn!(event = "push_channel_connect_failed", attempt, error = %err);
                return Wake::Lost;
            }
        };

        self.set_state(ChannelState::Connected);
        info!(event = "push_channel_connected", attempt);

        loop {
            let item = tokio::select! {
                biased;
                _ = flag_raised(&mut self.teardown) => return Wake::TornDown,
                _ = revoked(&mut self.credential) => return Wake::TornDown,
                item = frames.next() => item,
            };
            match item {
                Some(Ok(frame)) => (self.on_frame)(frame),
                Some(Err(err)) => {
                    warn!(event = "push_channel_lost", attempt, error = %err);
                    return Wake::Lost;
                }
                None => {
                    warn!(event = "push_channel_ended", attempt);
                    return Wake::Lost;
                }
            }
        }
    }

    /// Waits for a credential to appear. Returns `false` on teardown.
    async fn wait_for_credential(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = flag_raised(&mut self.teardown) => false,
            changed = self.credential.changed() => changed.is_ok(),
        }
    }

    /// Waits out the reconnect delay. Returns `false` on teardown.
    async fn wait_delay(&mut self, delay: std::time::Duration) -> bool {
        tokio::select! {
            biased;
            _ = flag_raised(&mut self.teardown) => false,
            _ = revoked(&mut self.credential) => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: ChannelState) {
        publish_state(&self.state, state);
    }
}

/// Publishes a state transition. `TornDown` is final and never overwritten.
fn publish_state(tx: &watch::Sender<ChannelState>, state: ChannelState) {
    let mut previous = state;
    tx.send_if_modified(|current| {
        if *current == state || *current == ChannelState::TornDown {
            return false;
        }
        previous = std::mem::replace(current, state);
        true
    });
    if previous != state {
        debug!(event = "push_channel_state", from = ?previous, to = ?state);
    }
}

/// Resolves once the credential is revoked or the context is gone.
/// Credential rotation does not resolve it.
async fn revoked(credential: &mut watch::Receiver<Option<SecretString>>) {
    loop {
        if credential.changed().await.is_err() {
            return;
        }
        if credential.borrow_and_update().is_none() {
            return;
        }
    }
}
