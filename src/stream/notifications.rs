//! Push notifications.
//!
//! The notification channel is a long-lived push stream supervised by a
//! [`ReconnectionSupervisor`]. Each recognized event becomes a transient
//! [`Notice`] for the user; `PING` frames only prove liveness and are
//! dropped.

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::context::SessionContext;
use crate::retry::ReconnectPolicy;
use crate::stream::client::StreamClient;
use crate::stream::framer::Frame;
use crate::stream::supervisor::{ChannelState, PushConnector, ReconnectionSupervisor};

pub const CHAT_DONE_EVENT: &str = "AI_CHAT_DONE";
pub const REPORT_DONE_EVENT: &str = "AI_REPORT_DONE";
pub const REPORT_FAILED_EVENT: &str = "AI_REPORT_FAILED";
pub const PING_EVENT: &str = "PING";

pub const CHAT_DONE_MESSAGE: &str = "Your AI chat response is ready";
pub const REPORT_DONE_MESSAGE: &str = "Your AI report is ready";
/// Used when a report failure carries no readable message.
pub const REPORT_FAILED_MESSAGE: &str = "AI report generation failed";

/// Notification vocabulary of the push channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NotificationKind {
    ChatDone,
    ReportDone,
    ReportFailed,
    Ping,
}

impl NotificationKind {
    /// Maps an event name to a kind. The unprefixed names are accepted too.
    pub fn from_event(name: &str) -> Option<Self> {
        match name {
            CHAT_DONE_EVENT | "CHAT_DONE" => Some(Self::ChatDone),
            REPORT_DONE_EVENT | "REPORT_DONE" => Some(Self::ReportDone),
            REPORT_FAILED_EVENT | "REPORT_FAILED" => Some(Self::ReportFailed),
            PING_EVENT => Some(Self::Ping),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NoticeLevel {
    Success,
    Error,
}

/// Transient user-facing notice.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Notice {
    pub kind: NotificationKind,
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ReportFailedPayload {
    #[serde(default)]
    message: Option<String>,
}

/// Builds the notice for one frame, if it warrants one.
pub fn notice_for_frame(frame: &Frame) -> Option<Notice> {
    let Some(kind) = NotificationKind::from_event(&frame.event) else {
        debug!(event = "notification_ignored", name = %frame.event);
        return None;
    };

    let (level, message) = match kind {
        NotificationKind::Ping => return None,
        NotificationKind::ChatDone => (NoticeLevel::Success, CHAT_DONE_MESSAGE.to_string()),
        NotificationKind::ReportDone => (NoticeLevel::Success, REPORT_DONE_MESSAGE.to_string()),
        NotificationKind::ReportFailed => (NoticeLevel::Error, report_failure_message(&frame.data)),
    };
    Some(Notice {
        kind,
        level,
        message,
    })
}

fn report_failure_message(data: &str) -> String {
    serde_json::from_str::<ReportFailedPayload>(data)
        .ok()
        .and_then(|payload| payload.message)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| REPORT_FAILED_MESSAGE.to_string())
}

/// Active notification subscription for one session.
///
/// At most one exists per [`SessionContext`]: subscribing again tears the
/// previous subscription down. Dropping the handle closes the channel.
#[derive(Debug)]
pub struct NotificationChannel {
    supervisor: ReconnectionSupervisor,
}

impl NotificationChannel {
    /// Subscribes to the notification push channel of `client`.
    ///
    /// Returns the channel handle and the receiver notices are queued on.
    pub fn subscribe(
        client: &StreamClient,
        context: &SessionContext,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let policy = client.options().reconnect.clone();
        Self::subscribe_with(client.clone(), context, policy)
    }

    /// Subscribes through an arbitrary connector.
    pub fn subscribe_with<C: PushConnector>(
        connector: C,
        context: &SessionContext,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let supervisor = ReconnectionSupervisor::spawn(connector, context, policy, move |frame| {
            if let Some(notice) = notice_for_frame(&frame) {
                let _ = notices_tx.send(notice);
            }
        });
        (Self { supervisor }, notices_rx)
    }

    pub fn state(&self) -> ChannelState {
        self.supervisor.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.supervisor.watch_state()
    }

    /// Closes the channel; no reconnect is attempted afterwards.
    pub async fn close(self) {
        self.supervisor.teardown().await;
    }
}
