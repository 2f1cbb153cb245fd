//! Chat token streaming.
//!
//! The server answers a chat request with `token` frames carrying text
//! fragments, an optional `sources` frame and a final `done` frame. Each
//! frame is applied to the caller's [`ChatMessage`] as soon as it arrives.

use std::collections::BTreeMap;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::context::SessionContext;
use crate::stream::client::{StreamClient, StreamClientError, StreamRequest};
use crate::stream::framer::Frame;
use crate::stream::session::{
    unless_cancelled, CancelHandle, Dispatch, SessionEnd, StreamError, StreamFeature,
    StreamSession,
};

pub const TOKEN_EVENT: &str = "token";
pub const SOURCES_EVENT: &str = "sources";
pub const DONE_EVENT: &str = "done";

// Newlines inside token payloads travel as a literal backslash-n.
const ESCAPED_NEWLINE: &str = "\\n";

/// Assistant message being assembled from a token stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatMessage {
    pub content: String,
    pub sources: Option<Vec<SourceEntry>>,
    /// `false` once the `done` frame arrived.
    pub streaming: bool,
    /// `true` until the first token arrives.
    pub awaiting_response: bool,
}

impl ChatMessage {
    /// Empty message waiting for its first token.
    pub fn pending() -> Self {
        Self {
            streaming: true,
            awaiting_response: true,
            ..Self::default()
        }
    }
}

/// Reference attached to an answer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ChatSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One element of a `sources` payload.
///
/// Objects decode as [`ChatSource`]; any other JSON value is kept verbatim.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SourceEntry {
    Document(ChatSource),
    Other(Value),
}

impl SourceEntry {
    pub fn document(&self) -> Option<&ChatSource> {
        match self {
            Self::Document(source) => Some(source),
            Self::Other(_) => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Applies one chat frame to the message.
pub fn apply_chat_frame(message: &mut ChatMessage, frame: &Frame) -> Dispatch {
    match frame.event.as_str() {
        TOKEN_EVENT => {
            message.content.push_str(&unescape_newlines(&frame.data));
            message.awaiting_response = false;
            Dispatch::Continue
        }
        SOURCES_EVENT => {
            match serde_json::from_str::<Vec<SourceEntry>>(&frame.data) {
                Ok(sources) => message.sources = Some(sources),
                Err(err) => debug!(event = "chat_sources_unparseable", error = %err),
            }
            Dispatch::Continue
        }
        DONE_EVENT => {
            message.streaming = false;
            Dispatch::Stop
        }
        other => {
            debug!(event = "chat_frame_ignored", name = other);
            Dispatch::Continue
        }
    }
}

fn unescape_newlines(data: &str) -> String {
    data.replace(ESCAPED_NEWLINE, "\n")
}

/// Drives an open chat session into `message`.
///
/// Every frame is applied through `send_modify`, so receivers observe each
/// token as it arrives. A cancelled session leaves the message as it was
/// after the last applied frame.
pub async fn consume_chat<S, B>(
    session: &mut StreamSession<S>,
    message: &watch::Sender<ChatMessage>,
) -> Result<SessionEnd, StreamError>
where
    S: Stream<Item = Result<B, StreamClientError>> + Unpin,
    B: AsRef<[u8]>,
{
    session
        .drive(|frame| {
            let mut dispatch = Dispatch::Continue;
            message.send_modify(|current| dispatch = apply_chat_frame(current, &frame));
            dispatch
        })
        .await
}

/// Chat adapter bound to a client and an authenticated session.
#[derive(Clone, Debug)]
pub struct ChatStream {
    client: StreamClient,
    context: SessionContext,
}

impl ChatStream {
    pub fn new(client: StreamClient, context: SessionContext) -> Self {
        Self { client, context }
    }

    /// Sends a chat request and streams the answer into `message`.
    ///
    /// Returns [`SessionEnd::Stopped`] once `done` arrived. Establishment
    /// failures surface as [`StreamError::RequestFailed`] before `message`
    /// is touched. Cancelling before the stream is open sends nothing further
    /// and returns [`SessionEnd::Cancelled`].
    pub async fn send(
        &self,
        request: &ChatRequest,
        message: &watch::Sender<ChatMessage>,
        cancel: &CancelHandle,
    ) -> Result<SessionEnd, StreamError> {
        let request_failed = |source| StreamError::RequestFailed {
            feature: StreamFeature::Chat,
            source,
        };
        let stream_request = StreamRequest::post(&self.client.options().paths.chat, request)
            .map_err(request_failed)?;
        let opened =
            unless_cancelled(cancel, self.client.open_stream(&stream_request, &self.context)).await;
        let Some(opened) = opened else {
            return Ok(SessionEnd::Cancelled);
        };
        let frames = opened.map_err(request_failed)?;

        let mut session = StreamSession::new(StreamFeature::Chat, frames, cancel);
        consume_chat(&mut session, message).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::watch;

    use serde_json::json;

    use super::{apply_chat_frame, consume_chat, ChatMessage, ChatRequest, ChatSource, SourceEntry};
    use crate::stream::framer::Frame;
    use crate::stream::session::tests::{channel_session, session_over, transport_failure};
    use crate::stream::session::{CancelHandle, Dispatch, SessionEnd, StreamError, StreamFeature};

    #[test]
    fn restores_escaped_newlines_in_tokens() {
        let mut message = ChatMessage::pending();
        apply_chat_frame(&mut message, &Frame::new("token", "line one\\nline two"));
        assert_eq!(message.content, "line one\nline two");
    }

    #[test]
    fn first_token_clears_pending_indicator() {
        let mut message = ChatMessage::pending();
        assert!(message.awaiting_response);
        apply_chat_frame(&mut message, &Frame::new("token", "Hi"));
        assert!(!message.awaiting_response);
        assert!(message.streaming);
    }

    #[test]
    fn attaches_parsed_sources() {
        let mut message = ChatMessage::pending();
        let payload = r#"[{"title":"Q3 report","url":"https://example.test/q3","page":4}]"#;
        apply_chat_frame(&mut message, &Frame::new("sources", payload));

        let sources = message.sources.expect("sources attached");
        assert_eq!(sources.len(), 1);
        let source = sources[0].document().expect("document source");
        assert_eq!(source.title.as_deref(), Some("Q3 report"));
        assert_eq!(source.extra.get("page"), Some(&json!(4)));
    }

    #[test]
    fn attaches_sources_that_are_not_objects() {
        let mut message = ChatMessage::pending();
        apply_chat_frame(&mut message, &Frame::new("sources", r#"["policy.pdf",3]"#));

        assert_eq!(
            message.sources,
            Some(vec![
                SourceEntry::Other(json!("policy.pdf")),
                SourceEntry::Other(json!(3)),
            ])
        );
        assert!(message.sources.expect("sources")[0].document().is_none());
    }

    #[test]
    fn request_uses_camel_case_fields() {
        let request = ChatRequest::new("hi").in_conversation("c1");
        assert_eq!(
            serde_json::to_value(&request).expect("serialize"),
            json!({"message": "hi", "conversationId": "c1"})
        );
        assert_eq!(
            serde_json::to_value(ChatRequest::new("hi")).expect("serialize"),
            json!({"message": "hi"})
        );
    }

    #[test]
    fn unparseable_sources_are_swallowed() {
        let mut message = ChatMessage::pending();
        message.content.push_str("kept");
        let dispatch = apply_chat_frame(&mut message, &Frame::new("sources", "[not json"));
        assert_eq!(dispatch, Dispatch::Continue);
        assert!(message.sources.is_none());
        assert_eq!(message.content, "kept");
    }

    #[test]
    fn done_marks_message_terminal() {
        let mut message = ChatMessage::pending();
        assert_eq!(
            apply_chat_frame(&mut message, &Frame::new("done", "")),
            Dispatch::Stop
        );
        assert!(!message.streaming);
    }

    #[tokio::test]
    async fn streams_tokens_sources_and_done_into_caller_state() {
        let cancel = CancelHandle::new();
        let mut session = session_over(
            StreamFeature::Chat,
            &[
                "event: token\ndata: Hel",
                "lo\n\nevent: token\ndata: ,\\nworld\n\nevent: sources\ndata: [{\"title\":\"a\"}]\n\n",
                "event: done\ndata: [DONE]\n\nevent: token\ndata: late\n\n",
            ],
            &cancel,
        );
        let (tx, rx) = watch::channel(ChatMessage::pending());

        let end = consume_chat(&mut session, &tx).await.expect("chat");

        assert_eq!(end, SessionEnd::Stopped);
        let message = rx.borrow().clone();
        assert_eq!(message.content, "Hello,\nworld");
        assert_eq!(
            message.sources,
            Some(vec![SourceEntry::Document(ChatSource {
                title: Some("a".to_string()),
                ..ChatSource::default()
            })])
        );
        assert!(!message.streaming);
    }

    #[tokio::test]
    async fn cancelled_chat_keeps_state_from_observed_frames() {
        let cancel = CancelHandle::new();
        let (chunks, mut session) = channel_session(StreamFeature::Chat, &cancel);
        let (tx, rx) = watch::channel(ChatMessage::pending());
        chunks
            .send(Ok(Bytes::from_static(b"event: token\ndata: partial\n\n")))
            .expect("send");

        let canceller = cancel.clone();
        let mut watcher = rx.clone();
        tokio::spawn(async move {
            let _ = watcher.changed().await;
            canceller.cancel();
        });

        let end = consume_chat(&mut session, &tx).await.expect("chat");
        assert_eq!(end, SessionEnd::Cancelled);

        let _ = chunks.send(Ok(Bytes::from_static(b"event: token\ndata: more\n\n")));
        let message = rx.borrow().clone();
        assert_eq!(message.content, "partial");
        assert!(message.streaming, "cancellation is not completion");
    }

    #[tokio::test]
    async fn mid_stream_failure_propagates() {
        let cancel = CancelHandle::new();
        let (chunks, mut session) = channel_session(StreamFeature::Chat, &cancel);
        let (tx, _rx) = watch::channel(ChatMessage::pending());
        chunks
            .send(Ok(Bytes::from_static(b"event: token\ndata: a\n\n")))
            .expect("send");
        chunks.send(Err(transport_failure())).expect("send");

        let err = consume_chat(&mut session, &tx).await.expect_err("interrupted");
        assert!(matches!(err, StreamError::Interrupted { feature: StreamFeature::Chat, .. }));
        assert_eq!(tx.borrow().content, "a");
    }
}
