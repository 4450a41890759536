//! Transport-session abstraction.
//!
//! A transport session is an externally-provided real-time channel (a room in
//! a video-conferencing service). The orchestrator owns two of them per visit
//! (waiting room and clinical) and only ever talks to them through
//! [`TransportSession`]. Delegate callbacks from the provider are delivered
//! out-of-band as [`SessionEvent`]s on an unbounded channel paired with the
//! handle, so the whole state machine can be driven by a fake transport in
//! tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::stats::RawStreamStats;

/// Error codes reported by the transport provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorCode {
    ConnectionDropped,
    ConnectionFailed,
    AuthorizationFailure,
    PublishFailed,
    SubscribeFailed,
    SignalFailed,
    Internal,
}

impl TransportErrorCode {
    /// Dropped and failed connections are handed to the reconnection
    /// supervisor; every other code is fatal.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TransportErrorCode::ConnectionDropped | TransportErrorCode::ConnectionFailed
        )
    }
}

/// Error returned by transport operations.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for TransportError {}

/// A remote media stream announced by the session.
#[derive(Debug, Clone)]
pub struct RemoteStreamInfo {
    pub stream_id: String,
    /// Role tag set by whoever published the stream ("provider", "patient").
    pub publisher_role: String,
    pub has_video: bool,
}

/// Opaque handle for a published local stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherHandle {
    pub publisher_id: String,
}

/// Opaque handle for an active remote subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberHandle {
    pub stream_id: String,
}

/// Out-of-band signal kinds carried over a session.
pub mod signal_kind {
    pub const INSTANT_MESSAGE: &str = "instantMessage";
    pub const TYPING_STATE: &str = "typingStateMessage";
    pub const PARTICIPANT_LEFT: &str = "participantLeft";
    pub const ERROR: &str = "error";
    pub const STATUS_CHANGE: &str = "statusChange";
}

/// Every delegate callback from one transport session, as a single enum.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected {
        /// Identifier of the local connection within the session.
        connection_id: String,
    },
    Disconnected,
    ConnectFailed(TransportErrorCode),
    SessionError(TransportErrorCode),
    Reconnecting,
    Reconnected,
    StreamCreated(RemoteStreamInfo),
    StreamDestroyed {
        stream_id: String,
    },
    SignalReceived {
        kind: String,
        payload: String,
        from_connection_id: String,
    },
    StatsReport {
        subscriber: Option<RawStreamStats>,
        publishers: Vec<RawStreamStats>,
    },
}

/// One externally-provided real-time communication channel.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn session_id(&self) -> &str;

    async fn connect(&self, token: &str) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Send an out-of-band signal to the remote side of the session.
    async fn signal(&self, kind: &str, payload: &str) -> Result<(), TransportError>;

    /// Publish the local media stream.
    async fn publish(&self) -> Result<PublisherHandle, TransportError>;

    async fn unpublish(&self, handle: &PublisherHandle) -> Result<(), TransportError>;

    /// Subscribe to a remote stream.
    async fn subscribe(&self, stream: &RemoteStreamInfo)
        -> Result<SubscriberHandle, TransportError>;

    async fn unsubscribe(&self, handle: &SubscriberHandle) -> Result<(), TransportError>;
}

/// A not-yet-connected session handle plus its delegate event stream,
/// as handed to the orchestrator by the transport provider.
pub struct SessionLink {
    pub session: Arc<dyn TransportSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}
