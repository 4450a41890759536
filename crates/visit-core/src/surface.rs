//! UI/navigation surface.
//!
//! The core never renders anything. It asks the surface to present screens
//! and receives back opaque view handles that it holds weakly and uses only
//! as sinks for pushed updates.

use std::sync::Arc;

use async_trait::async_trait;

use crate::chat::ChatMessage;

/// Waiting-room screen handle.
pub trait WaitingRoomView: Send + Sync {
    /// Push a new estimated-wait message.
    fn set_wait_time(&self, message: &str);
}

/// Clinical visit screen handle.
pub trait VisitView: Send + Sync {
    /// Toggle the remote video tile as the subscription comes and goes.
    fn set_remote_stream_active(&self, active: bool);
}

/// Chat screen handle for either phase.
pub trait ChatView: Send + Sync {
    fn refresh_messages(&self, messages: &[ChatMessage]);
    fn set_remote_typing(&self, is_typing: bool);
}

/// Imperative navigation requests issued by the orchestrator.
#[async_trait]
pub trait VisitSurface: Send + Sync {
    fn show_waiting_room(&self) -> Arc<dyn WaitingRoomView>;

    fn show_visit(&self) -> Arc<dyn VisitView>;

    fn show_chat(&self) -> Arc<dyn ChatView>;

    fn display_alert(&self, message: &str);

    /// Show the reconnecting indicator (with its cancel affordance).
    fn reconnecting(&self);

    /// Hide the reconnecting indicator.
    fn reconnected(&self);

    /// Ask the user to confirm an action; returns their answer.
    async fn confirm(&self, prompt: &str) -> bool;
}
