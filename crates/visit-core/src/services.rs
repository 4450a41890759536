//! Collaborator traits consumed by the orchestrator.
//!
//! Everything the core needs from the backend is behind one of these traits;
//! `api.rs` carries the production HTTP implementations and tests supply
//! in-memory fakes.

use async_trait::async_trait;

use crate::chat::ChatMessage;
use crate::errors::VisitError;

/// Fetches a per-session access token at join/resume time.
#[async_trait]
pub trait TokenService: Send + Sync {
    async fn fetch_token(&self, visit_id: &str, session_id: &str) -> Result<String, VisitError>;
}

/// Estimated wait returned by the backend.
#[derive(Debug, Clone, Default)]
pub struct WaitTimeEstimate {
    pub message: String,
    pub localization_key: Option<String>,
    pub min_seconds: Option<u64>,
    pub max_seconds: Option<u64>,
}

#[async_trait]
pub trait WaitTimeService: Send + Sync {
    async fn estimate(&self, visit_id: &str) -> Result<WaitTimeEstimate, VisitError>;
}

/// Durable log for sent chat messages. Best effort: the orchestrator swallows
/// failures after logging them.
#[async_trait]
pub trait ChatPersistence: Send + Sync {
    async fn post(
        &self,
        visit_id: &str,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<(), VisitError>;
}

/// Answers whether media permissions were granted. Prompting the user is the
/// shell's job; the core only checks the answer before opening the clinical
/// session.
#[async_trait]
pub trait MediaPermissions: Send + Sync {
    async fn media_granted(&self) -> bool;
}
