//! Virtual visit session core.
//!
//! Pure Rust crate with no platform dependencies: drives a telehealth visit
//! through its waiting-room and clinical phases over two transport sessions.
//! Consumed by native UI shells, which supply the transport provider, the
//! navigation surface, and the backend services.

pub mod api;
pub mod chat;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod reconnect;
pub mod services;
pub mod signaling;
pub mod state;
pub mod stats;
pub mod surface;
pub mod transport;
pub mod wait_time;

pub use chat::ChatMessage;
pub use errors::VisitError;
pub use events::{CompletionReason, VisitEvent, VisitEventListener};
pub use orchestrator::{
    VisitConfig, VisitDescriptor, VisitModality, VisitOrchestrator, VisitServices,
};
pub use state::{ConnectionStatus, SessionPhase, VisitState};
pub use stats::WindowStats;
