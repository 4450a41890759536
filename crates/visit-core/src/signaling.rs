//! Wire payloads for the out-of-band signaling channel.
//!
//! These are the only formats the core serializes itself; media and session
//! negotiation belong to the transport provider.

use serde::{Deserialize, Serialize};

use crate::errors::VisitError;

/// Chat message payload (`instantMessage` signal).
///
/// `creationTimeEpochMs` is string-encoded on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstantMessagePayload {
    pub from_participant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    pub creation_time_epoch_ms: String,
    pub unique_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_staff: Option<bool>,
}

/// Typing indicator payload (`typingStateMessage` signal).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatePayload {
    pub display_name: String,
    /// 1 = typing, 0 = stopped.
    pub typing_state: u8,
}

/// Payload of an `error` signal from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSignalPayload {
    pub error_type: String,
}

/// Payload of a `statusChange` signal from the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChangePayload {
    pub status: String,
}

pub const ERROR_JOINED_ELSEWHERE: &str = "joinedElsewhere";
pub const STATUS_DECLINED: &str = "declined";

pub fn encode<T: Serialize>(payload: &T) -> Result<String, VisitError> {
    serde_json::to_string(payload).map_err(|e| VisitError::Signal(e.to_string()))
}

pub fn decode<'a, T: Deserialize<'a>>(payload: &'a str) -> Result<T, VisitError> {
    serde_json::from_str(payload).map_err(|e| VisitError::Signal(e.to_string()))
}
