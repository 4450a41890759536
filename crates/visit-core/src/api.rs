//! HTTP implementations of the collaborator traits.
//!
//! Thin clients over the visit backend's REST API. Route construction beyond
//! these few paths lives outside the core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chat::ChatMessage;
use crate::errors::VisitError;
use crate::services::{ChatPersistence, TokenService, WaitTimeEstimate, WaitTimeService};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitTimeResponse {
    message: Option<String>,
    localization_key: Option<String>,
    min_seconds: Option<u64>,
    max_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatPostBody<'a> {
    sender_id: &'a str,
    display_name: &'a str,
    message_id: &'a str,
    sent_at_ms: u64,
    text: &'a str,
    is_staff: bool,
}

/// Client for the visit backend.
#[derive(Clone)]
pub struct VisitApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl VisitApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    fn visit_url(&self, visit_id: &str, suffix: &str) -> String {
        let visit_id = urlencoding::encode(visit_id);
        format!("{}/visits/{}/{}", self.base_url, visit_id, suffix)
    }
}

#[async_trait]
impl TokenService for VisitApiClient {
    async fn fetch_token(&self, visit_id: &str, session_id: &str) -> Result<String, VisitError> {
        let session_id = urlencoding::encode(session_id);
        let url = self.visit_url(visit_id, &format!("sessions/{session_id}/token"));
        tracing::debug!("fetching session token: {url}");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VisitError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VisitError::Token(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| VisitError::Token(e.to_string()))?;
        Ok(body.token)
    }
}

#[async_trait]
impl WaitTimeService for VisitApiClient {
    async fn estimate(&self, visit_id: &str) -> Result<WaitTimeEstimate, VisitError> {
        let url = self.visit_url(visit_id, "wait-time");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| VisitError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VisitError::Http(format!(
                "wait-time endpoint returned {}",
                resp.status()
            )));
        }

        let body: WaitTimeResponse = resp
            .json()
            .await
            .map_err(|e| VisitError::Http(e.to_string()))?;
        Ok(WaitTimeEstimate {
            message: body.message.unwrap_or_default(),
            localization_key: body.localization_key,
            min_seconds: body.min_seconds,
            max_seconds: body.max_seconds,
        })
    }
}

#[async_trait]
impl ChatPersistence for VisitApiClient {
    async fn post(
        &self,
        visit_id: &str,
        session_id: &str,
        message: &ChatMessage,
    ) -> Result<(), VisitError> {
        let session_id = urlencoding::encode(session_id);
        let url = self.visit_url(visit_id, &format!("sessions/{session_id}/messages"));

        let body = ChatPostBody {
            sender_id: &message.sender_id,
            display_name: &message.display_name,
            message_id: &message.message_id,
            sent_at_ms: message.sent_at_ms,
            text: &message.text,
            is_staff: message.is_staff,
        };

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| VisitError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VisitError::Http(format!(
                "message log endpoint returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = VisitApiClient::new("https://api.example.com/");
        assert_eq!(
            client.visit_url("v1", "wait-time"),
            "https://api.example.com/visits/v1/wait-time"
        );
    }

    #[test]
    fn visit_id_is_url_encoded() {
        let client = VisitApiClient::new("https://api.example.com");
        assert_eq!(
            client.visit_url("v 1", "wait-time"),
            "https://api.example.com/visits/v%201/wait-time"
        );
    }

    #[test]
    fn wait_time_response_tolerates_missing_fields() {
        let body: WaitTimeResponse = serde_json::from_str("{}").unwrap();
        assert!(body.message.is_none());
        assert!(body.min_seconds.is_none());
    }

    #[test]
    fn wait_time_response_parses_range() {
        let body: WaitTimeResponse = serde_json::from_str(
            r#"{"message":"soon","localizationKey":"wait.range","minSeconds":60,"maxSeconds":300}"#,
        )
        .unwrap();
        assert_eq!(body.message.as_deref(), Some("soon"));
        assert_eq!(body.min_seconds, Some(60));
        assert_eq!(body.max_seconds, Some(300));
    }
}
