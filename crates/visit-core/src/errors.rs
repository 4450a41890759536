use thiserror::Error;

#[derive(Debug, Error)]
pub enum VisitError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("token fetch failed: {0}")]
    Token(String),
    #[error("http request failed: {0}")]
    Http(String),
    #[error("malformed signal payload: {0}")]
    Signal(String),
    #[error("media permissions denied")]
    PermissionDenied,
}
