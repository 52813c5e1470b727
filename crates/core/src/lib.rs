pub mod config;
pub mod models;

use http::StatusCode;
use thiserror::Error;

/// Errors raised by the GitHub API gateway.
///
/// Unauthorized is surfaced as its own variant so callers can stop
/// polling against a rejected credential and prompt for sign-in.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("credential missing, expired, or rejected")]
    Unauthorized,
    #[error("unexpected HTTP status {0}")]
    Http(StatusCode),
    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn is_unauthorized(&self) -> bool { matches!(self, Self::Unauthorized) }
}
