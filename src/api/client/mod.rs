//! Client module
//!
//! This module provides HTTP client functionality to reach the auth service,
//! tree persistence, the AI endpoints and the code execution service.

mod http;
mod trait_def;

// Re-export the trait and types
pub use http::{AiEndpoint, ClientConfig, HttpClient};
pub use trait_def::Client;

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unauthorized: the session token was rejected")]
    Unauthorized,

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Malformed AI response: {0}")]
    MalformedAiResponse(String),
}

impl ClientError {
    /// True when the error means the stored credentials must be discarded
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Unauthorized)
    }
}
