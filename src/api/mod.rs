//! API module
//!
//! This module provides access to the external collaborators: the auth
//! service, tree persistence, the AI proxy endpoints and code execution.

pub mod client;
pub mod envelope;
pub mod requests;

// Re-export commonly used types
pub use client::{AiEndpoint, Client, ClientConfig, ClientError, HttpClient};
pub use envelope::decode_ai_payload;
pub use requests::*;
