//! Decomposition Box library crate
//!
//! This library provides the client-side core of the decomposition tool: the
//! step tree and its mutations, layout and drag targeting, local persistence,
//! and the client for the backend services.

pub mod api;
pub mod auth;
pub mod cli;
pub mod layout;
pub mod models;
pub mod session;
pub mod storage;
pub mod targeting;
pub mod tree;

// Re-export commonly used types
pub use models::{
    parse_path, path_label, Correctness, Divisibility, HintKind, Progress, Step, StepPath,
    StepStatus, StepTree, StepVerdict, TreeError,
};
pub use session::{Context, Core, SessionConfig, SessionError};
