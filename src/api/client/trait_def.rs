//! Client trait definition
//!
//! This module defines the `Client` trait that abstracts over the backend
//! services so the session can be driven by the HTTP client or a test double.

use super::ClientError;
use crate::api::{CodeFeedback, ExecAction};
use crate::models::{Step, StepTree, StepVerdict};

/// Trait defining the backend interface used by the session
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    /// Create an account, returning the issued token
    async fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<String, ClientError>;

    /// Log in, returning the issued token
    async fn login(&self, username: &str, password: &str) -> Result<String, ClientError>;

    /// Load the saved step tree of a problem
    async fn load_step_tree(&self, problem_id: &str) -> Result<StepTree, ClientError>;

    /// Save the step tree of a problem
    async fn save_step_tree(&self, problem_id: &str, tree: &StepTree) -> Result<(), ClientError>;

    /// Ask the checker for a verdict on every step
    async fn check_steps(
        &self,
        problem: &str,
        tree: &StepTree,
    ) -> Result<Vec<StepVerdict>, ClientError>;

    /// Ask for general and detailed hints on every step
    async fn generate_hints(
        &self,
        problem: &str,
        tree: &StepTree,
    ) -> Result<Vec<StepVerdict>, ClientError>;

    /// Ask for an abstraction replacing the children of the step at `path`
    async fn request_abstraction(
        &self,
        tree: &StepTree,
        path: &[usize],
    ) -> Result<Vec<Step>, ClientError>;

    /// Turn the step tree into code
    async fn steps_to_code(&self, problem: &str, tree: &StepTree) -> Result<String, ClientError>;

    /// Review student code
    async fn check_code(&self, problem: &str, code: &str) -> Result<CodeFeedback, ClientError>;

    /// Run, compile or test code in the execution sandbox
    async fn execute(&self, code: &str, action: ExecAction) -> Result<String, ClientError>;
}
