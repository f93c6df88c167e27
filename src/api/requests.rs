//! Request and response bodies exchanged with the backend services

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{StepPath, StepTree};

/// Request to create an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignupRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Request to log in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Token issued by the auth service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Request to persist a problem's step tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveTreeRequest {
    pub id: String,
    #[serde(flatten)]
    pub tree: StepTree,
}

/// Tree plus problem statement, sent to the step checker and the hint generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepsRequest {
    pub problem: String,
    #[serde(flatten)]
    pub tree: StepTree,
}

/// Request to generalise the children of the step at `path`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbstractionRequest {
    pub path: StepPath,
    #[serde(flatten)]
    pub tree: StepTree,
}

/// Request to review student code against the problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeRequest {
    pub problem: String,
    pub code: String,
}

/// Code produced from a step tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
}

/// Reviewer feedback on student code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFeedback {
    pub correct: bool,
    #[serde(default)]
    pub feedback: String,
}

/// What the execution service should do with the submitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecAction {
    Run,
    Compile,
    Test,
}

impl FromStr for ExecAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run" => Ok(ExecAction::Run),
            "compile" => Ok(ExecAction::Compile),
            "test" => Ok(ExecAction::Test),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

impl fmt::Display for ExecAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecAction::Run => write!(f, "run"),
            ExecAction::Compile => write!(f, "compile"),
            ExecAction::Test => write!(f, "test"),
        }
    }
}

/// Request to the execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    pub action: ExecAction,
}

/// Output of the execution service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default)]
    pub output: String,
}
