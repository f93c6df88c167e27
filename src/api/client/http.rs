//! HTTP client implementation
//!
//! This module provides the reqwest-backed implementation of the `Client` trait.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client as ReqwestClient, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Client, ClientError};
use crate::api::envelope::decode_ai_payload;
use crate::api::{
    AbstractionRequest, CodeFeedback, CodeRequest, ExecAction, ExecuteRequest, ExecuteResponse,
    GeneratedCode, LoginRequest, SaveTreeRequest, SignupRequest, StepsRequest, TokenResponse,
};
use crate::models::{Step, StepTree, StepVerdict};

const SIGNUP_PATH: &str = "/signup";
const LOGIN_PATH: &str = "/login";
const LOAD_TREE_PATH: &str = "/problem/v2/loadStepTree";
const SAVE_TREE_PATH: &str = "/problem/v2/saveStepTree";
const EXECUTE_PATH: &str = "/execute/";

/// The five AI proxy endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AiEndpoint {
    CheckSteps,
    GenerateHints,
    Abstraction,
    StepsToCode,
    CheckCode,
}

impl AiEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            AiEndpoint::CheckSteps => "/openai/checkSteps",
            AiEndpoint::GenerateHints => "/openai/generateHints",
            AiEndpoint::Abstraction => "/openai/abstraction",
            AiEndpoint::StepsToCode => "/openai/stepsToCode",
            AiEndpoint::CheckCode => "/openai/checkCode",
        }
    }
}

/// API client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Client for the backend services
#[derive(Debug, Clone)]
pub struct HttpClient {
    http_client: Arc<ReqwestClient>,
    config: ClientConfig,
    token: Option<String>,
}

impl HttpClient {
    /// Create a new client with default configuration
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(config: ClientConfig) -> Self {
        let http_client = ReqwestClient::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                ReqwestClient::new()
            });

        Self {
            http_client: Arc::new(http_client),
            config,
            token: None,
        }
    }

    /// Attach a bearer token to every subsequent request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Sends a request and returns the body of a successful response
    async fn send(&self, request: RequestBuilder) -> Result<String, ClientError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("Backend rejected the session token");
            return Err(ClientError::Unauthorized);
        }
        if !status.is_success() {
            tracing::debug!("Request failed with status {}: {}", status, body);
            return Err(ClientError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(body)
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> Result<String, ClientError>
    where
        B: Serialize + Sync + ?Sized,
    {
        let request = self.http_client.post(self.url(path)).json(body);
        self.send(request).await
    }

    async fn post_ai<B, T>(&self, endpoint: AiEndpoint, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        tracing::debug!("Calling AI endpoint {}", endpoint.path());
        let raw = self.post_json(endpoint.path(), body).await?;
        decode_ai_payload(&raw)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Client for HttpClient {
    async fn signup(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<String, ClientError> {
        let request = SignupRequest {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
        };
        let raw = self.post_json(SIGNUP_PATH, &request).await?;
        let response: TokenResponse = serde_json::from_str(&raw)?;
        Ok(response.token)
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, ClientError> {
        let request = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let raw = self.post_json(LOGIN_PATH, &request).await?;
        let response: TokenResponse = serde_json::from_str(&raw)?;
        Ok(response.token)
    }

    async fn load_step_tree(&self, problem_id: &str) -> Result<StepTree, ClientError> {
        let request = self
            .http_client
            .get(self.url(LOAD_TREE_PATH))
            .query(&[("id", problem_id)]);
        let raw = self.send(request).await?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn save_step_tree(&self, problem_id: &str, tree: &StepTree) -> Result<(), ClientError> {
        let request = SaveTreeRequest {
            id: problem_id.to_string(),
            tree: tree.clone(),
        };
        self.post_json(SAVE_TREE_PATH, &request).await?;
        Ok(())
    }

    async fn check_steps(
        &self,
        problem: &str,
        tree: &StepTree,
    ) -> Result<Vec<StepVerdict>, ClientError> {
        let request = StepsRequest {
            problem: problem.to_string(),
            tree: tree.clone(),
        };
        let annotated: StepTree = self.post_ai(AiEndpoint::CheckSteps, &request).await?;
        Ok(StepVerdict::collect(&annotated))
    }

    async fn generate_hints(
        &self,
        problem: &str,
        tree: &StepTree,
    ) -> Result<Vec<StepVerdict>, ClientError> {
        let request = StepsRequest {
            problem: problem.to_string(),
            tree: tree.clone(),
        };
        let annotated: StepTree = self.post_ai(AiEndpoint::GenerateHints, &request).await?;
        Ok(StepVerdict::collect(&annotated))
    }

    async fn request_abstraction(
        &self,
        tree: &StepTree,
        path: &[usize],
    ) -> Result<Vec<Step>, ClientError> {
        let request = AbstractionRequest {
            path: path.to_vec(),
            tree: tree.clone(),
        };
        let replacement: StepTree = self.post_ai(AiEndpoint::Abstraction, &request).await?;
        Ok(replacement.into_steps())
    }

    async fn steps_to_code(&self, problem: &str, tree: &StepTree) -> Result<String, ClientError> {
        let request = StepsRequest {
            problem: problem.to_string(),
            tree: tree.clone(),
        };
        let generated: GeneratedCode = self.post_ai(AiEndpoint::StepsToCode, &request).await?;
        Ok(generated.code)
    }

    async fn check_code(&self, problem: &str, code: &str) -> Result<CodeFeedback, ClientError> {
        let request = CodeRequest {
            problem: problem.to_string(),
            code: code.to_string(),
        };
        self.post_ai(AiEndpoint::CheckCode, &request).await
    }

    async fn execute(&self, code: &str, action: ExecAction) -> Result<String, ClientError> {
        let request = ExecuteRequest {
            code: code.to_string(),
            action,
        };
        let raw = self.post_json(EXECUTE_PATH, &request).await?;
        let response: ExecuteResponse = serde_json::from_str(&raw)?;
        Ok(response.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = HttpClient::with_config(ClientConfig {
            base_url: "http://example.test/".to_string(),
            ..ClientConfig::default()
        });
        assert_eq!(client.url(LOGIN_PATH), "http://example.test/login");
        assert_eq!(
            client.url(AiEndpoint::CheckCode.path()),
            "http://example.test/openai/checkCode"
        );
    }

    #[test]
    fn test_request_bodies_are_flat() {
        let request = StepsRequest {
            problem: "Sum a list".to_string(),
            tree: StepTree::from_steps(vec![Step::new("a", "loop")]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["problem"], "Sum a list");
        assert_eq!(value["root"][0]["id"], "a");

        let request = ExecuteRequest {
            code: "print(1)".to_string(),
            action: ExecAction::Test,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["action"], "test");
    }
}
