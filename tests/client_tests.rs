use std::collections::HashMap;

use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use decompbox::api::{Client, ClientConfig, ClientError, ExecAction, HttpClient};
use decompbox::models::{Correctness, Step, StepTree};

const TOKEN: &str = "secret-token";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == format!("Bearer {}", TOKEN))
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["username"] == "ada" && body["password"] == "hunter2" {
        (StatusCode::OK, Json(json!({ "token": TOKEN })))
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad credentials" })))
    }
}

async fn load_tree(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    match params.get("id").map(String::as_str) {
        Some("two-sum") => Ok(Json(json!({
            "root": [
                {
                    "id": "s1",
                    "content": "Read the list",
                    "status": { "correctness": "correct", "can_be_further_divided": "cannot" },
                    "children": [ { "id": "s1a", "content": "Split on commas" } ]
                },
                { "id": "s2", "content": "Find the pair" }
            ]
        }))),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn check_steps(Json(body): Json<Value>) -> Json<Value> {
    // mark every top-level step incorrect and echo it back as model output
    let mut root = body["root"].clone();
    if let Some(steps) = root.as_array_mut() {
        for step in steps {
            step["status"] = json!({ "correctness": "incorrect", "can_be_further_divided": "can" });
            step["correctStep"] = json!("Use a hash map");
        }
    }
    let content = json!({ "root": root }).to_string();
    Json(json!({ "choices": [ { "message": { "content": content } } ] }))
}

async fn steps_to_code() -> Json<Value> {
    Json(json!({ "choices": [ { "message": { "content": "I cannot help with that." } } ] }))
}

async fn save_tree() -> StatusCode {
    StatusCode::UNAUTHORIZED
}

async fn execute(Json(body): Json<Value>) -> Json<Value> {
    let output = format!(
        "{} -> {}",
        body["action"].as_str().unwrap_or("?"),
        body["code"].as_str().unwrap_or("")
    );
    Json(json!({ "output": output }))
}

async fn spawn_backend() -> String {
    let app = Router::new()
        .route("/login", post(login))
        .route("/problem/v2/loadStepTree", get(load_tree))
        .route("/problem/v2/saveStepTree", post(save_tree))
        .route("/openai/checkSteps", post(check_steps))
        .route("/openai/stepsToCode", post(steps_to_code))
        .route("/execute/", post(execute));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn client(base_url: String) -> HttpClient {
    HttpClient::with_config(ClientConfig {
        base_url,
        ..ClientConfig::default()
    })
}

#[tokio::test]
async fn test_login_returns_token() {
    let client = client(spawn_backend().await);

    let token = client.login("ada", "hunter2").await.unwrap();
    assert_eq!(token, TOKEN);

    let rejected = client.login("ada", "wrong").await;
    assert!(matches!(rejected, Err(ClientError::Unauthorized)));
}

#[tokio::test]
async fn test_load_step_tree_sends_id_and_token() {
    let base = spawn_backend().await;

    let anonymous = client(base.clone()).load_step_tree("two-sum").await;
    assert!(matches!(anonymous, Err(ClientError::Unauthorized)));

    let client = client(base).with_token(TOKEN);
    let tree = client.load_step_tree("two-sum").await.unwrap();
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.get(&[0, 0]).unwrap().content(), "Split on commas");
    assert_eq!(
        tree.get(&[0]).unwrap().status().correctness,
        Correctness::Correct
    );

    let missing = client.load_step_tree("nope").await;
    assert!(matches!(
        missing,
        Err(ClientError::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_check_steps_decodes_envelope() {
    let client = client(spawn_backend().await).with_token(TOKEN);
    let tree = StepTree::from_steps(vec![
        Step::new("s1", "Loop over every pair"),
        Step::new("s2", "Return the indices"),
    ]);

    let verdicts = client.check_steps("Two sum", &tree).await.unwrap();
    assert_eq!(verdicts.len(), 2);
    assert_eq!(verdicts[0].id, "s1");
    assert_eq!(verdicts[0].status.correctness, Correctness::Incorrect);
    assert_eq!(verdicts[0].correct_step.as_deref(), Some("Use a hash map"));
}

#[tokio::test]
async fn test_malformed_model_output_is_reported() {
    let client = client(spawn_backend().await).with_token(TOKEN);
    let tree = StepTree::from_steps(vec![Step::new("s1", "Loop")]);

    let result = client.steps_to_code("Two sum", &tree).await;
    assert!(matches!(result, Err(ClientError::MalformedAiResponse(_))));
}

#[tokio::test]
async fn test_rejected_token_is_unauthorized() {
    let client = client(spawn_backend().await).with_token("stale");
    let result = client.save_step_tree("two-sum", &StepTree::new()).await;

    let error = result.unwrap_err();
    assert!(error.is_unauthorized());
}

#[tokio::test]
async fn test_execute_posts_action() {
    let client = client(spawn_backend().await).with_token(TOKEN);
    let output = client.execute("print(42)", ExecAction::Compile).await.unwrap();
    assert_eq!(output, "compile -> print(42)");
}

#[tokio::test]
async fn test_unreachable_backend_is_http_error() {
    // nothing listens on port 9 of localhost
    let client = client("http://127.0.0.1:9".to_string());
    let result = client.login("ada", "hunter2").await;
    assert!(matches!(result, Err(ClientError::Http(_))));
}
