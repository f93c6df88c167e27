//! Decoding of AI endpoint responses
//!
//! The AI proxy answers with a chat-completion style envelope whose
//! `choices[0].message.content` holds the model output as a JSON string.
//! Some endpoints instead return the payload directly under `data`, either as
//! a JSON value or again as a string. Model output is untrusted: anything that
//! does not decode becomes `ClientError::MalformedAiResponse`.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::ClientError;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Strips a Markdown code fence that models like to wrap JSON in
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn decode_model_text<T: DeserializeOwned>(text: &str) -> Result<T, ClientError> {
    serde_json::from_str(strip_fence(text))
        .map_err(|e| ClientError::MalformedAiResponse(format!("model output is not valid JSON: {}", e)))
}

/// Extracts and decodes the model payload from a raw response body
pub fn decode_ai_payload<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    let envelope: Envelope = serde_json::from_str(body)
        .map_err(|e| ClientError::MalformedAiResponse(format!("unreadable envelope: {}", e)))?;

    if let Some(choice) = envelope.choices.into_iter().next() {
        return match choice.message.content {
            Some(content) => decode_model_text(&content),
            None => Err(ClientError::MalformedAiResponse(
                "first choice has no content".to_string(),
            )),
        };
    }

    match envelope.data {
        Some(Value::String(text)) => decode_model_text(&text),
        Some(value) => serde_json::from_value(value)
            .map_err(|e| ClientError::MalformedAiResponse(format!("unexpected data shape: {}", e))),
        None => Err(ClientError::MalformedAiResponse(
            "response has neither choices nor data".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GeneratedCode;
    use crate::models::StepTree;
    use serde_json::json;

    #[test]
    fn test_choices_content() {
        let body = json!({
            "choices": [ { "message": { "content": "{\"code\": \"print(1)\"}" } } ]
        })
        .to_string();
        let decoded: GeneratedCode = decode_ai_payload(&body).unwrap();
        assert_eq!(decoded.code, "print(1)");
    }

    #[test]
    fn test_fenced_content() {
        let body = json!({
            "choices": [ { "message": { "content": "```json\n{\"root\": [{\"id\": \"a\"}]}\n```" } } ]
        })
        .to_string();
        let decoded: StepTree = decode_ai_payload(&body).unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn test_direct_data_value_and_string() {
        let body = json!({ "data": { "code": "x = 1" } }).to_string();
        let decoded: GeneratedCode = decode_ai_payload(&body).unwrap();
        assert_eq!(decoded.code, "x = 1");

        let body = json!({ "data": "{\"code\": \"y = 2\"}" }).to_string();
        let decoded: GeneratedCode = decode_ai_payload(&body).unwrap();
        assert_eq!(decoded.code, "y = 2");
    }

    #[test]
    fn test_malformed_model_output() {
        let body = json!({
            "choices": [ { "message": { "content": "Sure! Here are your steps:" } } ]
        })
        .to_string();
        let result: Result<GeneratedCode, _> = decode_ai_payload(&body);
        assert!(matches!(result, Err(ClientError::MalformedAiResponse(_))));

        let result: Result<GeneratedCode, _> = decode_ai_payload("{}");
        assert!(matches!(result, Err(ClientError::MalformedAiResponse(_))));

        let result: Result<GeneratedCode, _> = decode_ai_payload("<html>");
        assert!(matches!(result, Err(ClientError::MalformedAiResponse(_))));
    }
}
