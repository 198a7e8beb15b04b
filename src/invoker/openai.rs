use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{error, info};

use crate::{
    error::ExternalCallError,
    invoker::{CallFailure, LlmInvoker, LlmRequest, LlmResponse, RetryPolicy, TokenUsage},
};

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiInvoker {
    client: Client,
    base_url: String,
    api_key: String,
    default_model: String,
    policy: RetryPolicy,
}

impl OpenAiInvoker {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            policy,
        }
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<Value, CallFailure> {
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| CallFailure::Transport(format!("OpenAI request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_else(|_| "<no body>".into());
            return Err(CallFailure::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        resp.json()
            .await
            .map_err(|e| CallFailure::Invalid(format!("Invalid OpenAI response: {e}")))
    }
}

#[async_trait]
impl LlmInvoker for OpenAiInvoker {
    #[tracing::instrument(name = "llm_complete", skip(self, request))]
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ExternalCallError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut body = json!({
            "model": model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let target = format!("POST {}", url);
        let (json, attempts) = match self.policy.run(&target, || self.send_once(&url, &body)).await {
            Ok(ok) => ok,
            Err(e) => {
                error!("OpenAI error: {}", e);
                return Err(e);
            }
        };

        let content = json
            .pointer("/choices/0/message/content")
            .cloned()
            .ok_or_else(|| ExternalCallError::InvalidResponse {
                target: target.clone(),
                reason: "OpenAI response missing message content".into(),
            })?;
        let text = match content {
            Value::String(s) => s,
            Value::Array(parts) => choice_array_to_string(parts),
            Value::Null => {
                return Err(ExternalCallError::InvalidResponse {
                    target,
                    reason: "OpenAI response has empty content".into(),
                });
            }
            other => other.to_string(),
        };
        let usage: TokenUsage = json
            .get("usage")
            .cloned()
            .and_then(|u| serde_json::from_value(u).ok())
            .unwrap_or_default();

        info!(
            model = %model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            attempts,
            "llm call completed"
        );
        Ok(LlmResponse {
            text,
            usage,
            attempts,
        })
    }
}

fn choice_array_to_string(parts: Vec<Value>) -> String {
    parts
        .into_iter()
        .filter_map(|p| match p {
            Value::Object(mut obj) => obj.remove("text"),
            Value::String(s) => Some(Value::String(s)),
            _ => None,
        })
        .filter_map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Vec<_>>()
        .join("\n")
}
