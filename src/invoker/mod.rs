//! Adapters to external collaborators. They own transport, retry and timeout
//! policy only; what a response means is up to the calling node.

pub mod http;
pub mod openai;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::{
    error::ExternalCallError,
    flow::model::{ApiAuth, HttpMethod},
};

pub use http::HttpActionInvoker;
pub use openai::OpenAiInvoker;

/// Fixed attempt count, doubling backoff, per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            timeout: Duration::from_millis(30_000),
        }
    }
}

/// How a single attempt failed.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    Transport(String),
    Status { status: u16, body: String },
    Invalid(String),
    /// The request could not be built; retrying cannot help.
    Request(String),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            timeout,
        }
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `call` until it succeeds or the policy gives up. Transport errors,
    /// timeouts and 5xx are retried; 4xx and unusable responses are not.
    /// Returns the value with the number of attempts used.
    pub async fn run<T, F, Fut>(&self, target: &str, mut call: F) -> Result<(T, u32), ExternalCallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let attempts = self.max_attempts.max(1);
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut last = None;

        for attempt in 1..=attempts {
            let err = match timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok((value, attempt)),
                Ok(Err(CallFailure::Status { status, body })) if status < 500 => {
                    return Err(ExternalCallError::Status {
                        target: target.to_string(),
                        status,
                        body,
                        attempts: attempt,
                    });
                }
                Ok(Err(CallFailure::Invalid(reason))) => {
                    return Err(ExternalCallError::InvalidResponse {
                        target: target.to_string(),
                        reason,
                    });
                }
                Ok(Err(CallFailure::Request(reason))) => {
                    return Err(ExternalCallError::InvalidRequest {
                        target: target.to_string(),
                        reason,
                    });
                }
                Ok(Err(CallFailure::Status { status, body })) => ExternalCallError::Status {
                    target: target.to_string(),
                    status,
                    body,
                    attempts: attempt,
                },
                Ok(Err(CallFailure::Transport(reason))) => ExternalCallError::Transport {
                    target: target.to_string(),
                    reason,
                    attempts: attempt,
                },
                Err(_) => ExternalCallError::Timeout {
                    target: target.to_string(),
                    timeout_ms,
                    attempts: attempt,
                },
            };
            warn!("attempt {}/{} failed: {}", attempt, attempts, err);
            last = Some(err);
            if attempt < attempts {
                sleep(self.delay_for(attempt)).await;
            }
        }

        Err(last.unwrap_or_else(|| ExternalCallError::Transport {
            target: target.to_string(),
            reason: "no attempt was made".into(),
            attempts: 0,
        }))
    }
}

/// A fully rendered REST call.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub method: HttpMethod,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: Option<ApiAuth>,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionResponse {
    pub status: u16,
    pub body: Value,
    pub attempts: u32,
}

#[async_trait]
pub trait ActionInvoker: Send + Sync {
    async fn invoke(&self, call: ActionCall) -> Result<ActionResponse, ExternalCallError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LlmRequest {
    /// Falls back to the invoker's default model.
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the service for a bare JSON object.
    pub json_mode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub attempts: u32,
}

#[async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, ExternalCallError>;
}

/// Stands in when no language-model credentials are configured.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredLlm;

#[async_trait]
impl LlmInvoker for UnconfiguredLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, ExternalCallError> {
        Err(ExternalCallError::NotConfigured("OPENAI_KEY is not set".into()))
    }
}

/// The collaborators available to node executors.
#[derive(Clone)]
pub struct Invokers {
    pub action: Arc<dyn ActionInvoker>,
    pub llm: Arc<dyn LlmInvoker>,
}

impl Invokers {
    pub fn new(action: Arc<dyn ActionInvoker>, llm: Arc<dyn LlmInvoker>) -> Self {
        Self { action, llm }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(50))
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let result = quick(3)
            .run("GET /x", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CallFailure::Status {
                        status: 503,
                        body: "busy".into(),
                    })
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(result, ("done", 3));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let err = quick(3)
            .run("GET /x", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CallFailure::Status {
                    status: 404,
                    body: "nope".into(),
                })
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ExternalCallError::Status { status: 404, attempts: 1, .. }));
    }

    #[tokio::test]
    async fn timeouts_exhaust_attempts() {
        let err = quick(2)
            .run("GET /slow", || async {
                sleep(Duration::from_millis(500)).await;
                Ok::<_, CallFailure>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalCallError::Timeout { attempts: 2, timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn unconfigured_llm_fails() {
        let err = UnconfiguredLlm.complete(LlmRequest::default()).await.unwrap_err();
        assert!(matches!(err, ExternalCallError::NotConfigured(_)));
    }
}
