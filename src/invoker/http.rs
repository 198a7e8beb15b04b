use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use tracing::{debug, error};

use crate::{
    error::ExternalCallError,
    flow::model::{ApiAuth, HttpMethod, KeyLocation},
    invoker::{ActionCall, ActionInvoker, ActionResponse, CallFailure},
};

/// REST back-end calls over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpActionInvoker {
    client: Client,
}

impl HttpActionInvoker {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn send_once(&self, call: &ActionCall) -> Result<(u16, Value), CallFailure> {
        let method = match call.method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        };
        let mut req = self.client.request(method, &call.url).query(&call.query);
        for (name, value) in &call.headers {
            req = req.header(name, value);
        }
        req = match &call.auth {
            None => req,
            Some(ApiAuth::Bearer { token, header: None }) => req.bearer_auth(token),
            Some(ApiAuth::Bearer {
                token,
                header: Some(name),
            }) => req.header(name, format!("Bearer {}", token)),
            Some(ApiAuth::ApiKey {
                key,
                name,
                location: KeyLocation::Header,
            }) => req.header(name, key),
            Some(ApiAuth::ApiKey {
                key,
                name,
                location: KeyLocation::Query,
            }) => req.query(&[(name, key)]),
            Some(ApiAuth::Basic { username, password }) => req.basic_auth(username, Some(password)),
        };
        if call.method != HttpMethod::Get {
            if let Some(body) = &call.body {
                req = req.json(body);
            }
        }

        let resp = req.send().await.map_err(send_failure)?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| CallFailure::Transport(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(CallFailure::Status { status, body: text });
        }
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok((status, body))
    }
}

fn send_failure(e: reqwest::Error) -> CallFailure {
    if e.is_builder() {
        CallFailure::Request(e.to_string())
    } else {
        CallFailure::Transport(e.to_string())
    }
}

#[async_trait]
impl ActionInvoker for HttpActionInvoker {
    #[tracing::instrument(name = "action_invoke", skip(self, call), fields(method = %call.method, url = %call.url))]
    async fn invoke(&self, call: ActionCall) -> Result<ActionResponse, ExternalCallError> {
        let target = format!("{} {}", call.method, call.url);
        match call.policy.run(&target, || self.send_once(&call)).await {
            Ok(((status, body), attempts)) => {
                debug!("{} -> {} after {} attempts", target, status, attempts);
                Ok(ActionResponse {
                    status,
                    body,
                    attempts,
                })
            }
            Err(e) => {
                error!("action call failed: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::RetryPolicy;
    use serde_json::json;
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    async fn read_request(sock: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(pos) = text.find("\r\n\r\n") {
                let len = text[..pos]
                    .lines()
                    .find_map(|l| {
                        l.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Answers one connection per scripted response and records the raw requests.
    async fn serve(responses: Vec<(u16, &'static str)>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut sock, _) = listener.accept().await.unwrap();
                let req = read_request(&mut sock).await;
                log.lock().unwrap().push(req);
                let resp = format!(
                    "HTTP/1.1 {} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
                let _ = sock.shutdown().await;
            }
        });
        (format!("http://{}", addr), seen)
    }

    fn call(url: String, method: HttpMethod, attempts: u32) -> ActionCall {
        ActionCall {
            method,
            url,
            query: vec![("q".into(), "dune".into())],
            headers: vec![("x-tenant".into(), "acme".into())],
            body: Some(json!({"titulo": "Dune"})),
            auth: Some(ApiAuth::Bearer {
                token: "secret".into(),
                header: None,
            }),
            policy: RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(500)),
        }
    }

    #[tokio::test]
    async fn get_sends_query_headers_and_auth_without_body() {
        let (base, seen) = serve(vec![(200, r#"{"items":[{"id":1}]}"#)]).await;
        let resp = HttpActionInvoker::new()
            .invoke(call(format!("{}/books", base), HttpMethod::Get, 1))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body["items"][0]["id"], 1);

        let raw = seen.lock().unwrap()[0].to_lowercase();
        assert!(raw.starts_with("get /books?q=dune "));
        assert!(raw.contains("authorization: bearer secret"));
        assert!(raw.contains("x-tenant: acme"));
        assert!(!raw.contains("titulo"));
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let (base, seen) = serve(vec![(201, r#"{"ok":true}"#)]).await;
        let resp = HttpActionInvoker::new()
            .invoke(call(format!("{}/orders", base), HttpMethod::Post, 1))
            .await
            .unwrap();
        assert_eq!(resp.body, json!({"ok": true}));
        let raw = seen.lock().unwrap()[0].to_lowercase();
        assert!(raw.contains("content-type: application/json"));
        assert!(raw.contains(r#"{"titulo":"dune"}"#));
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let (base, seen) = serve(vec![(500, "{}"), (200, r#"{"ok":1}"#)]).await;
        let resp = HttpActionInvoker::new()
            .invoke(call(format!("{}/x", base), HttpMethod::Get, 3))
            .await
            .unwrap();
        assert_eq!(resp.attempts, 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn client_error_is_final() {
        let (base, _) = serve(vec![(404, r#"{"error":"missing"}"#)]).await;
        let err = HttpActionInvoker::new()
            .invoke(call(format!("{}/x", base), HttpMethod::Get, 3))
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalCallError::Status { status: 404, attempts: 1, .. }));
    }

    #[tokio::test]
    async fn api_key_in_query() {
        let (base, seen) = serve(vec![(200, "")]).await;
        let mut c = call(format!("{}/x", base), HttpMethod::Get, 1);
        c.auth = Some(ApiAuth::ApiKey {
            key: "k1".into(),
            name: "api_key".into(),
            location: KeyLocation::Query,
        });
        let resp = HttpActionInvoker::new().invoke(c).await.unwrap();
        assert_eq!(resp.body, Value::Null);
        assert!(seen.lock().unwrap()[0].contains("api_key=k1"));
    }

    #[tokio::test]
    async fn malformed_header_fails_without_retry() {
        let (base, seen) = serve(vec![(200, "{}")]).await;
        let mut c = call(format!("{}/x", base), HttpMethod::Get, 3);
        c.headers.push(("bad header".into(), "x".into()));
        let err = HttpActionInvoker::new().invoke(c).await.unwrap_err();
        assert!(matches!(err, ExternalCallError::InvalidRequest { .. }), "{err:?}");
        assert_eq!(err.attempts(), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // accepted by the OS backlog, never answered
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/slow", listener.local_addr().unwrap());
        let mut c = call(url, HttpMethod::Get, 2);
        c.policy.timeout = Duration::from_millis(50);
        let err = HttpActionInvoker::new().invoke(c).await.unwrap_err();
        assert!(matches!(err, ExternalCallError::Timeout { attempts: 2, .. }));
        drop(listener);
    }
}
