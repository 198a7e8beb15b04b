use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::{
    error::{ConfigurationError, ExternalCallError, NodeError},
    flow::model::{ActionConfig, ApiAuth, ApiConfig, ExtractSpec, KindTag, NodeConfig, NodeKind},
    invoker::{ActionCall, RetryPolicy},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch},
    template::{self, lookup, resolve_expr, value_to_string},
};

static TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());
static PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r":([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Call a declared REST back-end and map the response into variables.
pub struct ActionExecutor;

#[async_trait]
impl NodeExecutor for ActionExecutor {
    #[tracing::instrument(name = "action_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Action(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Action));
        };
        let api = ctx
            .flow
            .api(&cfg.api)
            .ok_or_else(|| ConfigurationError::UnknownApi {
                node: node.id.clone(),
                api: cfg.api.clone(),
            })?;

        let call = build_call(cfg, api, ctx);
        let target = format!("{} {}", call.method, call.url);

        match ctx.invokers.action.invoke(call).await {
            Ok(resp) => {
                info!("✅ `{}` {} -> {}", node.id, target, resp.status);
                let mut outcome = match &cfg.on_success {
                    Some(next) => NodeOutcome::goto(next.clone()),
                    None => NodeOutcome::follow(),
                };
                outcome = outcome.set("status", json!(resp.status), false);
                if let Some(output) = &cfg.output {
                    outcome = outcome.set(output.clone(), resp.body.clone(), cfg.global);
                }
                if let Some(spec) = &cfg.extract {
                    for (key, value) in extract(spec, &resp.body) {
                        outcome = outcome.set(key, value, cfg.global);
                    }
                }

                // the success template may show what was just extracted
                let mut scope = ctx.scope.clone();
                if let Value::Object(root) = &mut scope {
                    for (k, v) in &outcome.outputs {
                        root.insert(k.clone(), v.clone());
                    }
                }
                let message = ctx.prompt(node, &scope);
                Ok(outcome.say(message))
            }
            Err(err) => {
                warn!("🛑 `{}` {} failed: {}", node.id, target, err);
                let Some(on_error) = &cfg.on_error else {
                    return Err(err.into());
                };
                let mut outcome = NodeOutcome::goto(on_error.clone()).set("error", json!(err.to_string()), false);
                if let ExternalCallError::Status { status, .. } = &err {
                    outcome = outcome.set("status", json!(status), false);
                }
                Ok(outcome)
            }
        }
    }
}

fn build_call(cfg: &ActionConfig, api: &ApiConfig, ctx: &NodeContext<'_>) -> ActionCall {
    let scope = &ctx.scope;
    let path = expand_path(&cfg.path, &cfg.params, scope);
    let url = if path.is_empty() {
        api.base_url.clone()
    } else {
        format!(
            "{}/{}",
            api.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    };

    let query = cfg
        .query
        .iter()
        .map(|(k, v)| (k.clone(), ctx.render(v)))
        .filter(|(_, v)| !v.is_empty())
        .collect();
    let headers = api
        .headers
        .iter()
        .chain(cfg.headers.iter())
        .map(|(k, v)| (k.clone(), ctx.render(v)))
        .collect();
    let body = cfg
        .body
        .as_ref()
        .map(|b| template::resolver().render_value(b, scope));
    let auth = api.auth.as_ref().map(|auth| match auth {
        ApiAuth::Bearer { token, header } => ApiAuth::Bearer {
            token: ctx.render(token),
            header: header.clone(),
        },
        ApiAuth::ApiKey {
            key,
            name,
            location,
        } => ApiAuth::ApiKey {
            key: ctx.render(key),
            name: name.clone(),
            location: *location,
        },
        ApiAuth::Basic { username, password } => ApiAuth::Basic {
            username: ctx.render(username),
            password: ctx.render(password),
        },
    });

    let defaults = ctx.settings.http_policy();
    let timeout = cfg
        .timeout_ms
        .or(api.timeout_ms)
        .map(std::time::Duration::from_millis)
        .unwrap_or(defaults.timeout);
    let attempts = api.max_attempts.unwrap_or(defaults.max_attempts);

    ActionCall {
        method: cfg.method,
        url,
        query,
        headers,
        body,
        auth,
        policy: RetryPolicy::new(attempts, defaults.base_delay, timeout),
    }
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Fill `{{expr}}` tokens, `:name` and `{name}` segments with URL-encoded
/// values. A segment with no param and nothing in scope is left as written.
pub fn expand_path(path: &str, params: &BTreeMap<String, String>, scope: &Value) -> String {
    let with_tokens = TOKEN.replace_all(path, |caps: &Captures| {
        resolve_expr(&caps[1], scope)
            .map(|v| encode(&value_to_string(&v)))
            .unwrap_or_default()
    });
    PARAM
        .replace_all(&with_tokens, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = match params.get(name) {
                Some(tpl) => Some(template::render(tpl, scope)),
                None => resolve_expr(name, scope).map(|v| value_to_string(&v)),
            };
            match value {
                Some(v) => encode(&v),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Apply an extraction spec to a response body.
pub fn extract(spec: &ExtractSpec, body: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    let project = |item: &Value| -> Value {
        if spec.fields.is_empty() {
            return item.clone();
        }
        Value::Object(
            spec.fields
                .iter()
                .map(|(name, source)| {
                    (name.clone(), lookup(item, source).cloned().unwrap_or(Value::Null))
                })
                .collect(),
        )
    };

    match spec.array_path.as_deref() {
        Some(path) => {
            let items = match path.trim() {
                "" | "." | "$" => Some(body),
                p => lookup(body, p),
            };
            let list: Vec<Value> = match items {
                Some(Value::Array(items)) => items.iter().map(project).collect(),
                _ => Vec::new(),
            };
            let into = spec.into.clone().unwrap_or_else(|| "items".to_string());
            out.insert(format!("{}_count", into), json!(list.len()));
            out.insert(into, Value::Array(list));
        }
        None => {
            if let Value::Object(fields) = project(body) {
                out.extend(fields);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{
            model::{Flow, HttpMethod},
            session::VarScope,
        },
        invoker::ActionResponse,
        node::{
            Next,
            testing::{ScriptedAction, ScriptedLlm, invokers, run, session_for},
        },
    };
    use std::time::Duration;

    fn api() -> ApiConfig {
        serde_json::from_value(json!({
            "id": "catalog",
            "base_url": "https://books.example.com/api/",
            "headers": { "x-tenant": "{{tenant}}" },
            "auth": { "type": "bearer", "token": "{{flow.token}}" },
            "timeout_ms": 5000,
            "max_attempts": 2
        }))
        .unwrap()
    }

    fn action(config: Value) -> Flow {
        let cfg: ActionConfig = serde_json::from_value(config).unwrap();
        Flow::new("acme", "books", "Books", "buscar")
            .with_api(api())
            .with_variable("token", json!("t0k"))
            .add_node(
                NodeConfig::new("buscar", NodeKind::Action(cfg))
                    .with_template("Encontré {{libros_count}}: {{#each libros}}[{{nombre}}]{{/each}}"),
            )
            .build()
    }

    #[test]
    fn path_expansion() {
        let scope = json!({"titulo": "El Quijote", "id": 7});
        let mut params = BTreeMap::new();
        params.insert("q".to_string(), "{{titulo}}".to_string());
        assert_eq!(expand_path("/search/:q", &params, &scope), "/search/El%20Quijote");
        assert_eq!(expand_path("/books/{id}/reviews", &params, &scope), "/books/7/reviews");
        assert_eq!(expand_path("/x/{{titulo}}", &params, &scope), "/x/El%20Quijote");
        assert_eq!(expand_path("/items:batch", &params, &scope), "/items:batch");
    }

    #[test]
    fn extraction_projects_arrays() {
        let body = json!({"data": {"results": [
            {"title": "Dune", "price": {"amount": 10}},
            {"title": "Emma", "price": {"amount": 7}}
        ]}, "total": 2});
        let spec: ExtractSpec = serde_json::from_value(json!({
            "array_path": "data.results",
            "fields": {"nombre": "title", "precio": "price.amount"},
            "into": "libros"
        }))
        .unwrap();
        let out = extract(&spec, &body);
        assert_eq!(out["libros_count"], json!(2));
        assert_eq!(out["libros"][1], json!({"nombre": "Emma", "precio": 7}));

        let spec: ExtractSpec =
            serde_json::from_value(json!({"fields": {"total": "total", "primero": "data.results[0].title"}}))
                .unwrap();
        let out = extract(&spec, &body);
        assert_eq!(out["total"], json!(2));
        assert_eq!(out["primero"], json!("Dune"));
    }

    #[tokio::test]
    async fn success_builds_call_and_extracts() {
        let flow = action(json!({
            "api": "catalog",
            "method": "POST",
            "path": "/search/:q",
            "params": {"q": "{{titulo}}"},
            "query": {"lang": "{{idioma || \"es\"}}", "empty": "{{nada}}"},
            "body": {"titulo": "{{titulo}}", "limite": 5},
            "extract": {"array_path": "results", "fields": {"nombre": "title"}, "into": "libros"},
            "on_success": "mostrar",
            "on_error": "fallo"
        }));
        let mut session = session_for(&flow);
        session.set("titulo", json!("Dune"), VarScope::Global);
        let action = ScriptedAction::new(vec![Ok(ActionResponse {
            status: 200,
            body: json!({"results": [{"title": "Dune"}, {"title": "Dune Messiah"}]}),
            attempts: 1,
        })]);
        let inv = invokers(action.clone(), ScriptedLlm::new(vec![]));

        let out = run(&flow, &session, None, &inv).await.unwrap();
        assert_eq!(out.next, Next::Node("mostrar".into()));
        assert_eq!(out.outputs["libros_count"], json!(2));
        assert!(out.exports.contains(&"libros".to_string()));
        assert!(!out.exports.contains(&"status".to_string()));
        assert_eq!(out.messages, vec!["Encontré 2: [Dune][Dune Messiah]"]);

        let seen = action.seen.lock().unwrap();
        let call = &seen[0];
        assert_eq!(call.method, HttpMethod::Post);
        assert_eq!(call.url, "https://books.example.com/api/search/Dune");
        assert_eq!(call.query, vec![("lang".to_string(), "es".to_string())]);
        assert_eq!(call.headers, vec![("x-tenant".to_string(), "acme".to_string())]);
        assert_eq!(call.body, Some(json!({"titulo": "Dune", "limite": 5})));
        assert_eq!(
            call.auth,
            Some(ApiAuth::Bearer {
                token: "t0k".into(),
                header: None
            })
        );
        assert_eq!(call.policy.timeout, Duration::from_millis(5000));
        assert_eq!(call.policy.max_attempts, 2);
    }

    #[tokio::test]
    async fn timeout_routes_to_on_error() {
        let flow = action(json!({"api": "catalog", "path": "/x", "timeout_ms": 10, "on_error": "fallo"}));
        let session = session_for(&flow);
        let action = ScriptedAction::new(vec![Err(ExternalCallError::Timeout {
            target: "GET /x".into(),
            timeout_ms: 10,
            attempts: 2,
        })]);
        let inv = invokers(action.clone(), ScriptedLlm::new(vec![]));

        let out = run(&flow, &session, None, &inv).await.unwrap();
        assert_eq!(out.next, Next::Node("fallo".into()));
        assert!(out.messages.is_empty());
        assert!(out.outputs["error"].as_str().unwrap().contains("timed out"));
        assert_eq!(action.seen.lock().unwrap()[0].policy.timeout, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn failure_without_on_error_escapes() {
        let flow = action(json!({"api": "catalog", "path": "/x"}));
        let session = session_for(&flow);
        let err = ExternalCallError::Status {
            target: "GET /x".into(),
            status: 500,
            body: String::new(),
            attempts: 2,
        };
        let inv = invokers(ScriptedAction::new(vec![Err(err.clone())]), ScriptedLlm::new(vec![]));
        assert_eq!(run(&flow, &session, None, &inv).await.unwrap_err(), NodeError::External(err));
    }
}
