use async_trait::async_trait;
use serde_json::{Map, Number, Value, json};
use tracing::{debug, info, warn};

use crate::{
    error::{ExternalCallError, ExtractionParseError, NodeError},
    flow::{
        model::{FieldSpec, FieldType, KindTag, LlmConfig, LlmRole, NodeConfig, NodeKind},
        session::Role,
    },
    invoker::{ChatMessage, LlmRequest},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch, reject_answer},
    template::{is_present, lookup},
    util::normalize,
};

const DEFAULT_PERSONA: &str = "You are a friendly assistant for this business. Answer briefly.";
const DEFAULT_REPROMPT: &str = "Sorry, I did not get that. Could you say it again?";

/// Language-model step in one of three roles.
pub struct LlmExecutor;

#[async_trait]
impl NodeExecutor for LlmExecutor {
    #[tracing::instrument(name = "llm_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Llm(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Llm));
        };
        match cfg.role {
            LlmRole::Conversational => converse(node, cfg, ctx).await,
            LlmRole::Extractor => extract(node, cfg, ctx).await,
            LlmRole::Classifier => classify(node, cfg, ctx).await,
        }
    }
}

async fn call(cfg: &LlmConfig, ctx: &NodeContext<'_>, request: LlmRequest) -> Result<String, ExternalCallError> {
    let request = LlmRequest {
        model: cfg.model.clone(),
        max_tokens: cfg.max_tokens,
        ..request
    };
    let response = ctx.invokers.llm.complete(request).await?;
    debug!(
        "👣 llm replied after {} attempt(s), {} tokens",
        response.attempts, response.usage.total_tokens
    );
    Ok(response.text)
}

fn on_call_error(node: &NodeConfig, cfg: &LlmConfig, err: ExternalCallError) -> Result<NodeOutcome, NodeError> {
    warn!("🛑 llm call at `{}` failed: {}", node.id, err);
    match &cfg.on_error {
        Some(target) => Ok(NodeOutcome::goto(target.clone()).set("error", json!(err.to_string()), false)),
        None => Err(err.into()),
    }
}

/// The text an extractor or classifier works on.
fn subject<'a>(ctx: &'a NodeContext<'_>) -> Option<&'a str> {
    ctx.inbound.or_else(|| ctx.session.last_user_message())
}

// ---------------------------------------------------------------- conversational

async fn converse(node: &NodeConfig, cfg: &LlmConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
    if ctx.inbound.is_none() && node.template.is_some() {
        return Ok(NodeOutcome::wait(ctx.prompt(node, &ctx.scope)));
    }

    let mut messages = vec![ChatMessage::system(system_prompt(cfg, ctx))];
    for entry in ctx.session.history() {
        messages.push(match entry.role {
            Role::User => ChatMessage::user(entry.text.clone()),
            Role::Assistant => ChatMessage::assistant(entry.text.clone()),
        });
    }
    if let Some(text) = ctx.inbound {
        if messages.last().map(|m| m.role.as_str() != "user" || m.content != text).unwrap_or(true) {
            messages.push(ChatMessage::user(text));
        }
    }

    let reply = match call(
        cfg,
        ctx,
        LlmRequest {
            messages,
            temperature: cfg.temperature,
            ..LlmRequest::default()
        },
    )
    .await
    {
        Ok(reply) => reply,
        Err(err) => return on_call_error(node, cfg, err),
    };

    let output = cfg.output.clone().unwrap_or_else(|| "reply".to_string());
    match cfg.completion_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) if reply.contains(token) => {
            let cleaned = reply.replace(token, "").trim().to_string();
            info!("✅ `{}` collected everything it needed", node.id);
            Ok(NodeOutcome::follow()
                .set(output, json!(cleaned), cfg.global)
                .say(cleaned))
        }
        Some(_) => Ok(NodeOutcome::wait(reply.trim()).set(output, json!(reply.trim()), cfg.global)),
        None => Ok(NodeOutcome::follow()
            .set(output, json!(reply.trim()), cfg.global)
            .say(reply.trim())),
    }
}

/// Persona, one section per knowledge snippet, then what is still missing.
pub fn system_prompt(cfg: &LlmConfig, ctx: &NodeContext<'_>) -> String {
    let mut prompt = cfg
        .persona
        .as_deref()
        .map(|p| ctx.render(p))
        .unwrap_or_else(|| DEFAULT_PERSONA.to_string());

    for snippet in &cfg.knowledge {
        prompt.push_str(&format!("\n\n## {}\n{}", snippet.title, ctx.render(&snippet.content)));
        if !snippet.keywords.is_empty() {
            prompt.push_str(&format!("\nKeywords: {}", snippet.keywords.join(", ")));
        }
    }

    let missing: Vec<&FieldSpec> = cfg
        .collect
        .iter()
        .filter(|f| !lookup(&ctx.scope, &f.name).map(is_present).unwrap_or(false))
        .collect();
    if !cfg.collect.is_empty() {
        prompt.push_str("\n\n## Information to collect");
        if missing.is_empty() {
            prompt.push_str("\nEverything has been collected.");
        }
        for field in &missing {
            prompt.push_str(&format!("\n{}", describe_field(field)));
        }
        prompt.push_str("\nAsk for one missing item at a time.");
    }
    if let Some(token) = &cfg.completion_token {
        prompt.push_str(&format!(
            "\nWhen every required item is known, end your reply with {}.",
            token
        ));
    }
    prompt
}

fn describe_field(field: &FieldSpec) -> String {
    let mut line = format!(
        "- {} ({}, {})",
        field.name,
        field.field_type,
        if field.required { "required" } else { "optional" }
    );
    if let Some(description) = &field.description {
        line.push_str(&format!(": {}", description));
    }
    if !field.examples.is_empty() {
        line.push_str(&format!(". Examples: {}", field.examples.join(", ")));
    }
    line
}

// ---------------------------------------------------------------- extractor

async fn extract(node: &NodeConfig, cfg: &LlmConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
    if ctx.inbound.is_none() && node.template.is_some() {
        return Ok(NodeOutcome::wait(ctx.prompt(node, &ctx.scope)));
    }
    let reprompt = || {
        cfg.reprompt
            .as_deref()
            .map(|r| ctx.render(r))
            .unwrap_or_else(|| DEFAULT_REPROMPT.to_string())
    };
    let Some(text) = subject(ctx) else {
        return Ok(NodeOutcome::wait(reprompt()));
    };

    let mut schema = String::new();
    for field in &cfg.fields {
        schema.push_str(&format!("\n{}", describe_field(field)));
    }
    let system = format!(
        "Extract the following fields from the user's message.{}\n\
         Reply with a single JSON object and nothing else. Use null for anything not mentioned.",
        schema
    );
    let request = LlmRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(text)],
        temperature: Some(cfg.temperature.unwrap_or(0.0)),
        json_mode: true,
        ..LlmRequest::default()
    };
    let reply = match call(cfg, ctx, request).await {
        Ok(reply) => reply,
        Err(err) => return on_call_error(node, cfg, err),
    };

    match parse_fields(&reply, &cfg.fields) {
        Ok(fields) => {
            info!("✅ `{}` extracted {} field(s)", node.id, fields.len());
            let mut outcome = NodeOutcome::follow();
            if let Some(output) = &cfg.output {
                outcome = outcome.set(output.clone(), Value::Object(fields.clone()), false);
            }
            for (name, value) in fields {
                outcome = outcome.set(name, value, cfg.global);
            }
            Ok(outcome)
        }
        Err(err) => {
            warn!("🛑 `{}`: {}", node.id, err);
            reject_answer(node, ctx, cfg.max_attempts, cfg.on_error.as_ref(), reprompt())
        }
    }
}

/// Locate the outermost JSON object in free text. Candidates are tried from
/// each `{` in order; the first one that parses as a complete object wins.
pub fn locate_json(text: &str) -> Result<Map<String, Value>, ExtractionParseError> {
    let mut first_err = None;
    for (start, _) in text.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(Value::Object(map))) => return Ok(map),
            Some(Ok(_)) | None => {}
            Some(Err(err)) => {
                first_err.get_or_insert_with(|| err.to_string());
            }
        }
    }
    Err(ExtractionParseError::new(
        first_err.unwrap_or_else(|| "no JSON object in reply".to_string()),
        text,
    ))
}

/// Parse an extractor reply into the declared fields. Declared fields that are
/// absent come back as `null`; undeclared keys are dropped unless nothing was declared.
pub fn parse_fields(reply: &str, fields: &[FieldSpec]) -> Result<Map<String, Value>, ExtractionParseError> {
    let mut parsed = locate_json(reply)?;
    if fields.is_empty() {
        return Ok(parsed);
    }
    Ok(fields
        .iter()
        .map(|field| {
            let value = parsed.remove(&field.name).unwrap_or(Value::Null);
            (field.name.clone(), coerce(value, field.field_type))
        })
        .collect())
}

fn coerce(value: Value, field_type: FieldType) -> Value {
    match (field_type, value) {
        (_, Value::String(s)) if s.trim().is_empty() => Value::Null,
        (FieldType::Number, Value::String(s)) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .and_then(|n| {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Some(Value::from(n as i64))
                } else {
                    Number::from_f64(n).map(Value::Number)
                }
            })
            .unwrap_or(Value::String(s)),
        (FieldType::Boolean, Value::String(s)) => match normalize(&s).as_str() {
            "true" | "si" | "yes" => Value::Bool(true),
            "false" | "no" => Value::Bool(false),
            _ => Value::String(s),
        },
        (FieldType::String, Value::Number(n)) => Value::String(n.to_string()),
        (_, other) => other,
    }
}

// ---------------------------------------------------------------- classifier

async fn classify(node: &NodeConfig, cfg: &LlmConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
    let text = subject(ctx).unwrap_or_default();
    let system = format!(
        "Classify the user's message into exactly one of these labels: {}.\n\
         Reply with JSON only: {{\"label\": \"<label>\", \"confidence\": <number between 0 and 1>}}",
        cfg.labels.join(", ")
    );
    let request = LlmRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(text)],
        temperature: Some(cfg.temperature.unwrap_or(0.0)),
        json_mode: true,
        ..LlmRequest::default()
    };
    let reply = match call(cfg, ctx, request).await {
        Ok(reply) => reply,
        Err(err) => return on_call_error(node, cfg, err),
    };

    let output = cfg.output.clone().unwrap_or_else(|| "intent".to_string());
    let (label, confidence) = match parse_label(&reply, &cfg.labels) {
        Some(found) => found,
        None => {
            warn!("🛑 `{}` got no known label from `{}`", node.id, reply);
            (cfg.default_label.clone(), None)
        }
    };
    debug!("👣 `{}` = {:?} ({:?})", output, label, confidence);
    Ok(NodeOutcome::follow()
        .set(format!("{}_confidence", output), confidence.map(Value::from).unwrap_or(Value::Null), cfg.global)
        .set(output, label.map(Value::from).unwrap_or(Value::Null), cfg.global))
}

/// A known label, from `{"label": .., "confidence": ..}` or plain text.
pub fn parse_label(reply: &str, labels: &[String]) -> Option<(Option<String>, Option<f64>)> {
    let known = |candidate: &str| {
        let wanted = normalize(candidate);
        labels.iter().find(|l| normalize(l) == wanted).cloned()
    };

    if let Ok(map) = locate_json(reply) {
        let label = map.get("label").and_then(Value::as_str).and_then(known)?;
        let confidence = map.get("confidence").and_then(|c| match c {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        return Some((Some(label), confidence));
    }

    if let Some(label) = known(reply) {
        return Some((Some(label), None));
    }
    // prose that names exactly one label
    let folded = normalize(reply);
    let mut named = labels
        .iter()
        .filter(|l| crate::util::contains_word(&folded, &normalize(l)));
    match (named.next(), named.next()) {
        (Some(label), None) => Some((Some(label.clone()), None)),
        _ => None,
    }
}
