use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    error::{NodeError, ValidationError},
    flow::model::{AnswerType, InputConfig, KindTag, NodeConfig, NodeKind},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch, reject_answer},
    util::{capitalize, normalize},
};

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

/// Replies that leave an optional field empty.
const SKIP_WORDS: [&str; 5] = ["skip", "omitir", "saltar", "ninguno", "n/a"];

/// Prompt, then validate the reply on the next turn.
pub struct InputExecutor;

#[async_trait]
impl NodeExecutor for InputExecutor {
    #[tracing::instrument(name = "input_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Input(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Input));
        };
        let Some(text) = ctx.inbound else {
            return Ok(NodeOutcome::wait(ctx.prompt(node, &ctx.scope)));
        };

        match parse_and_validate(text, cfg) {
            Ok(value) => {
                debug!("👣 `{}` = {}", cfg.variable, value);
                Ok(NodeOutcome::follow().set(cfg.variable.clone(), value, cfg.global))
            }
            Err(err) => {
                let complaint = cfg
                    .error_message
                    .as_deref()
                    .map(|m| ctx.render(m))
                    .unwrap_or_else(|| capitalize(&err.to_string()));
                reject_answer(node, ctx, cfg.max_attempts, cfg.fallback.as_ref(), complaint)
            }
        }
    }
}

/// Check a raw reply against the node's rules and return the value to store.
pub fn parse_and_validate(raw: &str, cfg: &InputConfig) -> Result<Value, ValidationError> {
    let trimmed = raw.trim();
    let folded = normalize(trimmed);
    let skipped = !cfg.required && (folded.is_empty() || SKIP_WORDS.contains(&folded.as_str()));
    if trimmed.is_empty() || skipped {
        return if cfg.required {
            Err(ValidationError::Required)
        } else {
            Ok(Value::Null)
        };
    }

    if !cfg.options.is_empty() {
        return match_option(trimmed, &cfg.options);
    }

    let len = trimmed.chars().count();
    if let Some(min) = cfg.min_length {
        if len < min {
            return Err(ValidationError::TooShort(min));
        }
    }
    if let Some(max) = cfg.max_length {
        if len > max {
            return Err(ValidationError::TooLong(max));
        }
    }
    if let Some(pattern) = &cfg.pattern {
        let regex = Regex::new(pattern).map_err(|e| ValidationError::Internal(e.to_string()))?;
        if !regex.is_match(trimmed) {
            return Err(ValidationError::Pattern(pattern.clone()));
        }
    }

    match cfg.answer_type {
        AnswerType::Text => Ok(Value::String(trimmed.to_owned())),
        AnswerType::Number => {
            let v: f64 = trimmed
                .replace(',', ".")
                .parse()
                .map_err(|_| ValidationError::NotANumber)?;
            if !v.is_finite() {
                return Err(ValidationError::NotANumber);
            }
            if v.fract() == 0.0 && v.abs() < 1e15 {
                Ok(json!(v as i64))
            } else {
                Ok(json!(v))
            }
        }
        AnswerType::Email => {
            if EMAIL.is_match(trimmed) {
                Ok(Value::String(trimmed.to_lowercase()))
            } else {
                Err(ValidationError::InvalidEmail)
            }
        }
        AnswerType::Phone => {
            let plus = trimmed.starts_with('+');
            let rest = trimmed.trim_start_matches('+');
            if !rest
                .chars()
                .all(|c| c.is_ascii_digit() || " -().".contains(c))
            {
                return Err(ValidationError::InvalidPhone);
            }
            let digits: String = rest.chars().filter(char::is_ascii_digit).collect();
            if !(7..=15).contains(&digits.len()) {
                return Err(ValidationError::InvalidPhone);
            }
            Ok(Value::String(if plus { format!("+{}", digits) } else { digits }))
        }
        AnswerType::Date => ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
            .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
            .ok_or(ValidationError::InvalidDate),
    }
}

/// A reply matches an option by its key (`"2"`) or its value (`"Inglés"`);
/// the option value is what gets stored.
fn match_option(reply: &str, options: &BTreeMap<String, String>) -> Result<Value, ValidationError> {
    if let Some(value) = options.get(reply) {
        return Ok(Value::String(value.clone()));
    }
    let wanted = normalize(reply);
    options
        .iter()
        .find(|(key, value)| normalize(value) == wanted || normalize(key) == wanted)
        .map(|(_, value)| Value::String(value.clone()))
        .ok_or_else(|| ValidationError::NotAnOption(options.values().cloned().collect()))
}
