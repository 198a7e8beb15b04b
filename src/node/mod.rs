//! Node executors: one strategy per node kind, dispatched through [`ExecutorTable`].

pub mod action;
pub mod confirmation;
pub mod input;
pub mod llm;
pub mod message;
pub mod router;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{
    config::EngineSettings,
    error::{ConfigurationError, NodeError},
    flow::{
        model::{Flow, KindTag, NodeConfig},
        session::Session,
    },
    invoker::Invokers,
    template,
};

/// Where the walk goes after a node ran.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Next {
    /// Take the first edge whose guard holds; none means the flow is complete.
    #[default]
    FollowEdges,
    /// Jump to a node named in the config (`on_success`, `fallback`, ...).
    Node(String),
    /// Remain on this node; only meaningful together with `awaiting_input`.
    Stay,
    /// Finish the flow.
    End,
}

/// What a node produced. `awaiting_input` ends the turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeOutcome {
    pub outputs: Map<String, Value>,
    /// Output keys also written to the global namespace.
    pub exports: Vec<String>,
    pub messages: Vec<String>,
    pub next: Next,
    pub awaiting_input: bool,
    /// Failed answers so far; `None` clears the counter.
    pub attempts: Option<u32>,
}

impl NodeOutcome {
    pub fn follow() -> Self {
        Self::default()
    }

    pub fn goto(target: impl Into<String>) -> Self {
        Self {
            next: Next::Node(target.into()),
            ..Self::default()
        }
    }

    /// Stay on the node and wait for the next inbound message.
    pub fn wait(prompt: impl Into<String>) -> Self {
        Self {
            next: Next::Stay,
            awaiting_input: true,
            ..Self::default()
        }
        .say(prompt)
    }

    /// Queue an outbound message; blank text is dropped.
    pub fn say(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        if !text.trim().is_empty() {
            self.messages.push(text);
        }
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: Value, export: bool) -> Self {
        let key = key.into();
        if export && !self.exports.contains(&key) {
            self.exports.push(key.clone());
        }
        self.outputs.insert(key, value);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }
}

/// Everything a node may read while it runs. Nodes never mutate the session;
/// the engine applies the outcome.
pub struct NodeContext<'a> {
    pub session: &'a Session,
    pub flow: &'a Flow,
    /// Inbound text, only for the node the session was paused on.
    pub inbound: Option<&'a str>,
    pub scope: Value,
    pub invokers: &'a Invokers,
    pub settings: &'a EngineSettings,
}

impl NodeContext<'_> {
    pub fn render(&self, text: &str) -> String {
        template::render(text, &self.scope)
    }

    /// The node's template, rendered against `scope` (empty when there is none).
    pub fn prompt(&self, node: &NodeConfig, scope: &Value) -> String {
        node.template
            .as_deref()
            .map(|t| template::render(t, scope))
            .unwrap_or_default()
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError>;
}

/// Kind tag to executor.
#[derive(Clone)]
pub struct ExecutorTable {
    table: HashMap<KindTag, Arc<dyn NodeExecutor>>,
}

impl Default for ExecutorTable {
    fn default() -> Self {
        let mut table = Self {
            table: HashMap::new(),
        };
        table.register(KindTag::Trigger, Arc::new(router::TriggerExecutor));
        table.register(KindTag::Input, Arc::new(input::InputExecutor));
        table.register(KindTag::Confirmation, Arc::new(confirmation::ConfirmationExecutor));
        table.register(KindTag::Message, Arc::new(message::MessageExecutor));
        table.register(KindTag::Action, Arc::new(action::ActionExecutor));
        table.register(KindTag::Router, Arc::new(router::RouterExecutor));
        table.register(KindTag::Llm, Arc::new(llm::LlmExecutor));
        table
    }
}

impl ExecutorTable {
    pub fn register(&mut self, tag: KindTag, executor: Arc<dyn NodeExecutor>) {
        self.table.insert(tag, executor);
    }

    pub async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let executor = self.table.get(&node.tag()).ok_or_else(|| {
            ConfigurationError::BadConfig {
                node: node.id.clone(),
                reason: format!("no executor for kind `{}`", node.tag()),
            }
        })?;
        executor.execute(node, ctx).await
    }
}

pub(crate) fn kind_mismatch(node: &NodeConfig, expected: KindTag) -> NodeError {
    NodeError::Configuration(ConfigurationError::BadConfig {
        node: node.id.clone(),
        reason: format!("expected a {} node, found {}", expected, node.tag()),
    })
}

/// Shared bookkeeping for nodes that re-prompt on a bad answer: count the
/// failure, re-prompt while attempts remain, then take the fallback.
pub(crate) fn reject_answer(
    node: &NodeConfig,
    ctx: &NodeContext<'_>,
    max_attempts: u32,
    fallback: Option<&String>,
    complaint: String,
) -> Result<NodeOutcome, NodeError> {
    let used = ctx.session.attempts(&node.id) + 1;
    if used >= max_attempts.max(1) {
        warn!(
            "🛑 node `{}` gave up after {} attempts",
            node.id, used
        );
        return match fallback {
            Some(target) => Ok(NodeOutcome::goto(target.clone())),
            None => Err(NodeError::AttemptsExhausted(node.id.clone())),
        };
    }
    Ok(NodeOutcome::wait(format!(
        "{} (attempt {}/{})",
        complaint,
        used + 1,
        max_attempts
    ))
    .say(ctx.prompt(node, &ctx.scope))
    .with_attempts(used))
}
