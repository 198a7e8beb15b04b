use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::{NodeError, ValidationError},
    flow::model::{KindTag, NodeConfig, NodeKind},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch, reject_answer},
    util::{capitalize, normalize},
};

const AFFIRMATIVE: [&str; 10] = ["si", "sí", "s", "yes", "y", "ok", "dale", "confirmo", "confirmar", "1"];
const NEGATIVE: [&str; 5] = ["no", "n", "0", "cancelar", "nope"];

/// Map a free-text reply to yes/no.
pub fn parse_yes_no(raw: &str) -> Option<bool> {
    let reply = normalize(raw);
    if AFFIRMATIVE.contains(&reply.as_str()) {
        Some(true)
    } else if NEGATIVE.contains(&reply.as_str()) {
        Some(false)
    } else {
        None
    }
}

pub struct ConfirmationExecutor;

#[async_trait]
impl NodeExecutor for ConfirmationExecutor {
    #[tracing::instrument(name = "confirmation_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Confirmation(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Confirmation));
        };
        let Some(text) = ctx.inbound else {
            return Ok(NodeOutcome::wait(ctx.prompt(node, &ctx.scope)));
        };

        match parse_yes_no(text) {
            Some(yes) => {
                let branch = if yes { &cfg.on_yes } else { &cfg.on_no };
                let outcome = match branch {
                    Some(target) => NodeOutcome::goto(target.clone()),
                    None => NodeOutcome::follow(),
                };
                Ok(outcome.set(cfg.variable.clone(), Value::Bool(yes), cfg.global))
            }
            None => {
                let complaint = cfg
                    .error_message
                    .as_deref()
                    .map(|m| ctx.render(m))
                    .unwrap_or_else(|| capitalize(&ValidationError::NotYesOrNo.to_string()));
                reject_answer(node, ctx, cfg.max_attempts, cfg.fallback.as_ref(), complaint)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::model::{ConfirmationConfig, Edge},
        node::{
            Next,
            testing::{flow_with, no_invokers, run, session_for},
        },
    };
    use serde_json::json;

    fn confirm(on_yes: Option<&str>, on_no: Option<&str>) -> NodeConfig {
        let cfg: ConfirmationConfig = serde_json::from_value(json!({
            "on_yes": on_yes,
            "on_no": on_no,
        }))
        .unwrap();
        NodeConfig::new("confirmar", NodeKind::Confirmation(cfg))
            .with_template("¿Confirmas tu pedido?")
            .with_edge(Edge::to("siguiente"))
    }

    #[test]
    fn vocabulary() {
        for yes in ["Sí", "si!", " OK ", "dale", "1", "Confirmo"] {
            assert_eq!(parse_yes_no(yes), Some(true), "{yes}");
        }
        for no in ["No", "n", "0", "Cancelar", "nope."] {
            assert_eq!(parse_yes_no(no), Some(false), "{no}");
        }
        assert_eq!(parse_yes_no("tal vez"), None);
    }

    #[tokio::test]
    async fn routes_by_answer() {
        let flow = flow_with(confirm(Some("pagar"), Some("menu")));
        let session = session_for(&flow);

        let out = run(&flow, &session, Some("sí"), &no_invokers()).await.unwrap();
        assert_eq!(out.next, Next::Node("pagar".into()));
        assert_eq!(out.outputs["confirmed"], json!(true));

        let out = run(&flow, &session, Some("no"), &no_invokers()).await.unwrap();
        assert_eq!(out.next, Next::Node("menu".into()));
        assert_eq!(out.outputs["confirmed"], json!(false));
    }

    #[tokio::test]
    async fn without_branches_follows_edges() {
        let flow = flow_with(confirm(None, None));
        let session = session_for(&flow);
        let out = run(&flow, &session, Some("yes"), &no_invokers()).await.unwrap();
        assert_eq!(out.next, Next::FollowEdges);
    }

    #[tokio::test]
    async fn unclear_answer_reprompts() {
        let flow = flow_with(confirm(None, None));
        let session = session_for(&flow);
        let out = run(&flow, &session, Some("quizás"), &no_invokers()).await.unwrap();
        assert!(out.awaiting_input);
        assert_eq!(
            out.messages,
            vec!["Please answer yes or no (attempt 2/3)", "¿Confirmas tu pedido?"]
        );
    }
}
