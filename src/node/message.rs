use async_trait::async_trait;

use crate::{
    error::NodeError,
    flow::model::{KindTag, NodeConfig, NodeKind},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch},
};

/// Render and send. With `await_reply` the turn stops here and the next
/// inbound message resumes at the successor.
pub struct MessageExecutor;

#[async_trait]
impl NodeExecutor for MessageExecutor {
    #[tracing::instrument(name = "message_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Message(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Message));
        };
        let mut outcome = NodeOutcome::follow().say(ctx.prompt(node, &ctx.scope));
        outcome.awaiting_input = cfg.await_reply;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        flow::{model::MessageConfig, session::VarScope},
        node::{
            Next,
            testing::{flow_with, no_invokers, run, session_for},
        },
    };
    use serde_json::json;

    #[tokio::test]
    async fn renders_against_scope() {
        let flow = flow_with(
            NodeConfig::new("hola", NodeKind::Message(MessageConfig::default()))
                .with_template("Hola {{nombre || \"amigo\"}}, bienvenido a {{flow.tienda}}"),
        )
        .with_variable("tienda", json!("Libros Acme"));
        let mut session = session_for(&flow);

        let out = run(&flow, &session, None, &no_invokers()).await.unwrap();
        assert_eq!(out.messages, vec!["Hola amigo, bienvenido a Libros Acme"]);
        assert!(!out.awaiting_input);
        assert_eq!(out.next, Next::FollowEdges);

        session.set("nombre", json!("Ana"), VarScope::Global);
        let out = run(&flow, &session, None, &no_invokers()).await.unwrap();
        assert_eq!(out.messages, vec!["Hola Ana, bienvenido a Libros Acme"]);
    }

    #[tokio::test]
    async fn await_reply_pauses_the_turn() {
        let flow = flow_with(
            NodeConfig::new("info", NodeKind::Message(MessageConfig { await_reply: true }))
                .with_template("Cuéntame más"),
        );
        let session = session_for(&flow);
        let out = run(&flow, &session, None, &no_invokers()).await.unwrap();
        assert!(out.awaiting_input);
        assert_eq!(out.next, Next::FollowEdges);
    }
}
