use async_trait::async_trait;
use tracing::{error, trace};

use crate::{
    condition::select_edge,
    error::{ConfigurationError, NodeError},
    flow::model::{KindTag, NodeConfig, NodeKind},
    node::{NodeContext, NodeExecutor, NodeOutcome, kind_mismatch},
};

/// First edge whose guard holds, else the default. Anything else is a
/// defect in the flow.
pub struct RouterExecutor;

#[async_trait]
impl NodeExecutor for RouterExecutor {
    #[tracing::instrument(name = "router_node_process", skip(self, node, ctx), fields(node = %node.id))]
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        let NodeKind::Router(cfg) = &node.kind else {
            return Err(kind_mismatch(node, KindTag::Router));
        };
        let target = select_edge(&node.edges, &ctx.scope)
            .map(|edge| edge.target.clone())
            .or_else(|| cfg.default.clone());
        match target {
            Some(target) => {
                trace!("👣 router `{}` -> `{}`", node.id, target);
                Ok(NodeOutcome::goto(target).say(ctx.prompt(node, &ctx.scope)))
            }
            None => {
                error!("🛑 router `{}` matched no edge and has no default", node.id);
                Err(ConfigurationError::RouterDeadEnd(node.id.clone()).into())
            }
        }
    }
}

/// Entry point of a flow; it only passes control to its edges.
pub struct TriggerExecutor;

#[async_trait]
impl NodeExecutor for TriggerExecutor {
    async fn execute(&self, node: &NodeConfig, ctx: &NodeContext<'_>) -> Result<NodeOutcome, NodeError> {
        Ok(NodeOutcome::follow().say(ctx.prompt(node, &ctx.scope)))
    }
}
