//! Offline flow linter. A flow must pass before it can be registered.

use std::collections::HashSet;

use petgraph::{
    Direction,
    algo::is_cyclic_directed,
    graph::DiGraph,
    visit::Dfs,
};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    condition::Condition,
    error::ConfigurationError,
    flow::{
        model::{Flow, LlmRole, NodeConfig, NodeKind},
        session::MAX_IDLE_TIMEOUT_MINS,
    },
};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<ConfigurationError>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, err: ConfigurationError) {
        self.errors.push(err);
    }

    fn warn(&mut self, node: &str, msg: impl AsRef<str>) {
        self.warnings.push(format!("node `{}`: {}", node, msg.as_ref()));
    }
}

/// Check the structural invariants of a built flow:
/// exactly one root (the entry), fan-out only on routers and the entry,
/// no dangling targets, routers with a default or at least one edge,
/// parseable guards, compilable patterns, known apis.
pub fn validate(flow: &Flow) -> ValidationReport {
    let mut report = ValidationReport::default();

    if flow.nodes.is_empty() {
        report.error(ConfigurationError::Empty(flow.id.clone()));
        return report;
    }

    let mut seen = HashSet::new();
    for node in &flow.nodes {
        if !seen.insert(node.id.as_str()) {
            report.error(ConfigurationError::DuplicateNode(node.id.clone()));
        }
    }

    if flow.node(&flow.entry_node).is_none() {
        report.error(ConfigurationError::MissingEntry(flow.entry_node.clone()));
    }

    for node in &flow.nodes {
        check_targets(flow, node, &mut report);
        check_node(flow, node, &mut report);
    }

    check_roots(flow, &mut report);
    check_reachability(flow, &mut report);
    check_pass_through_cycles(flow, &mut report);

    if let Some(mins) = flow.settings.idle_timeout_mins {
        if mins > MAX_IDLE_TIMEOUT_MINS {
            report.error(ConfigurationError::IdleTimeoutTooLong {
                flow: flow.key(),
                mins,
                max: MAX_IDLE_TIMEOUT_MINS,
            });
        }
    }

    for api in &flow.apis {
        if let Err(e) = url::Url::parse(&api.base_url) {
            report.error(ConfigurationError::BadBaseUrl {
                api: api.id.clone(),
                reason: e.to_string(),
            });
        }
    }

    if report.is_valid() {
        info!(
            "✅ flow `{}` valid ({} warnings)",
            flow.key(),
            report.warnings.len()
        );
    } else {
        warn!(
            "🛑 flow `{}` invalid: {} errors",
            flow.key(),
            report.errors.len()
        );
    }
    report
}

fn check_targets(flow: &Flow, node: &NodeConfig, report: &mut ValidationReport) {
    let targets = node
        .edges
        .iter()
        .map(|e| e.target.as_str())
        .chain(node.kind.outcome_targets().into_iter().map(|(_, t)| t));
    for target in targets {
        if flow.node(target).is_none() {
            report.error(ConfigurationError::DanglingEdge {
                from: node.id.clone(),
                to: target.to_string(),
            });
        }
    }
}

fn check_node(flow: &Flow, node: &NodeConfig, report: &mut ValidationReport) {
    let is_entry = node.id == flow.entry_node;
    let fans_out = matches!(node.kind, NodeKind::Router(_) | NodeKind::Trigger) || is_entry;

    if !fans_out && node.edges.len() > 1 {
        report.error(ConfigurationError::OutDegree {
            node: node.id.clone(),
            kind: node.tag().to_string(),
            count: node.edges.len(),
        });
    }

    let mut unguarded_seen = false;
    for edge in &node.edges {
        if unguarded_seen {
            report.warn(&node.id, format!("edge to `{}` is never taken", edge.target));
        }
        match edge.condition.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            None => unguarded_seen = true,
            Some(expr) => match expr.parse::<Condition>() {
                Ok(cond) => {
                    if cond.is_mixed() {
                        report.warn(
                            &node.id,
                            format!("`{}` mixes AND/OR; it is evaluated left to right", expr),
                        );
                    }
                }
                Err(e) => report.error(ConfigurationError::BadCondition {
                    node: node.id.clone(),
                    expr: expr.to_string(),
                    reason: e.reason,
                }),
            },
        }
    }

    match &node.kind {
        NodeKind::Router(cfg) => {
            if cfg.default.is_none() && node.edges.is_empty() {
                report.error(ConfigurationError::RouterWithoutRoutes(node.id.clone()));
            } else if cfg.default.is_none() && !unguarded_seen {
                report.warn(&node.id, "no default route; a turn may dead-end here");
            }
        }
        NodeKind::Input(cfg) => {
            if let Some(pattern) = &cfg.pattern {
                if let Err(e) = Regex::new(pattern) {
                    report.error(ConfigurationError::BadPattern {
                        node: node.id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
            if cfg.max_attempts == 0 {
                report.error(bad(node, "max_attempts must be at least 1"));
            }
            if let (Some(min), Some(max)) = (cfg.min_length, cfg.max_length) {
                if min > max {
                    report.error(bad(node, "min_length is larger than max_length"));
                }
            }
        }
        NodeKind::Confirmation(cfg) => {
            if cfg.max_attempts == 0 {
                report.error(bad(node, "max_attempts must be at least 1"));
            }
        }
        NodeKind::Action(cfg) => {
            if flow.api(&cfg.api).is_none() {
                report.error(ConfigurationError::UnknownApi {
                    node: node.id.clone(),
                    api: cfg.api.clone(),
                });
            }
        }
        NodeKind::Llm(cfg) => match cfg.role {
            LlmRole::Extractor if cfg.fields.is_empty() => {
                report.error(bad(node, "extractor declares no fields"));
            }
            LlmRole::Classifier if cfg.labels.is_empty() => {
                report.error(bad(node, "classifier declares no labels"));
            }
            LlmRole::Classifier => {
                if let Some(label) = &cfg.default_label {
                    if !cfg.labels.contains(label) {
                        report.error(bad(node, format!("default label `{}` is not a label", label)));
                    }
                }
            }
            _ => {}
        },
        NodeKind::Trigger | NodeKind::Message(_) => {}
    }

    if !fans_out && node.edges.len() == 1 && node.edges[0].condition.is_some() {
        report.warn(&node.id, "guard on a single edge; the flow ends when it fails");
    }
}

fn bad(node: &NodeConfig, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::BadConfig {
        node: node.id.clone(),
        reason: reason.into(),
    }
}

fn check_roots(flow: &Flow, report: &mut ValidationReport) {
    let graph = flow.graph();
    let roots: Vec<String> = graph
        .node_indices()
        .filter(|&ix| graph.neighbors_directed(ix, Direction::Incoming).next().is_none())
        .map(|ix| graph[ix].clone())
        .collect();

    match roots.as_slice() {
        [root] if *root == flow.entry_node => {}
        [root] => {
            if flow.node(&flow.entry_node).is_some() {
                report.error(ConfigurationError::EntryNotRoot {
                    entry: flow.entry_node.clone(),
                    root: root.clone(),
                });
            }
        }
        _ => {
            let mut roots = roots;
            roots.sort();
            report.error(ConfigurationError::EntryCount(roots));
        }
    }
}

fn check_reachability(flow: &Flow, report: &mut ValidationReport) {
    let Some(entry) = flow.index_of(&flow.entry_node) else { return };
    let graph = flow.graph();
    let mut reachable = HashSet::new();
    let mut dfs = Dfs::new(graph, entry);
    while let Some(ix) = dfs.next(graph) {
        reachable.insert(ix);
    }
    let mut unreachable: Vec<&String> = graph
        .node_indices()
        .filter(|ix| !reachable.contains(ix))
        .map(|ix| &graph[ix])
        .collect();
    unreachable.sort();
    for id in unreachable {
        report.warn(id, "unreachable from the entry node");
    }
}

/// A cycle made only of nodes that never wait for input would spin until the
/// step cap.
fn check_pass_through_cycles(flow: &Flow, report: &mut ValidationReport) {
    let passes = |node: &NodeConfig| match &node.kind {
        NodeKind::Trigger | NodeKind::Router(_) | NodeKind::Action(_) => true,
        NodeKind::Message(cfg) => !cfg.await_reply,
        _ => false,
    };
    let mut sub = DiGraph::<&str, ()>::new();
    let mut idx = std::collections::HashMap::new();
    for node in flow.nodes.iter().filter(|n| passes(n)) {
        idx.entry(node.id.as_str()).or_insert_with(|| sub.add_node(node.id.as_str()));
    }
    for node in flow.nodes.iter().filter(|n| passes(n)) {
        let from = idx[node.id.as_str()];
        let targets = node
            .edges
            .iter()
            .map(|e| e.target.as_str())
            .chain(node.kind.outcome_targets().into_iter().map(|(_, t)| t));
        for target in targets {
            if let Some(&to) = idx.get(target) {
                sub.add_edge(from, to, ());
            }
        }
    }
    if is_cyclic_directed(&sub) {
        report.warn(
            &flow.entry_node,
            "cycle without any node that waits for input; turns will hit the step cap",
        );
    }
}
