//! Flow Engine: the single entry point that advances a contact's session.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, trace, warn};

use crate::{
    condition::select_edge,
    config::EngineSettings,
    error::{ConfigurationError, NodeError},
    flow::{
        manager::FlowManager,
        model::Flow,
        session::{InMemorySessionStore, Role, Session, SessionManager},
    },
    invoker::{HttpActionInvoker, Invokers, LlmInvoker, OpenAiInvoker, UnconfiguredLlm},
    message::{InboundMessage, TurnOutcome, TurnReply},
    node::{ExecutorTable, Next, NodeContext, NodeOutcome},
    util::normalize,
};

/// How the walk over the graph stopped.
enum WalkEnd {
    Awaiting,
    Completed,
    Failed(String),
}

pub struct FlowEngine {
    flows: Arc<FlowManager>,
    sessions: Arc<SessionManager>,
    executors: ExecutorTable,
    invokers: Invokers,
    settings: EngineSettings,
}

impl FlowEngine {
    pub fn new(
        flows: Arc<FlowManager>,
        sessions: Arc<SessionManager>,
        invokers: Invokers,
        settings: EngineSettings,
    ) -> Self {
        Self {
            flows,
            sessions,
            executors: ExecutorTable::default(),
            invokers,
            settings,
        }
    }

    /// Engine with an in-memory session store, the reqwest action invoker and,
    /// when a key is configured, the OpenAI-compatible chat invoker.
    pub fn from_settings(flows: Arc<FlowManager>, settings: EngineSettings) -> Self {
        let store = InMemorySessionStore::new(settings.session_capacity);
        let sessions = SessionManager::new(store, settings.history_window, settings.idle_timeout);
        let llm: Arc<dyn LlmInvoker> = match &settings.openai_key {
            Some(key) => Arc::new(OpenAiInvoker::new(
                settings.openai_url.clone(),
                key.clone(),
                settings.openai_model.clone(),
                settings.llm_policy(),
            )),
            None => {
                warn!("OPENAI_KEY is not set; llm nodes will fail over to their onError targets");
                Arc::new(UnconfiguredLlm)
            }
        };
        let invokers = Invokers::new(Arc::new(HttpActionInvoker::new()), llm);
        Self::new(flows, sessions, invokers, settings)
    }

    pub fn with_executors(mut self, executors: ExecutorTable) -> Self {
        self.executors = executors;
        self
    }

    pub fn flows(&self) -> &Arc<FlowManager> {
        &self.flows
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn handle_message(&self, message: InboundMessage) -> TurnReply {
        trace!("👣 inbound on channel `{}`", message.channel);
        self.handle_turn(&message.tenant_id, &message.contact_id, &message.text)
            .await
    }

    /// Process one inbound message for a contact. Turns for the same contact
    /// are serialized; a second message waits until the first one is saved.
    #[tracing::instrument(name = "flow_turn", skip(self, text))]
    pub async fn handle_turn(&self, tenant_id: &str, contact_id: &str, text: &str) -> TurnReply {
        let started = Instant::now();
        let _guard = self.sessions.lock(tenant_id, contact_id).await;
        let now = Utc::now();

        let existing = match self.sessions.load(tenant_id, contact_id, now).await {
            Ok(session) => session,
            Err(expired) => {
                info!("👣 {}; restarting flow selection", expired);
                None
            }
        };

        let resumed = match existing {
            Some(session) => match self.flows.get(tenant_id, &session.flow_id) {
                Some(flow) => Some((flow, session)),
                None => {
                    warn!(
                        "🛑 flow `{}` is gone; dropping session {}",
                        session.flow_id, session.id
                    );
                    self.sessions.delete(tenant_id, contact_id).await;
                    None
                }
            },
            None => None,
        };

        let (flow, mut session) = match resumed {
            Some((flow, _)) if self.is_abandon(&flow, text) => {
                self.sessions.delete(tenant_id, contact_id).await;
                info!("👣 `{}:{}` abandoned flow `{}`", tenant_id, contact_id, flow.id);
                let reply = TurnReply {
                    messages: vec![
                        flow.settings
                            .abandon_message
                            .clone()
                            .unwrap_or_else(|| self.settings.abandon_message.clone()),
                    ],
                    awaiting_input: false,
                    flow_id: Some(flow.id.clone()),
                    current_node: None,
                    outcome: TurnOutcome::Abandoned,
                };
                return self.report(tenant_id, contact_id, 0, started, reply);
            }
            Some(pair) => pair,
            None => match self.flows.select_flow(tenant_id, text) {
                Some(flow) => {
                    let session = self
                        .sessions
                        .load_or_create(tenant_id, contact_id, &flow, now)
                        .await;
                    (flow, session)
                }
                None => {
                    trace!("👣 no flow of `{}` matches `{}`", tenant_id, text);
                    return self.report(tenant_id, contact_id, 0, started, TurnReply::no_flow());
                }
            },
        };

        session.append_history(Role::User, text, now);
        session.touch(now);

        let mut messages = Vec::new();
        let (end, steps) = self.walk(&flow, &mut session, text, &mut messages, now).await;

        let reply = match end {
            WalkEnd::Awaiting => {
                let current = session.current_node.clone();
                self.sessions.save(session).await;
                TurnReply {
                    messages,
                    awaiting_input: true,
                    flow_id: Some(flow.id.clone()),
                    current_node: Some(current),
                    outcome: TurnOutcome::Awaiting,
                }
            }
            WalkEnd::Completed => {
                self.sessions.delete(tenant_id, contact_id).await;
                info!("✅ `{}:{}` completed flow `{}`", tenant_id, contact_id, flow.id);
                TurnReply {
                    messages,
                    awaiting_input: false,
                    flow_id: Some(flow.id.clone()),
                    current_node: None,
                    outcome: TurnOutcome::Completed,
                }
            }
            WalkEnd::Failed(reason) => {
                self.sessions.delete(tenant_id, contact_id).await;
                messages.push(
                    flow.settings
                        .fallback_message
                        .clone()
                        .unwrap_or_else(|| self.settings.fallback_message.clone()),
                );
                if let Some(contact) = flow
                    .settings
                    .human_contact
                    .clone()
                    .or_else(|| self.settings.human_contact.clone())
                {
                    messages.push(contact);
                }
                TurnReply {
                    messages,
                    awaiting_input: false,
                    flow_id: Some(flow.id.clone()),
                    current_node: None,
                    outcome: TurnOutcome::Failed { reason },
                }
            }
        };
        self.report(tenant_id, contact_id, steps, started, reply)
    }

    /// Run nodes from the session's current one until a node waits for input,
    /// the flow completes, or something breaks. Only the node the session was
    /// paused on sees `text`.
    async fn walk(
        &self,
        flow: &Flow,
        session: &mut Session,
        text: &str,
        messages: &mut Vec<String>,
        now: DateTime<Utc>,
    ) -> (WalkEnd, usize) {
        let mut inbound = session.awaiting_input.then_some(text);
        let mut steps = 0;

        loop {
            if steps >= self.settings.max_steps {
                let err = ConfigurationError::StepLimit(self.settings.max_steps);
                error!("🛑 flow `{}` at `{}`: {}", flow.key(), session.current_node, err);
                return (WalkEnd::Failed(err.to_string()), steps);
            }
            steps += 1;

            let Some(node) = flow.node(&session.current_node) else {
                let err = ConfigurationError::UnknownNode(session.current_node.clone());
                error!("🛑 flow `{}`: {}", flow.key(), err);
                return (WalkEnd::Failed(err.to_string()), steps);
            };

            let result = {
                let ctx = NodeContext {
                    session: &*session,
                    flow,
                    inbound: inbound.take(),
                    scope: session.scope(&flow.variables),
                    invokers: &self.invokers,
                    settings: &self.settings,
                };
                self.executors.execute(node, &ctx).await
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(err) => {
                    match &err {
                        NodeError::Configuration(_) => {
                            error!("🛑 flow `{}` at `{}`: {}", flow.key(), node.id, err)
                        }
                        _ => warn!("🛑 flow `{}` at `{}`: {}", flow.key(), node.id, err),
                    }
                    return (WalkEnd::Failed(err.to_string()), steps);
                }
            };
            trace!("👣 `{}` -> {:?} (awaiting: {})", node.id, outcome.next, outcome.awaiting_input);

            let NodeOutcome {
                outputs,
                exports,
                messages: said,
                next,
                awaiting_input,
                attempts,
            } = outcome;
            if !outputs.is_empty() {
                session.merge_step_output(&node.id, outputs, &exports);
            }
            session.set_attempts(&node.id, attempts);
            for message in said {
                session.append_history(Role::Assistant, message.clone(), now);
                messages.push(message);
            }

            let target = match next {
                Next::Stay => {
                    session.awaiting_input = true;
                    return (WalkEnd::Awaiting, steps);
                }
                Next::End => None,
                Next::Node(target) => Some(target),
                Next::FollowEdges => {
                    let scope = session.scope(&flow.variables);
                    select_edge(&node.edges, &scope).map(|edge| edge.target.clone())
                }
            };
            let Some(target) = target else {
                return (WalkEnd::Completed, steps);
            };
            if flow.node(&target).is_none() {
                let err = ConfigurationError::UnknownNode(target);
                error!("🛑 flow `{}` at `{}`: {}", flow.key(), node.id, err);
                return (WalkEnd::Failed(err.to_string()), steps);
            }

            session.current_node = target;
            session.awaiting_input = awaiting_input;
            if awaiting_input {
                return (WalkEnd::Awaiting, steps);
            }
        }
    }

    fn is_abandon(&self, flow: &Flow, text: &str) -> bool {
        if !flow.settings.allow_abandon {
            return false;
        }
        let said = normalize(text);
        let keywords = flow
            .settings
            .abandon_keywords
            .as_ref()
            .unwrap_or(&self.settings.abandon_keywords);
        keywords.iter().any(|k| normalize(k) == said)
    }

    fn report(
        &self,
        tenant_id: &str,
        contact_id: &str,
        steps: usize,
        started: Instant,
        reply: TurnReply,
    ) -> TurnReply {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
        info!(
            target: "turn",
            tenant = tenant_id,
            contact = contact_id,
            flow = reply.flow_id.as_deref().unwrap_or(""),
            steps,
            outcome = reply.outcome.as_str(),
            elapsed_ms,
            "turn handled"
        );
        reply
    }
}
