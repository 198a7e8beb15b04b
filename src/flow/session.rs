use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::{
    sync::{Mutex, OwnedMutexGuard},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::{error::SessionExpiredError, flow::model::Flow};

/// Upper bound for idle timeouts, flow or engine wide: one year.
pub const MAX_IDLE_TIMEOUT_MINS: u64 = 365 * 24 * 60;

/// Minutes to a timeout, capped at [`MAX_IDLE_TIMEOUT_MINS`].
pub fn idle_minutes(mins: u64) -> Duration {
    Duration::from_secs(mins.min(MAX_IDLE_TIMEOUT_MINS) * 60)
}

fn deadline(now: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    TimeDelta::try_seconds(secs)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Store key of the session for a contact of a tenant.
pub fn session_key(tenant_id: &str, contact_id: &str) -> String {
    format!("{}:{}", tenant_id, contact_id)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Which namespace a variable lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarScope<'a> {
    Global,
    Step(&'a str),
}

/// Live execution state of one contact inside one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub tenant_id: String,
    pub contact_id: String,
    pub flow_id: String,
    pub entry_node: String,
    pub current_node: String,
    /// The session is parked on `current_node` waiting for the next inbound message.
    pub awaiting_input: bool,
    global: Map<String, Value>,
    steps: HashMap<String, Map<String, Value>>,
    last_step: Option<String>,
    history: VecDeque<HistoryEntry>,
    history_window: usize,
    attempts: HashMap<String, u32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub idle_deadline: DateTime<Utc>,
    idle_timeout_secs: i64,
}

impl Session {
    pub fn new(
        tenant_id: &str,
        contact_id: &str,
        flow: &Flow,
        history_window: usize,
        idle_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let idle_timeout_secs = i64::try_from(idle_timeout.as_secs()).unwrap_or(i64::MAX);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            contact_id: contact_id.to_string(),
            flow_id: flow.id.clone(),
            entry_node: flow.entry_node.clone(),
            current_node: flow.entry_node.clone(),
            awaiting_input: false,
            global: Map::new(),
            steps: HashMap::new(),
            last_step: None,
            history: VecDeque::new(),
            history_window: history_window.max(1),
            attempts: HashMap::new(),
            created_at: now,
            last_activity: now,
            idle_deadline: deadline(now, idle_timeout_secs),
            idle_timeout_secs,
        }
    }

    pub fn key(&self) -> String {
        session_key(&self.tenant_id, &self.contact_id)
    }

    pub fn get(&self, name: &str, scope: VarScope<'_>) -> Option<&Value> {
        match scope {
            VarScope::Global => self.global.get(name),
            VarScope::Step(node) => self.steps.get(node).and_then(|rec| rec.get(name)),
        }
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value, scope: VarScope<'_>) {
        match scope {
            VarScope::Global => {
                self.global.insert(name.into(), value);
            }
            VarScope::Step(node) => {
                self.steps
                    .entry(node.to_string())
                    .or_default()
                    .insert(name.into(), value);
            }
        }
    }

    /// Record a node's outputs as its step-local namespace. Keys listed in
    /// `exports` are also written to the global namespace, except nulls, which
    /// never overwrite an earlier global value.
    pub fn merge_step_output(&mut self, node_id: &str, record: Map<String, Value>, exports: &[String]) {
        for key in exports {
            if let Some(value) = record.get(key) {
                if !value.is_null() {
                    self.global.insert(key.clone(), value.clone());
                }
            }
        }
        let entry = self.steps.entry(node_id.to_string()).or_default();
        for (k, v) in record {
            entry.insert(k, v);
        }
        self.last_step = Some(node_id.to_string());
    }

    /// Append to the conversation history, dropping the oldest entries beyond the window.
    pub fn append_history(&mut self, role: Role, text: impl Into<String>, now: DateTime<Utc>) {
        self.history.push_back(HistoryEntry {
            role,
            text: text.into(),
            at: now,
        });
        while self.history.len() > self.history_window {
            self.history.pop_front();
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.history
            .iter()
            .rev()
            .find(|h| h.role == Role::User)
            .map(|h| h.text.as_str())
    }

    /// Back to the entry node with empty namespaces and history.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.current_node = self.entry_node.clone();
        self.awaiting_input = false;
        self.global.clear();
        self.steps.clear();
        self.last_step = None;
        self.history.clear();
        self.attempts.clear();
        self.touch(now);
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
        self.idle_deadline = deadline(now, self.idle_timeout_secs);
    }

    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        now >= self.idle_deadline
    }

    pub fn expire_if_idle(&self, now: DateTime<Utc>) -> Result<(), SessionExpiredError> {
        if self.is_idle(now) {
            Err(SessionExpiredError {
                key: self.key(),
                expired_at: self.idle_deadline,
            })
        } else {
            Ok(())
        }
    }

    pub fn attempts(&self, node_id: &str) -> u32 {
        self.attempts.get(node_id).copied().unwrap_or(0)
    }

    pub fn set_attempts(&mut self, node_id: &str, attempts: Option<u32>) {
        match attempts {
            Some(n) => {
                self.attempts.insert(node_id.to_string(), n);
            }
            None => {
                self.attempts.remove(node_id);
            }
        }
    }

    /// Variables visible to templates and guards. Unqualified names resolve to
    /// the latest step output, then globals, then flow variables. `global.*`,
    /// `flow.*` and `<node_id>.*` qualify explicitly.
    pub fn scope(&self, flow_vars: &BTreeMap<String, Value>) -> Value {
        let mut root = Map::new();
        for (k, v) in flow_vars {
            root.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.global {
            root.insert(k.clone(), v.clone());
        }
        for (node, record) in &self.steps {
            root.entry(node.clone())
                .or_insert_with(|| Value::Object(record.clone()));
        }
        if let Some(record) = self.last_step.as_ref().and_then(|s| self.steps.get(s)) {
            for (k, v) in record.iter().filter(|(_, v)| !v.is_null()) {
                root.insert(k.clone(), v.clone());
            }
        }
        root.insert("global".into(), Value::Object(self.global.clone()));
        root.insert(
            "flow".into(),
            Value::Object(flow_vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );
        root.insert(
            "last_message".into(),
            self.last_user_message().map(Value::from).unwrap_or(Value::Null),
        );
        root.insert("contact".into(), Value::from(self.contact_id.clone()));
        root.insert("tenant".into(), Value::from(self.tenant_id.clone()));
        Value::Object(root)
    }
}

pub type SessionStore = Arc<dyn SessionStoreType>;

/// Persistence for sessions, keyed by `tenant:contact`.
#[async_trait]
pub trait SessionStoreType: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Option<Session>;
    async fn put(&self, session: Session);
    /// Removes and returns the session, if any.
    async fn remove(&self, key: &str) -> Option<Session>;
    async fn keys(&self) -> Vec<String>;
    /// Clears all sessions (typically for tests or shutdown).
    fn clear(&self);
}

#[derive(Clone, Debug)]
pub struct InMemorySessionStore {
    cache: Cache<String, Session>,
}

impl InMemorySessionStore {
    pub fn new(max_capacity: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_listener(|key: Arc<String>, _value: Session, cause| {
                trace!("Session evicted: key={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl SessionStoreType for InMemorySessionStore {
    async fn get(&self, key: &str) -> Option<Session> {
        self.cache.get(key).await
    }

    async fn put(&self, session: Session) {
        self.cache.insert(session.key(), session).await;
    }

    async fn remove(&self, key: &str) -> Option<Session> {
        self.cache.remove(key).await
    }

    async fn keys(&self) -> Vec<String> {
        self.cache.iter().map(|(k, _)| k.as_ref().clone()).collect()
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}

/// Session lifecycle plus per-contact turn serialization.
#[derive(Debug)]
pub struct SessionManager {
    store: SessionStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    history_window: usize,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(store: SessionStore, history_window: usize, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            locks: DashMap::new(),
            history_window,
            idle_timeout,
        })
    }

    /// Wait for exclusive access to a contact. Waiters are served in arrival order,
    /// so a second message for the same contact queues behind the running turn.
    pub async fn lock(&self, tenant_id: &str, contact_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(session_key(tenant_id, contact_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Fetch the live session. An idle one is deleted and reported as expired.
    pub async fn load(
        &self,
        tenant_id: &str,
        contact_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>, SessionExpiredError> {
        let key = session_key(tenant_id, contact_id);
        match self.store.get(&key).await {
            None => Ok(None),
            Some(session) => match session.expire_if_idle(now) {
                Ok(()) => Ok(Some(session)),
                Err(expired) => {
                    self.store.remove(&key).await;
                    Err(expired)
                }
            },
        }
    }

    /// Existing live session for the contact, or a fresh one at the flow's entry.
    pub async fn load_or_create(
        &self,
        tenant_id: &str,
        contact_id: &str,
        flow: &Flow,
        now: DateTime<Utc>,
    ) -> Session {
        if let Ok(Some(session)) = self.load(tenant_id, contact_id, now).await {
            if session.flow_id == flow.id {
                return session;
            }
        }
        let idle = flow
            .settings
            .idle_timeout_mins
            .map(idle_minutes)
            .unwrap_or(self.idle_timeout);
        let session = Session::new(tenant_id, contact_id, flow, self.history_window, idle, now);
        info!(
            "👣 new session {} for `{}` in flow `{}`",
            session.id,
            session.key(),
            flow.id
        );
        session
    }

    pub async fn save(&self, session: Session) {
        self.store.put(session).await;
    }

    pub async fn delete(&self, tenant_id: &str, contact_id: &str) -> bool {
        self.store
            .remove(&session_key(tenant_id, contact_id))
            .await
            .is_some()
    }

    /// Delete every idle session whose contact has no turn in flight.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for key in self.store.keys().await {
            let mutex = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let Ok(_guard) = mutex.try_lock_owned() else {
                continue;
            };
            if let Some(session) = self.store.get(&key).await {
                if session.is_idle(now) {
                    self.store.remove(&key).await;
                    removed += 1;
                    info!("Session expired: key={}, flow={}", key, session.flow_id);
                }
            }
        }
        self.locks
            .retain(|_, m| Arc::strong_count(m) > 1 || m.try_lock().is_err());
        removed
    }

    pub fn spawn_idle_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("idle sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = me.sweep_idle(Utc::now()).await;
                        if removed > 0 {
                            info!("idle sweep removed {} sessions", removed);
                        }
                    }
                }
            }
        })
    }

    pub fn store(&self) -> SessionStore {
        self.store.clone()
    }
}
