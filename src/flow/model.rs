use std::{
    borrow::Cow,
    collections::{BTreeMap, HashMap},
    fmt,
};

use petgraph::{graph::NodeIndex, prelude::StableDiGraph};
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::FlowError;

fn yes() -> bool {
    true
}

fn default_attempts() -> u32 {
    3
}

fn default_version() -> u32 {
    1
}

fn default_confirmation_variable() -> String {
    "confirmed".to_string()
}

/// A directed, optionally guarded transition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Edge {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: None,
            label: None,
        }
    }

    pub fn when(target: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: Some(condition.into()),
            label: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Keyword,
    Always,
}

/// Criteria used to pick this flow for a contact without a session.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct Triggers {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub mode: TriggerMode,
}

/// Per-flow overrides of the engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FlowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_mins: Option<u64>,
    #[serde(default = "yes")]
    pub allow_abandon: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon_keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abandon_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_contact: Option<String>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            idle_timeout_mins: None,
            allow_abandon: true,
            abandon_keywords: None,
            abandon_message: None,
            fallback_message: None,
            human_contact: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyLocation {
    #[default]
    Header,
    Query,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiAuth {
    Bearer {
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
    },
    ApiKey {
        key: String,
        name: String,
        #[serde(default)]
        location: KeyLocation,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// An external REST back-end that action nodes call into.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ApiConfig {
    pub id: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ApiAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Closed set of node kinds; the executor table is keyed by this tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KindTag {
    Trigger,
    #[serde(alias = "menu")]
    Input,
    Confirmation,
    Message,
    Action,
    Router,
    Llm,
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KindTag::Trigger => "trigger",
            KindTag::Input => "input",
            KindTag::Confirmation => "confirmation",
            KindTag::Message => "message",
            KindTag::Action => "action",
            KindTag::Router => "router",
            KindTag::Llm => "llm",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnswerType {
    #[default]
    Text,
    Number,
    Email,
    Phone,
    Date,
}

/// Prompt + validated answer. With `options` it behaves as a menu: the reply may
/// be an option key (`"2"`) or its value (`"ingles"`), and the value is stored.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct InputConfig {
    pub variable: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub answer_type: AnswerType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default = "yes")]
    pub required: bool,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default = "yes")]
    pub global: bool,
}

impl InputConfig {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            options: BTreeMap::new(),
            answer_type: AnswerType::Text,
            pattern: None,
            min_length: None,
            max_length: None,
            required: true,
            max_attempts: default_attempts(),
            fallback: None,
            error_message: None,
            global: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_variable")]
    pub variable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_yes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_no: Option<String>,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default = "yes")]
    pub global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct MessageConfig {
    /// Stop the turn after sending; the next inbound message resumes at the successor.
    #[serde(default)]
    pub await_reply: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// How an action response maps into output variables.
///
/// Without `array_path`, every `fields` entry copies `response[source]` into
/// the output named by its key. With `array_path`, each element of that array is
/// projected through `fields` and the list is stored under `into` (plus
/// `<into>_count`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct ExtractSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub into: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ActionConfig {
    pub api: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extract: Option<ExtractSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default = "yes")]
    pub global: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
pub struct RouterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmRole {
    Conversational,
    Extractor,
    Classifier,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    Date,
    Any,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Any => "any",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default, rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
            description: None,
            examples: Vec::new(),
        }
    }
}

/// Static text injected verbatim into conversational prompts.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct KnowledgeSnippet {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LlmConfig {
    pub role: LlmRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    // conversational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub knowledge: Vec<KnowledgeSnippet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collect: Vec<FieldSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_token: Option<String>,
    // extractor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSpec>,
    // classifier
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_label: Option<String>,
    #[serde(default = "default_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<String>,
    #[serde(default = "yes")]
    pub global: bool,
}

impl LlmConfig {
    pub fn new(role: LlmRole) -> Self {
        Self {
            role,
            model: None,
            temperature: None,
            max_tokens: None,
            output: None,
            persona: None,
            knowledge: Vec::new(),
            collect: Vec::new(),
            completion_token: None,
            fields: Vec::new(),
            labels: Vec::new(),
            default_label: None,
            max_attempts: default_attempts(),
            reprompt: None,
            on_error: None,
            global: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger,
    Input(InputConfig),
    Confirmation(ConfirmationConfig),
    Message(MessageConfig),
    Action(ActionConfig),
    Router(RouterConfig),
    Llm(LlmConfig),
}

impl NodeKind {
    pub fn tag(&self) -> KindTag {
        match self {
            NodeKind::Trigger => KindTag::Trigger,
            NodeKind::Input(_) => KindTag::Input,
            NodeKind::Confirmation(_) => KindTag::Confirmation,
            NodeKind::Message(_) => KindTag::Message,
            NodeKind::Action(_) => KindTag::Action,
            NodeKind::Router(_) => KindTag::Router,
            NodeKind::Llm(_) => KindTag::Llm,
        }
    }

    /// Targets named in the config block rather than in `edges`.
    pub fn outcome_targets(&self) -> Vec<(&'static str, &str)> {
        let named: Vec<(&'static str, &Option<String>)> = match self {
            NodeKind::Input(cfg) => vec![("fallback", &cfg.fallback)],
            NodeKind::Confirmation(cfg) => vec![
                ("on_yes", &cfg.on_yes),
                ("on_no", &cfg.on_no),
                ("fallback", &cfg.fallback),
            ],
            NodeKind::Action(cfg) => vec![("on_success", &cfg.on_success), ("on_error", &cfg.on_error)],
            NodeKind::Router(cfg) => vec![("default", &cfg.default)],
            NodeKind::Llm(cfg) => vec![("on_error", &cfg.on_error)],
            NodeKind::Trigger | NodeKind::Message(_) => Vec::new(),
        };
        named
            .into_iter()
            .filter_map(|(name, target)| target.as_deref().map(|t| (name, t)))
            .collect()
    }
}

/// One step of a flow. Read-only during execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct NodeConfig {
    pub id: String,
    pub kind: NodeKind,
    pub template: Option<String>,
    pub edges: Vec<Edge>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            template: None,
            edges: Vec::new(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn tag(&self) -> KindTag {
        self.kind.tag()
    }
}

// persisted shape of a node: kind tag plus an untyped config block
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct RawNode {
    id: String,
    kind: KindTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    template: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    config: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<Edge>,
}

impl TryFrom<RawNode> for NodeConfig {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let config = if raw.config.is_null() { json!({}) } else { raw.config };
        let bad = |e: serde_json::Error| format!("node `{}` ({}): {}", raw.id, raw.kind, e);
        let kind = match raw.kind {
            KindTag::Trigger => NodeKind::Trigger,
            KindTag::Input => NodeKind::Input(serde_json::from_value(config).map_err(bad)?),
            KindTag::Confirmation => {
                NodeKind::Confirmation(serde_json::from_value(config).map_err(bad)?)
            }
            KindTag::Message => NodeKind::Message(serde_json::from_value(config).map_err(bad)?),
            KindTag::Action => NodeKind::Action(serde_json::from_value(config).map_err(bad)?),
            KindTag::Router => NodeKind::Router(serde_json::from_value(config).map_err(bad)?),
            KindTag::Llm => NodeKind::Llm(serde_json::from_value(config).map_err(bad)?),
        };
        Ok(NodeConfig {
            id: raw.id,
            kind,
            template: raw.template,
            edges: raw.edges,
        })
    }
}

impl From<NodeConfig> for RawNode {
    fn from(node: NodeConfig) -> Self {
        let tag = node.kind.tag();
        let config = match node.kind {
            NodeKind::Trigger => Value::Null,
            NodeKind::Input(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Confirmation(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Message(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Action(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Router(c) => serde_json::to_value(c).unwrap_or_default(),
            NodeKind::Llm(c) => serde_json::to_value(c).unwrap_or_default(),
        };
        RawNode {
            id: node.id,
            kind: tag,
            template: node.template,
            config,
            edges: node.edges,
        }
    }
}

impl JsonSchema for NodeConfig {
    fn schema_name() -> Cow<'static, str> {
        "NodeConfig".into()
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        RawNode::json_schema(generator)
    }
}

/// What a graph edge stands for: a declared edge, or a target named in config.
#[derive(Debug, Clone, PartialEq)]
pub enum Link {
    Edge,
    Outcome(&'static str),
}

/// A tenant's conversation graph. Immutable once registered; replaced whole.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Flow {
    pub tenant_id: String,
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "yes")]
    pub active: bool,
    pub entry_node: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub triggers: Triggers,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apis: Vec<ApiConfig>,
    #[serde(default)]
    pub settings: FlowSettings,
    pub nodes: Vec<NodeConfig>,

    #[serde(skip)]
    #[schemars(skip)]
    positions: HashMap<String, usize>,
    #[serde(skip)]
    #[schemars(skip)]
    graph: StableDiGraph<String, Link>,
    #[serde(skip)]
    #[schemars(skip)]
    index_of: HashMap<String, NodeIndex>,
}

impl PartialEq for Flow {
    fn eq(&self, other: &Self) -> bool {
        self.tenant_id == other.tenant_id
            && self.id == other.id
            && self.version == other.version
            && self.entry_node == other.entry_node
            && self.nodes == other.nodes
    }
}

impl Flow {
    pub fn new(
        tenant_id: impl Into<String>,
        id: impl Into<String>,
        name: impl Into<String>,
        entry_node: impl Into<String>,
    ) -> Self {
        Flow {
            tenant_id: tenant_id.into(),
            id: id.into(),
            name: name.into(),
            version: default_version(),
            active: true,
            entry_node: entry_node.into(),
            variables: BTreeMap::new(),
            triggers: Triggers::default(),
            apis: Vec::new(),
            settings: FlowSettings::default(),
            nodes: Vec::new(),
            positions: HashMap::new(),
            graph: StableDiGraph::new(),
            index_of: HashMap::new(),
        }
    }

    pub fn add_node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str], priority: i32) -> Self {
        self.triggers.keywords = keywords.iter().map(|k| k.to_string()).collect();
        self.triggers.priority = priority;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.apis.push(api);
        self
    }

    /// Registry key: `tenant/flow`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.tenant_id, self.id)
    }

    /// Index nodes and build the graph over declared edges and config targets.
    /// Targets that do not exist are left out; the validator reports them.
    pub fn build(mut self) -> Self {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::new();
        let mut positions = HashMap::new();

        for (pos, node) in self.nodes.iter().enumerate() {
            positions.entry(node.id.clone()).or_insert(pos);
            if !index_of.contains_key(&node.id) {
                let idx = graph.add_node(node.id.clone());
                index_of.insert(node.id.clone(), idx);
            }
        }

        for node in &self.nodes {
            let Some(&from) = index_of.get(&node.id) else { continue };
            for edge in &node.edges {
                if let Some(&to) = index_of.get(&edge.target) {
                    graph.add_edge(from, to, Link::Edge);
                }
            }
            for (name, target) in node.kind.outcome_targets() {
                if let Some(&to) = index_of.get(target) {
                    graph.add_edge(from, to, Link::Outcome(name));
                }
            }
        }

        self.positions = positions;
        self.graph = graph;
        self.index_of = index_of;
        self
    }

    pub fn node(&self, id: &str) -> Option<&NodeConfig> {
        match self.positions.get(id) {
            Some(&pos) => self.nodes.get(pos),
            None => self.nodes.iter().find(|n| n.id == id),
        }
    }

    pub fn api(&self, id: &str) -> Option<&ApiConfig> {
        self.apis.iter().find(|a| a.id == id)
    }

    pub fn graph(&self) -> &StableDiGraph<String, Link> {
        &self.graph
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index_of.get(id).copied()
    }

    pub fn from_json(contents: &str) -> Result<Flow, FlowError> {
        let flow: Flow = serde_json::from_str(contents)
            .map_err(|e| FlowError::SerializationError(format!("JSON parse error: {}", e)))?;
        Ok(flow.build())
    }

    pub fn from_yaml(contents: &str) -> Result<Flow, FlowError> {
        let flow: Flow = serde_yaml_bw::from_str(contents)
            .map_err(|e| FlowError::SerializationError(format!("YAML parse error: {}", e)))?;
        Ok(flow.build())
    }
}
