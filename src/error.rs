use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A user reply that could not be accepted by an input or confirmation node.
/// Always recoverable: the node re-prompts until its attempt budget runs out.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("an answer is required")]
    Required,
    #[error("please choose one of: {}", .0.join(", "))]
    NotAnOption(Vec<String>),
    #[error("the answer does not have the expected format")]
    Pattern(String),
    #[error("the answer must have at least {0} characters")]
    TooShort(usize),
    #[error("the answer must have at most {0} characters")]
    TooLong(usize),
    #[error("please enter a number")]
    NotANumber,
    #[error("please enter a valid email address")]
    InvalidEmail,
    #[error("please enter a valid phone number")]
    InvalidPhone,
    #[error("please use the format YYYY-MM-DD or DD/MM/YYYY")]
    InvalidDate,
    #[error("please answer yes or no")]
    NotYesOrNo,
    #[error("internal validation error: {0}")]
    Internal(String),
}

/// Failure of a call to an external collaborator (REST back-end or language model),
/// reported after the invoker's retry policy is exhausted.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ExternalCallError {
    #[error("call to {target} timed out after {timeout_ms} ms ({attempts} attempts)")]
    Timeout {
        target: String,
        timeout_ms: u64,
        attempts: u32,
    },
    #[error("call to {target} returned status {status} ({attempts} attempts)")]
    Status {
        target: String,
        status: u16,
        body: String,
        attempts: u32,
    },
    #[error("call to {target} failed: {reason} ({attempts} attempts)")]
    Transport {
        target: String,
        reason: String,
        attempts: u32,
    },
    #[error("invalid response from {target}: {reason}")]
    InvalidResponse { target: String, reason: String },
    #[error("cannot build request for {target}: {reason}")]
    InvalidRequest { target: String, reason: String },
    #[error("invoker not configured: {0}")]
    NotConfigured(String),
}

impl ExternalCallError {
    pub fn attempts(&self) -> u32 {
        match self {
            ExternalCallError::Timeout { attempts, .. }
            | ExternalCallError::Status { attempts, .. }
            | ExternalCallError::Transport { attempts, .. } => *attempts,
            ExternalCallError::InvalidResponse { .. }
            | ExternalCallError::InvalidRequest { .. }
            | ExternalCallError::NotConfigured(_) => 1,
        }
    }
}

/// Output of an LLM role that does not match its declared shape.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("could not parse model output: {reason}")]
pub struct ExtractionParseError {
    pub reason: String,
    pub raw: String,
}

impl ExtractionParseError {
    pub fn new(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

/// Structural defects of a flow definition. Found by the offline validator;
/// when one slips through to turn time the flow is treated as broken.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ConfigurationError {
    #[error("flow `{0}` has no nodes")]
    Empty(String),
    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),
    #[error("entry node `{0}` does not exist")]
    MissingEntry(String),
    #[error("expected exactly one node without incoming edges, found {}: [{}]", .0.len(), .0.join(", "))]
    EntryCount(Vec<String>),
    #[error("entry node `{entry}` has incoming edges; the only root is `{root}`")]
    EntryNotRoot { entry: String, root: String },
    #[error("node `{from}` points at unknown node `{to}`")]
    DanglingEdge { from: String, to: String },
    #[error("node `{node}` ({kind}) has {count} outgoing edges; only routers may fan out")]
    OutDegree {
        node: String,
        kind: String,
        count: usize,
    },
    #[error("router `{0}` has neither a default nor any edges")]
    RouterWithoutRoutes(String),
    #[error("router `{0}` matched no edge and has no default")]
    RouterDeadEnd(String),
    #[error("node `{node}` has an invalid condition `{expr}`: {reason}")]
    BadCondition {
        node: String,
        expr: String,
        reason: String,
    },
    #[error("node `{node}` has an invalid pattern: {reason}")]
    BadPattern { node: String, reason: String },
    #[error("node `{node}` references unknown api `{api}`")]
    UnknownApi { node: String, api: String },
    #[error("api `{api}` has an invalid base url: {reason}")]
    BadBaseUrl { api: String, reason: String },
    #[error("node `{node}` is misconfigured: {reason}")]
    BadConfig { node: String, reason: String },
    #[error("flow `{flow}` idle timeout of {mins} minutes exceeds the {max} minute limit")]
    IdleTimeoutTooLong { flow: String, mins: u64, max: u64 },
    #[error("node `{0}` not found")]
    UnknownNode(String),
    #[error("turn exceeded {0} steps")]
    StepLimit(usize),
}

/// Raised when a session outlived its idle deadline. Never shown to the user:
/// the engine drops the session and restarts flow selection.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("session `{key}` expired at {expired_at}")]
pub struct SessionExpiredError {
    pub key: String,
    pub expired_at: chrono::DateTime<chrono::Utc>,
}

/// Errors escaping a node executor. Anything recoverable is handled inside the
/// executor; what remains here ends the turn with the fallback reply.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    External(#[from] ExternalCallError),
    #[error("attempts exhausted at node `{0}` with no fallback")]
    AttemptsExhausted(String),
}

#[derive(Debug, Clone)]
pub enum FlowError {
    IoError(String),
    SerializationError(String),
    Invalid(Vec<ConfigurationError>),
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowError::IoError(msg) => write!(f, "I/O error: {}", msg),
            FlowError::SerializationError(msg) => write!(f, "parse error: {}", msg),
            FlowError::Invalid(errors) => {
                let joined = errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(f, "invalid flow: {}", joined)
            }
        }
    }
}

impl std::error::Error for FlowError {}
