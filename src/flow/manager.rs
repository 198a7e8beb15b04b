use std::{fs, path::Path, sync::Arc};

use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::{
    error::FlowError,
    flow::{
        model::{Flow, TriggerMode},
        validate::{ValidationReport, validate},
    },
    util::{contains_word, extension_of, normalize},
};

/// Registry of active flows, keyed by `tenant/flow`.
#[derive(Debug, Default)]
pub struct FlowManager {
    flows: DashMap<String, Arc<Flow>>,
}

impl FlowManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Validate and activate a flow, replacing any earlier version whole.
    /// Turns already running keep the version they started with.
    pub fn register_flow(&self, flow: Flow) -> Result<ValidationReport, FlowError> {
        let flow = flow.build();
        let report = validate(&flow);
        if !report.is_valid() {
            return Err(FlowError::Invalid(report.errors));
        }
        for warning in &report.warnings {
            warn!("flow `{}`: {}", flow.key(), warning);
        }
        let key = flow.key();
        let version = flow.version;
        if let Some(previous) = self.flows.insert(key.clone(), Arc::new(flow)) {
            info!(
                "Replaced flow: {} (v{} -> v{})",
                key, previous.version, version
            );
        } else {
            info!("Registered flow: {} (v{})", key, version);
        }
        Ok(report)
    }

    pub fn get(&self, tenant_id: &str, flow_id: &str) -> Option<Arc<Flow>> {
        self.flows
            .get(&format!("{}/{}", tenant_id, flow_id))
            .map(|f| f.value().clone())
    }

    pub fn remove_flow(&self, tenant_id: &str, flow_id: &str) -> bool {
        let removed = self
            .flows
            .remove(&format!("{}/{}", tenant_id, flow_id))
            .is_some();
        if removed {
            info!("Removed flow: {}/{}", tenant_id, flow_id);
        }
        removed
    }

    pub fn flows_for(&self, tenant_id: &str) -> Vec<Arc<Flow>> {
        let mut flows: Vec<_> = self
            .flows
            .iter()
            .filter(|f| f.tenant_id == tenant_id)
            .map(|f| f.value().clone())
            .collect();
        flows.sort_by(|a, b| a.id.cmp(&b.id));
        flows
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Pick the flow for a contact without a session. Active flows whose
    /// trigger matches compete on priority; ties go to the lowest flow id.
    pub fn select_flow(&self, tenant_id: &str, text: &str) -> Option<Arc<Flow>> {
        let text = normalize(text);
        self.flows_for(tenant_id)
            .into_iter()
            .filter(|flow| flow.active && trigger_matches(flow, &text))
            .fold(None, |best: Option<Arc<Flow>>, flow| match best {
                Some(b) if b.triggers.priority >= flow.triggers.priority => Some(b),
                _ => Some(flow),
            })
    }

    pub fn load_flow_from_file(path: &Path) -> Result<Flow, FlowError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FlowError::IoError(format!("read error: {}", e)))?;
        match extension_of(path).as_str() {
            "jgtc" | "json" => Flow::from_json(&contents),
            "ygtc" | "yaml" | "yml" => Flow::from_yaml(&contents),
            other => Err(FlowError::SerializationError(format!(
                "unsupported extension “{}” (expected .jgtc, .json, .ygtc or .yaml)",
                other
            ))),
        }
    }

    pub fn save_flow_to_file(path: &Path, flow: &Flow) -> Result<(), FlowError> {
        let contents = match extension_of(path).as_str() {
            "jgtc" | "json" => serde_json::to_string_pretty(flow)
                .map_err(|e| FlowError::SerializationError(e.to_string()))?,
            "ygtc" | "yaml" | "yml" => serde_yaml_bw::to_string(flow)
                .map_err(|e| FlowError::SerializationError(e.to_string()))?,
            other => {
                return Err(FlowError::SerializationError(format!(
                    "unsupported extension “{}” (expected .jgtc, .json, .ygtc or .yaml)",
                    other
                )));
            }
        };
        fs::write(path, contents).map_err(|e| FlowError::IoError(e.to_string()))
    }

    /// Load and register every flow file in `dir`. Files that fail to parse or
    /// validate are logged and skipped. Returns how many flows were activated.
    pub fn load_all_flows_from_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    extension_of(p).as_str(),
                    "jgtc" | "json" | "ygtc" | "yaml" | "yml"
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let result =
                Self::load_flow_from_file(&path).and_then(|flow| self.register_flow(flow));
            match result {
                Ok(_) => loaded += 1,
                Err(e) => error!("Failed to load {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }

    pub fn shutdown_all(&self) {
        let count = self.flows.len();
        self.flows.clear();
        info!("Unloaded {} flows", count);
    }
}

fn trigger_matches(flow: &Flow, normalized: &str) -> bool {
    match flow.triggers.mode {
        TriggerMode::Always => true,
        TriggerMode::Keyword => flow.triggers.keywords.iter().any(|k| {
            let k = normalize(k);
            !k.is_empty() && (normalized == k || contains_word(normalized, &k))
        }),
    }
}
