use anyhow::{Result, bail};
use std::path::Path;
use tracing::info;

use crate::flow::{
    manager::FlowManager,
    validate::{ValidationReport, validate},
};

/// Parse a `.jgtc`/`.json` or `.ygtc`/`.yaml` flow document and lint it.
/// Warnings come back in the report; structural errors fail the call.
pub fn validate_flow_file(flow_file: &Path) -> Result<ValidationReport> {
    if !flow_file.exists() {
        bail!("File does not exist: {}", flow_file.display());
    }

    let flow = FlowManager::load_flow_from_file(flow_file)?;
    let report = validate(&flow);
    if !report.is_valid() {
        let listed: Vec<String> = report.errors.iter().map(|e| format!("  - {}", e)).collect();
        bail!(
            "Flow `{}` in {} is invalid:\n{}",
            flow.key(),
            flow_file.display(),
            listed.join("\n")
        );
    }
    info!("✅ Valid flow `{}`: {}", flow.key(), flow_file.display());
    Ok(report)
}
