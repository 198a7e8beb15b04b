use std::{fs, path::Path};

use anyhow::Error;
use schemars::schema_for;

use crate::{
    flow::model::Flow,
    message::{InboundMessage, TurnReply},
};

/// Write the JSON schemas for flow documents and turn messages into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("flow.schema.json", serde_json::to_string_pretty(&schema_for!(Flow))?),
        (
            "inbound-message.schema.json",
            serde_json::to_string_pretty(&schema_for!(InboundMessage))?,
        ),
        (
            "turn-reply.schema.json",
            serde_json::to_string_pretty(&schema_for!(TurnReply))?,
        ),
    ];

    let mut written = Vec::new();
    for (name, json) in schemas {
        fs::write(out_dir.join(name), json)?;
        written.push(name.to_string());
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn flow_schema_describes_nodes() {
        let tmp = TempDir::new().unwrap();
        let written = write_schema(tmp.path()).unwrap();
        assert_eq!(written.len(), 3);

        let text = fs::read_to_string(tmp.path().join("flow.schema.json")).unwrap();
        let schema: Value = serde_json::from_str(&text).unwrap();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&Value::from("entry_node")));
        assert!(text.contains("NodeConfig"));
    }
}
