//! Current-time tool.

use crate::overmind::tool_protocol::{Tool, ToolError};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

/// Returns the current UTC time. Mostly useful for scheduled agents whose
/// instructions reference "now".
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Return the current date and time in UTC."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    fn run(&self, _args: Value) -> Result<Value, ToolError> {
        let now = Utc::now();
        Ok(json!({
            "iso": now.to_rfc3339(),
            "unix": now.timestamp(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_iso_and_unix() {
        let out = CurrentTimeTool.run(json!({})).unwrap();
        assert!(out["iso"].as_str().unwrap().contains('T'));
        assert!(out["unix"].as_i64().unwrap() > 0);
    }
}
