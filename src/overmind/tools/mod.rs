//! Builtin tool catalogue.
//!
//! These are the tools every deployment ships with; tenant-specific suites
//! (GitHub, Jira, Linear, Notion, Slack, MCP servers) are plugins registered
//! at runtime via [`ToolRegistry::register`](crate::overmind::tool_protocol::ToolRegistry::register).

pub mod calculator;
pub mod clock;
pub mod http_client;

pub use calculator::CalculatorTool;
pub use clock::CurrentTimeTool;
pub use http_client::HttpRequestTool;

use crate::overmind::tool_protocol::Tool;
use std::sync::Arc;

/// The immutable builtin tool set, in registration order.
pub fn builtin_tools() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(CalculatorTool::new()),
        Arc::new(CurrentTimeTool),
        Arc::new(HttpRequestTool::new()),
    ]
}
