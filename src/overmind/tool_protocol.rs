//! Tool capability layer and two-tier registry.
//!
//! A [`Tool`] is anything an agent or workflow node can call: it has a name, a
//! description, a JSON Schema for its input, a synchronous [`run`](Tool::run)
//! and an asynchronous [`ainvoke`](Tool::ainvoke). The workflow engine calls
//! tools synchronously inside its executors; the agent runner goes through
//! [`ToolRegistry::ainvoke`], which routes sync-only tools onto the blocking
//! thread pool so the event loop stays responsive.
//!
//! # Registry tiers
//!
//! - **Builtins** — fixed at construction, immutable for the process lifetime.
//! - **Runtime tools** — registered later (MCP servers, per-tenant plugins);
//!   [`ToolRegistry::clear_runtime_tools`] removes them all without touching
//!   builtins, and is idempotent.
//!
//! # Allow-lists
//!
//! Agents restrict their tool set with ordered name patterns: an exact name
//! or a glob ending in `*`. [`ToolRegistry::filter_by_allowlist`] returns
//! matching tools ordered by pattern order, then registration order, with
//! duplicates removed. An empty/absent allowlist means "all tools".
//!
//! # Example
//!
//! ```rust,no_run
//! use overmind::overmind::tool_protocol::ToolRegistry;
//! use overmind::overmind::tools::builtin_tools;
//!
//! let registry = ToolRegistry::with_builtins(builtin_tools());
//! let names = registry.get_tool_names();
//! assert!(names.contains("calculator"));
//!
//! let filtered = registry.filter_by_allowlist(Some(&["http_*".to_string()]));
//! for tool in filtered {
//!     println!("allowed: {}", tool.name());
//! }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered.
    NotFound(String),
    /// Tool execution completed with an application-level failure.
    ExecutionFailed(String),
    /// The provided JSON arguments failed validation or deserialization.
    InvalidArguments(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::InvalidArguments(msg) => write!(f, "Invalid arguments: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Capability interface every tool implements.
///
/// Implementations must be stateless or internally synchronized: the same
/// instance is shared by every agent and workflow via `Arc<dyn Tool>`.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, e.g. `"calculator"` or `"http_request"`.
    fn name(&self) -> &str;

    /// One-line description surfaced to LLMs for tool selection.
    fn description(&self) -> &str;

    /// JSON Schema object describing accepted arguments.
    fn parameters_schema(&self) -> Value;

    /// Synchronous execution. The workflow engine's tool nodes call this
    /// directly; async contexts must go through [`ToolRegistry::ainvoke`]
    /// which offloads to the blocking pool.
    fn run(&self, args: Value) -> Result<Value, ToolError>;

    /// Whether [`ainvoke`](Tool::ainvoke) is natively asynchronous. Tools
    /// that only implement `run` leave this `false` and inherit the
    /// blocking-pool bridge.
    fn is_async(&self) -> bool {
        false
    }

    /// Asynchronous execution. Default delegates to [`run`](Tool::run)
    /// inline; override (and flip [`is_async`](Tool::is_async)) for tools
    /// that do their own async I/O.
    async fn ainvoke(&self, args: Value) -> Result<Value, ToolError> {
        self.run(args)
    }
}

/// Registry mapping tool names to executables.
///
/// Shared as `Arc<RwLock<ToolRegistry>>` by services that need runtime
/// mutation (MCP registration), or plain `Arc` when the set is static.
pub struct ToolRegistry {
    builtin: HashMap<String, Arc<dyn Tool>>,
    builtin_order: Vec<String>,
    runtime: HashMap<String, Arc<dyn Tool>>,
    runtime_order: Vec<String>,
}

impl ToolRegistry {
    /// Create a registry with no tools at all (mostly for tests).
    pub fn empty() -> Self {
        Self {
            builtin: HashMap::new(),
            builtin_order: Vec::new(),
            runtime: HashMap::new(),
            runtime_order: Vec::new(),
        }
    }

    /// Create a registry seeded with the immutable builtin catalogue.
    pub fn with_builtins(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut registry = Self::empty();
        for tool in tools {
            let name = tool.name().to_string();
            if registry.builtin.insert(name.clone(), tool).is_none() {
                registry.builtin_order.push(name);
            }
        }
        registry
    }

    /// Register a runtime tool (MCP or plugin). Re-registering a name
    /// replaces the executable but keeps its original position.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.builtin.contains_key(&name) {
            log::warn!("runtime tool {:?} shadows a builtin; ignoring", name);
            return;
        }
        if self.runtime.insert(name.clone(), tool).is_none() {
            self.runtime_order.push(name);
        }
    }

    /// Remove every runtime-registered tool. Builtins are untouched.
    /// Idempotent: calling twice has no observable effect beyond the first.
    pub fn clear_runtime_tools(&mut self) {
        self.runtime.clear();
        self.runtime_order.clear();
    }

    /// Look up a tool by name, builtins first.
    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.builtin
            .get(name)
            .or_else(|| self.runtime.get(name))
            .map(Arc::clone)
    }

    /// All registered tool names.
    pub fn get_tool_names(&self) -> BTreeSet<String> {
        self.builtin
            .keys()
            .chain(self.runtime.keys())
            .cloned()
            .collect()
    }

    /// Tools in registration order (builtins before runtime).
    pub fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        self.builtin_order
            .iter()
            .filter_map(|n| self.builtin.get(n))
            .chain(self.runtime_order.iter().filter_map(|n| self.runtime.get(n)))
            .map(Arc::clone)
            .collect()
    }

    /// Filter tools by an agent's allow-list.
    ///
    /// Each pattern is an exact name or a glob ending in `*`. Result order
    /// follows pattern order, then registration order; duplicates are
    /// removed. `None` or an empty slice yields every tool.
    pub fn filter_by_allowlist(&self, patterns: Option<&[String]>) -> Vec<Arc<dyn Tool>> {
        let all = self.list_tools();
        let patterns = match patterns {
            Some(p) if !p.is_empty() => p,
            _ => return all,
        };

        let mut seen = BTreeSet::new();
        let mut result = Vec::new();
        for pattern in patterns {
            for tool in &all {
                if pattern_matches(pattern, tool.name()) && seen.insert(tool.name().to_string()) {
                    result.push(Arc::clone(tool));
                }
            }
        }
        result
    }

    /// Execute a tool asynchronously. Async-native tools run inline on the
    /// event loop; sync-only tools are offloaded to the blocking pool.
    pub async fn ainvoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        ainvoke_tool(tool, args).await
    }

    /// Execute a tool synchronously (workflow engine path).
    pub fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.run(args)
    }
}

/// Run one tool asynchronously with the blocking-pool bridge for sync tools.
pub async fn ainvoke_tool(tool: Arc<dyn Tool>, args: Value) -> Result<Value, ToolError> {
    if tool.is_async() {
        tool.ainvoke(args).await
    } else {
        let handle = tokio::task::spawn_blocking(move || tool.run(args));
        handle
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("tool task panicked: {}", e)))?
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        pattern == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for StaticTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "static test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn run(&self, _args: Value) -> Result<Value, ToolError> {
            Ok(json!({"tool": self.name}))
        }
    }

    fn tool(name: &'static str) -> Arc<dyn Tool> {
        Arc::new(StaticTool { name })
    }

    fn registry() -> ToolRegistry {
        ToolRegistry::with_builtins(vec![
            tool("calculator"),
            tool("http_request"),
            tool("http_download"),
            tool("current_time"),
        ])
    }

    #[test]
    fn test_empty_allowlist_means_all_tools() {
        let registry = registry();
        assert_eq!(registry.filter_by_allowlist(None).len(), 4);
        assert_eq!(registry.filter_by_allowlist(Some(&[])).len(), 4);
    }

    #[test]
    fn test_allowlist_glob_and_ordering() {
        let registry = registry();
        let patterns = vec!["current_time".to_string(), "http_*".to_string()];
        let filtered = registry.filter_by_allowlist(Some(&patterns));
        let names: Vec<String> = filtered.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec!["current_time", "http_request", "http_download"]);
    }

    #[test]
    fn test_allowlist_deduplicates_overlapping_patterns() {
        let registry = registry();
        let patterns = vec!["http_request".to_string(), "http_*".to_string()];
        let filtered = registry.filter_by_allowlist(Some(&patterns));
        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered[0].name(), "http_request");
    }

    #[test]
    fn test_clear_runtime_tools_is_idempotent_and_spares_builtins() {
        let mut registry = registry();
        registry.register(tool("mcp_search"));
        assert!(registry.get_tool("mcp_search").is_some());

        registry.clear_runtime_tools();
        assert!(registry.get_tool("mcp_search").is_none());
        assert!(registry.get_tool("calculator").is_some());

        // Second call: no observable effect beyond the first.
        let before = registry.get_tool_names();
        registry.clear_runtime_tools();
        assert_eq!(registry.get_tool_names(), before);
    }

    #[test]
    fn test_runtime_tool_cannot_shadow_builtin() {
        let mut registry = registry();
        registry.register(tool("calculator"));
        // The builtin stays; there is still exactly one "calculator".
        assert_eq!(registry.get_tool_names().len(), 4);
    }

    #[tokio::test]
    async fn test_ainvoke_unknown_tool_is_not_found() {
        let registry = registry();
        match registry.ainvoke("nope", json!({})).await {
            Err(ToolError::NotFound(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_sync_tool_runs_through_blocking_bridge() {
        let registry = registry();
        let out = registry.ainvoke("calculator", json!({})).await.unwrap();
        assert_eq!(out["tool"], "calculator");
    }
}
