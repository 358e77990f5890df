// src/lib.rs

// Import the top-level `overmind` module.
pub mod overmind;

// Re-exporting key items for easier external access.
pub use overmind::client_wrapper::{ClientFactory, ClientWrapper, Message, Role};
pub use overmind::config::Config;
pub use overmind::event_bus::{EventBus, EventKind};
pub use overmind::store::Store;
pub use overmind::tool_protocol::{Tool, ToolRegistry};
