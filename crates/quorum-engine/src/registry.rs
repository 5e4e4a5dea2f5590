use std::collections::HashMap;
use std::sync::Arc;

use quorum_core::tools::{ToolDefinition, ToolInvocable};

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    invocable: Arc<dyn ToolInvocable>,
}

/// Name → invocable capability lookup. Tool schemas are opaque here; the
/// registry owns no execution policy.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: ToolDefinition, invocable: Arc<dyn ToolInvocable>) {
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool { definition, invocable },
        );
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn ToolInvocable>> {
        self.tools.get(name).map(|t| Arc::clone(&t.invocable))
    }

    /// Definitions for the given permitted names, preserving the requested
    /// order. Names with no registered tool are silently skipped.
    pub fn definitions_for(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| t.definition.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
