//! Read-only view over the tools supplied in an `AgentContext`.

use crate::provider::ToolDefinition;
use crate::types::AgentTool;
use std::sync::Arc;

/// Lookup by name plus stable iteration in supply order. Presentation order
/// to the model never changes between turns unless the caller changes the
/// context's tools.
pub struct ToolRegistry<'a> {
    tools: &'a [Arc<dyn AgentTool>],
}

impl<'a> ToolRegistry<'a> {
    pub fn new(tools: &'a [Arc<dyn AgentTool>]) -> Self {
        Self { tools }
    }

    pub fn by_name(&self, name: &str) -> Option<&'a Arc<dyn AgentTool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn all(&self) -> &'a [Arc<dyn AgentTool>] {
        self.tools
    }

    /// Schema-only definitions for the LLM request, in supply order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }
}
