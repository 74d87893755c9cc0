// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use opal_model::ToolSchema;

use crate::Tool;

/// Central registry holding all tools available to a session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register a tool discovered on an external server.  The name is
    /// prefixed `<server>_<tool>` only when it would collide with an
    /// already-registered tool.
    pub fn register_external(&mut self, server: &str, tool: Arc<dyn Tool>) -> String {
        let base = tool.name().to_string();
        let name = if self.tools.contains_key(&base) {
            format!("{server}_{base}")
        } else {
            base
        };
        self.tools.insert(name.clone(), tool);
        name
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Schemas for all registered tools, sorted by name for stable wire output.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use crate::{ToolCall, ToolContext, ToolResult};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolResult {
            ToolResult::ok(&call.call_id, format!("echo:{}", call.arguments))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "zeta" });
        reg.register(EchoTool { name: "alpha" });
        let names: Vec<_> = reg.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn external_tool_without_collision_keeps_name() {
        let mut reg = ToolRegistry::new();
        let name = reg.register_external("srv", Arc::new(EchoTool { name: "fetch" }));
        assert_eq!(name, "fetch");
    }

    #[test]
    fn external_tool_with_collision_is_prefixed() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "fetch" });
        let name = reg.register_external("srv", Arc::new(EchoTool { name: "fetch" }));
        assert_eq!(name, "srv_fetch");
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_disabled_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.remove("echo"));
        assert!(!reg.remove("echo"));
        assert!(reg.is_empty());
    }
}
