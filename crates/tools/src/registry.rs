//! Built-in tool declarations exposed to the LLM.

use sp_domain::tool::{ToolCategory, ToolDefinition};

/// The built-in tool set. Construction is cheap; the core builds one at
/// startup and filters per thread binding.
pub struct BuiltinRegistry {
    defs: Vec<ToolDefinition>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        let mut defs = Vec::new();

        // ── Sandboxed execution ───────────────────────────────────────
        defs.push(ToolDefinition {
            name: "run_shell".into(),
            description: "Run a shell command inside the conversation's sandbox. \
                          State (files, installed packages) persists across calls."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "timeout_sec": { "type": "integer", "description": "Override the execution timeout" }
                },
                "required": ["command"]
            }),
            requires_confirmation: true,
            category: ToolCategory::Execution,
        });

        defs.push(ToolDefinition {
            name: "run_python".into(),
            description: "Execute Python code inside the conversation's sandbox.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "code": { "type": "string", "description": "Python source to execute" },
                    "timeout_sec": { "type": "integer", "description": "Override the execution timeout" }
                },
                "required": ["code"]
            }),
            requires_confirmation: true,
            category: ToolCategory::Execution,
        });

        defs.push(ToolDefinition {
            name: "write_file".into(),
            description: "Write a file inside the conversation's sandbox, creating parent \
                          directories as needed."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Destination path" },
                    "content": { "type": "string", "description": "File content" }
                },
                "required": ["path", "content"]
            }),
            requires_confirmation: true,
            category: ToolCategory::Execution,
        });

        // ── In-process, read-only ─────────────────────────────────────
        defs.push(ToolDefinition {
            name: "read_file".into(),
            description: "Read a file from the shared workspace.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "File path relative to the workspace" }
                },
                "required": ["path"]
            }),
            requires_confirmation: false,
            category: ToolCategory::FileSystem,
        });

        defs.push(ToolDefinition {
            name: "list_dir".into(),
            description: "List a workspace directory.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Directory path (default: workspace root)" },
                    "recursive": { "type": "boolean", "description": "Recurse into subdirectories" }
                }
            }),
            requires_confirmation: false,
            category: ToolCategory::FileSystem,
        });

        defs.push(ToolDefinition {
            name: "grep_files".into(),
            description: "Search workspace files for a regex pattern.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "pattern": { "type": "string", "description": "Regex to search for" },
                    "path": { "type": "string", "description": "Directory to search (default: workspace root)" },
                    "case_sensitive": { "type": "boolean", "description": "Match case (default true)" }
                },
                "required": ["pattern"]
            }),
            requires_confirmation: false,
            category: ToolCategory::FileSystem,
        });

        defs.push(ToolDefinition {
            name: "web_search".into(),
            description: "Search the web and return titles, URLs, and snippets.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "num_results": { "type": "integer", "description": "Max results (default 5)" }
                },
                "required": ["query"]
            }),
            requires_confirmation: false,
            category: ToolCategory::Search,
        });

        Self { defs }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Definitions filtered to an enabled-tools list. `None` = all.
    pub fn filtered(&self, enabled: Option<&[String]>) -> Vec<ToolDefinition> {
        match enabled {
            None => self.defs.clone(),
            Some(names) => self
                .defs
                .iter()
                .filter(|d| names.iter().any(|n| n == &d.name))
                .cloned()
                .collect(),
        }
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_expected_tools() {
        let reg = BuiltinRegistry::new();
        for name in [
            "run_shell",
            "run_python",
            "write_file",
            "read_file",
            "list_dir",
            "grep_files",
            "web_search",
        ] {
            assert!(reg.contains(name), "missing builtin {name}");
        }
        assert!(!reg.contains("rm_rf"));
    }

    #[test]
    fn execution_tools_default_to_confirmation() {
        let reg = BuiltinRegistry::new();
        assert!(reg.get("run_shell").unwrap().requires_confirmation);
        assert!(reg.get("write_file").unwrap().requires_confirmation);
        assert!(!reg.get("read_file").unwrap().requires_confirmation);
        assert!(!reg.get("web_search").unwrap().requires_confirmation);
    }

    #[test]
    fn filtered_respects_enabled_list() {
        let reg = BuiltinRegistry::new();
        let enabled = vec!["read_file".to_string(), "web_search".to_string()];
        let defs = reg.filtered(Some(&enabled));
        assert_eq!(defs.len(), 2);
        assert!(reg.filtered(None).len() > 2);
    }

    #[test]
    fn schemas_declare_required_fields() {
        let reg = BuiltinRegistry::new();
        let schema = &reg.get("run_shell").unwrap().parameters;
        assert_eq!(schema["required"][0], "command");
    }
}
