use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Configuration for one external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Namespace prefix for the server's tools.
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-call budget in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_defaults() {
        let cfg: ToolServerConfig = serde_json::from_str(
            r#"{ "id": "files", "command": "npx", "args": ["-y", "server-filesystem"] }"#,
        )
        .unwrap();
        assert_eq!(cfg.id, "files");
        assert_eq!(cfg.args.len(), 2);
        assert!(cfg.env.is_empty());
        assert_eq!(cfg.call_timeout_secs, 30);
    }
}
