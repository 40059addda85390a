use serde::Deserialize;
use serde_json::Value;

/// Settings read from the client's `initializationOptions`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Search files on disk that are not open when finding references to a
    /// cross-file setup query.
    pub workspace_references: bool,
    /// Query language of the embedded query bodies.
    pub dialect: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workspace_references: true,
            dialect: "cypher".to_string(),
        }
    }
}

impl ServerConfig {
    /// Parse initialization options, falling back to defaults on error.
    pub fn from_init_options(options: Option<Value>) -> Self {
        let Some(value) = options else {
            return Self::default();
        };
        if value.is_null() {
            return Self::default();
        }
        match serde_json::from_value(value) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(error = %err, "invalid initializationOptions, using defaults");
                Self::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_options_use_defaults() {
        assert_eq!(ServerConfig::from_init_options(None), ServerConfig::default());
        assert_eq!(
            ServerConfig::from_init_options(Some(Value::Null)),
            ServerConfig::default()
        );
    }

    #[test]
    fn partial_options_keep_other_defaults() {
        let config =
            ServerConfig::from_init_options(Some(json!({ "workspaceReferences": false })));
        assert!(!config.workspace_references);
        assert_eq!(config.dialect, "cypher");
    }

    #[test]
    fn malformed_options_fall_back() {
        let config = ServerConfig::from_init_options(Some(json!({ "dialect": 42 })));
        assert_eq!(config, ServerConfig::default());
    }
}
