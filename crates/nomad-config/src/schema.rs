use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-instance, per-agent model choice: instance id -> agent name -> model.
pub type AgentModelSelections = BTreeMap<String, BTreeMap<String, ModelRef>>;

/// The user configuration document persisted at `~/.nomad/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub preferences: Preferences,
    /// Most recently opened folders, newest first.
    pub recent_folders: Vec<String>,
    pub opencode_binaries: Vec<BinaryDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub theme: Theme,
    /// Extra environment passed to every spawned agent server.
    pub environment_variables: BTreeMap<String, String>,
    pub agent_model_selections: AgentModelSelections,
    /// Path of the binary to prefer when launching new instances.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_binary: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// Reference to a provider + model combination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

/// A registered agent-server executable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDescriptor {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Milliseconds since epoch of the last launch using this binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<i64>,
}

impl BinaryDescriptor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            label: None,
            version: None,
            last_used: None,
        }
    }
}

/// Partial update of [`ConfigFile`]. Absent fields leave the current value alone.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<PreferencesUpdate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recent_folders: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opencode_binaries: Option<Vec<BinaryDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PreferencesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<Theme>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_variables: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_model_selections: Option<AgentModelSelections>,
    /// An empty string clears the preference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_binary: Option<String>,
}

impl From<ConfigFile> for ConfigFileUpdate {
    fn from(config: ConfigFile) -> Self {
        let prefs = config.preferences;
        Self {
            preferences: Some(PreferencesUpdate {
                theme: Some(prefs.theme),
                environment_variables: Some(prefs.environment_variables),
                agent_model_selections: Some(prefs.agent_model_selections),
                last_used_binary: prefs.last_used_binary,
            }),
            recent_folders: Some(config.recent_folders),
            opencode_binaries: Some(config.opencode_binaries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_parses_to_defaults() {
        let cfg: ConfigFile = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg, ConfigFile::default());
        assert_eq!(cfg.preferences.theme, Theme::System);
    }

    #[test]
    fn document_uses_camel_case_keys() {
        let mut cfg = ConfigFile::default();
        cfg.recent_folders.push("/tmp/proj".into());
        cfg.opencode_binaries.push(BinaryDescriptor::new("/usr/bin/opencode"));
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"recentFolders\""));
        assert!(json.contains("\"opencodeBinaries\""));
        assert!(json.contains("\"environmentVariables\""));
        assert!(json.contains("\"agentModelSelections\""));
        assert!(!json.contains("lastUsedBinary"));
    }

    #[test]
    fn model_selections_parse() {
        let cfg: ConfigFile = serde_json::from_value(serde_json::json!({
            "preferences": {
                "agentModelSelections": {
                    "w1": { "build": { "providerId": "anthropic", "modelId": "claude" } }
                }
            }
        }))
        .unwrap();
        let model = &cfg.preferences.agent_model_selections["w1"]["build"];
        assert_eq!(model.provider_id, "anthropic");
        assert_eq!(model.model_id, "claude");
    }

    #[test]
    fn update_rejects_unknown_fields() {
        let result: Result<ConfigFileUpdate, _> =
            serde_json::from_value(serde_json::json!({ "recentFolderz": [] }));
        assert!(result.is_err());

        let result: Result<ConfigFileUpdate, _> =
            serde_json::from_value(serde_json::json!({ "preferences": { "colour": "red" } }));
        assert!(result.is_err());
    }

    #[test]
    fn theme_rejects_unknown_value() {
        let result: Result<ConfigFileUpdate, _> =
            serde_json::from_value(serde_json::json!({ "preferences": { "theme": "neon" } }));
        assert!(result.is_err());
    }
}
