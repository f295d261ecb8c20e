use std::collections::HashSet;

use thiserror::Error;

use crate::schema::{AgentModelSelections, ConfigFile, ConfigFileUpdate};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Parse raw update input.
///
/// An object carrying both `recentFolders` and `opencodeBinaries` is treated as
/// a full document; anything else must match the partial-update shape.
pub fn parse_update(input: serde_json::Value) -> Result<ConfigFileUpdate, ConfigError> {
    let is_full = input
        .as_object()
        .is_some_and(|o| o.contains_key("recentFolders") && o.contains_key("opencodeBinaries"));

    if is_full {
        let full: ConfigFile = serde_json::from_value(input)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        validate(&full)?;
        return Ok(full.into());
    }

    if input.is_null() {
        return Ok(ConfigFileUpdate::default());
    }
    if !input.is_object() {
        return Err(ConfigError::Validation("expected a JSON object".into()));
    }
    serde_json::from_value(input).map_err(|e| ConfigError::Validation(e.to_string()))
}

/// Merge `update` over `current`.
///
/// Scalars and lists are replaced when present. `environmentVariables` merges
/// per key and `agentModelSelections` merges per instance, then per agent.
pub fn merge_config(current: &ConfigFile, update: ConfigFileUpdate) -> ConfigFile {
    let mut merged = current.clone();

    if let Some(prefs) = update.preferences {
        if let Some(theme) = prefs.theme {
            merged.preferences.theme = theme;
        }
        if let Some(env) = prefs.environment_variables {
            merged.preferences.environment_variables.extend(env);
        }
        if let Some(selections) = prefs.agent_model_selections {
            merged.preferences.agent_model_selections =
                merge_agent_selections(&current.preferences.agent_model_selections, selections);
        }
        if let Some(binary) = prefs.last_used_binary {
            merged.preferences.last_used_binary = Some(binary).filter(|b| !b.is_empty());
        }
    }

    if let Some(folders) = update.recent_folders {
        merged.recent_folders = folders;
    }
    if let Some(binaries) = update.opencode_binaries {
        merged.opencode_binaries = binaries;
    }

    merged
}

/// Instance keys in `update` extend that instance's agent map; other instances
/// are left untouched.
pub fn merge_agent_selections(
    base: &AgentModelSelections,
    update: AgentModelSelections,
) -> AgentModelSelections {
    let mut result = base.clone();
    for (instance_id, agents) in update {
        result.entry(instance_id).or_default().extend(agents);
    }
    result
}

/// Semantic checks the serde shape cannot express.
pub fn validate(config: &ConfigFile) -> Result<(), ConfigError> {
    for key in config.preferences.environment_variables.keys() {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(ConfigError::Validation(format!(
                "invalid environment variable name '{key}'"
            )));
        }
    }

    for (instance_id, agents) in &config.preferences.agent_model_selections {
        if instance_id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "agentModelSelections: empty instance id".into(),
            ));
        }
        for (agent, model) in agents {
            if agent.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "agentModelSelections.{instance_id}: empty agent name"
                )));
            }
            if model.provider_id.trim().is_empty() || model.model_id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "agentModelSelections.{instance_id}.{agent}: providerId and modelId are required"
                )));
            }
        }
    }

    if config.recent_folders.iter().any(|f| f.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "recentFolders: empty path".into(),
        ));
    }

    let mut seen = HashSet::new();
    for binary in &config.opencode_binaries {
        if binary.path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "opencodeBinaries: empty path".into(),
            ));
        }
        if !seen.insert(binary.path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "opencodeBinaries: duplicate path '{}'",
                binary.path
            )));
        }
    }

    Ok(())
}
