pub mod loader;
pub mod merge;
pub mod schema;
pub mod settings;

pub use loader::{load_config, nomad_home, resolve_path, save_config};
pub use merge::{merge_config, parse_update, validate, ConfigError};
pub use schema::{
    AgentModelSelections, BinaryDescriptor, ConfigFile, ConfigFileUpdate, ModelRef, Preferences,
    PreferencesUpdate, Theme,
};
pub use settings::{find_settings_path, load_settings, PortRange, ServerSettings};
