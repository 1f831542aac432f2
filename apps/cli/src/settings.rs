//! Layered CLI settings: defaults, then `keyshift.toml`, then `KEYSHIFT_*`
//! environment variables, then command-line flags

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use keyshift_rotation::{ConnectionDetails, ConnectionRef, EngineSettings, StaticConnectionResolver};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "keyshift.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Rotation configurations, as a JSON array
    pub state_file: PathBuf,

    /// Published secrets, as JSON keyed by scope
    pub secrets_file: PathBuf,

    pub engine: EngineSettings,

    /// Target systems by connection reference
    pub connections: BTreeMap<String, ConnectionDetails>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("keyshift-state.json"),
            secrets_file: PathBuf::from("keyshift-secrets.json"),
            engine: EngineSettings::default(),
            connections: BTreeMap::new(),
        }
    }
}

/// Values given on the command line; `None` leaves lower layers alone
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_file: Option<PathBuf>,
}

impl Settings {
    /// Load every layer; a missing config file is not an error
    pub fn load(config_file: &Path, overrides: &Overrides) -> Result<Self> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed("KEYSHIFT_").split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()
            .with_context(|| format!("invalid settings (config file {})", config_file.display()))
    }

    pub fn resolver(&self) -> StaticConnectionResolver {
        self.connections
            .iter()
            .map(|(name, details)| (ConnectionRef::new(name.as_str()), details.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_layers_apply_in_order() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "keyshift.toml",
                r#"
                    state_file = "from-file.json"

                    [engine]
                    call_timeout = "3s"

                    [connections.orders]
                    dialect = "postgres"
                    host = "db.internal"
                    port = 5432
                    database = "orders"
                    username = "rotator"
                    password = "admin-pw"
                "#,
            )?;
            jail.set_env("KEYSHIFT_ENGINE__CALL_TIMEOUT", "7s");

            let overrides = Overrides {
                secrets_file: Some(PathBuf::from("from-flag.json")),
                ..Overrides::default()
            };
            let settings = Settings::load(Path::new("keyshift.toml"), &overrides)
                .map_err(|e| e.to_string())?;

            assert_eq!(settings.state_file, PathBuf::from("from-file.json"));
            assert_eq!(settings.secrets_file, PathBuf::from("from-flag.json"));
            assert_eq!(settings.engine.call_timeout, Duration::from_secs(7));
            assert!(settings.connections["orders"].password.matches("admin-pw"));
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        figment::Jail::expect_with(|_| {
            let settings = Settings::load(Path::new("absent.toml"), &Overrides::default())
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.state_file, PathBuf::from("keyshift-state.json"));
            assert!(settings.connections.is_empty());
            Ok(())
        });
    }
}
