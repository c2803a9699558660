//! Configuration management for Conductor Service
//!
//! Loads settings from, in increasing priority:
//! 1. Built-in defaults
//! 2. JSON file named by `PORTAL_CONDUCTOR_CONFIG` (default `config.json`, optional)
//! 3. Environment variables `CONDUCTOR__<SECTION>__<KEY>`
//!
//! A `.env` file is read first so its values land in the environment.
//!
//! # Example
//!
//! ```no_run
//! use conductor_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     settings.validate()?;
//!     println!("listening on {}:{}", settings.server.host, settings.server.port);
//!     Ok(())
//! }
//! ```

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Environment variable naming the JSON settings file
pub const CONFIG_PATH_ENV: &str = "PORTAL_CONDUCTOR_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";
const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Missing required configuration fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub guard: GuardSettings,
    pub adapters: AdapterSettings,
    #[serde(alias = "ldap")]
    pub directory: DirectorySettings,
    pub datastore: DatastoreSettings,
    pub terrain: TerrainSettings,
    pub mailman: MailmanSettings,
    pub formation: FormationSettings,
}

impl Settings {
    /// Load settings using the file named by `PORTAL_CONDUCTOR_CONFIG`
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::build(&path, false)
    }

    /// Load settings from an explicit file, which must exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::build(path, true)
    }

    fn build(path: &Path, required: bool) -> Result<Self, ConfigError> {
        if path.exists() {
            info!(path = %path.display(), "Loading configuration file");
        }

        let settings = Config::builder()
            .add_source(
                File::from(path.to_path_buf())
                    .format(FileFormat::Json)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        Ok(settings)
    }

    /// Check every field the HTTP service and the CLI need
    ///
    /// All missing fields are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();

        let required = [
            ("directory.url", &self.directory.url),
            ("directory.bind_dn", &self.directory.bind_dn),
            ("directory.password", &self.directory.password),
            ("directory.base_dn", &self.directory.base_dn),
            ("directory.everyone_group", &self.directory.everyone_group),
            ("datastore.url", &self.datastore.url),
            ("terrain.url", &self.terrain.url),
            ("terrain.user", &self.terrain.user),
            ("terrain.password", &self.terrain.password),
        ];
        push_missing(&mut missing, &required);

        if self.mailman.enabled {
            push_missing(
                &mut missing,
                &[
                    ("mailman.url", &self.mailman.url),
                    ("mailman.password", &self.mailman.password),
                ],
            );
        }

        if !missing.is_empty() {
            return Err(ConfigError::MissingFields(missing));
        }

        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "server.request_timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.adapters.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "adapters.call_timeout_secs".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Check the batch-job system fields needed for async deletion
    pub fn validate_formation(&self) -> Result<(), ConfigError> {
        let f = &self.formation;
        let mut missing = Vec::new();
        push_missing(
            &mut missing,
            &[
                ("formation.url", &f.url),
                ("formation.keycloak_url", &f.keycloak_url),
                ("formation.realm", &f.realm),
                ("formation.client_id", &f.client_id),
                ("formation.client_secret", &f.client_secret),
                ("formation.system_id", &f.system_id),
                ("formation.username_parameter", &f.username_parameter),
            ],
        );

        let has_id = f.deletion_app_id.as_deref().is_some_and(|s| !s.trim().is_empty());
        let has_name = f
            .deletion_app_name
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());
        if !has_id && !has_name {
            missing.push("formation.deletion_app_id or formation.deletion_app_name".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingFields(missing))
        }
    }
}

fn push_missing(missing: &mut Vec<String>, fields: &[(&str, &String)]) {
    missing.extend(
        fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| name.to_string()),
    );
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Budget for a synchronous lifecycle request
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 300,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Identity guard contention behavior; `wait_ms == 0` fails fast
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// Deadline for each individual backend call
    pub call_timeout_secs: u64,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
        }
    }
}

impl AdapterSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

/// LDAP directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    pub url: String,
    #[serde(alias = "user")]
    pub bind_dn: String,
    pub password: String,
    pub base_dn: String,
    pub everyone_group: String,
    pub community_group: String,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            bind_dn: String::new(),
            password: String::new(),
            base_dn: String::new(),
            everyone_group: String::new(),
            community_group: "community".to_string(),
        }
    }
}

/// Data store HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatastoreSettings {
    pub url: String,
    /// Account granted `own` on every new home directory
    pub ipcservices_user: String,
    /// Administrative account granted `own` on every new home directory
    pub admin_user: String,
}

impl Default for DatastoreSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            ipcservices_user: "ipcservices".to_string(),
            admin_user: "rodsadmin".to_string(),
        }
    }
}

/// Job-limit service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub default_job_limit: u32,
}

impl Default for TerrainSettings {
    fn default() -> Self {
        Self {
            url: "http://terrain/".to_string(),
            user: String::new(),
            password: String::new(),
            default_job_limit: 2,
        }
    }
}

/// Mailing list settings; the backend is skipped when disabled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailmanSettings {
    pub enabled: bool,
    pub url: String,
    pub password: String,
}

/// Batch-job system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationSettings {
    pub url: String,
    pub keycloak_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub system_id: String,
    pub deletion_app_id: Option<String>,
    pub deletion_app_name: Option<String>,
    /// Submission config key that receives the username
    pub username_parameter: String,
    pub verify_tls: bool,
}

impl Default for FormationSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            keycloak_url: String::new(),
            realm: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            system_id: "de".to_string(),
            deletion_app_id: None,
            deletion_app_name: None,
            username_parameter: "username".to_string(),
            verify_tls: true,
        }
    }
}
