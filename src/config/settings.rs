/*
* HA VM Manager Configuration
* ---------------------------
* @project: ha-vm-manager
*
* Layered settings for the cluster VM manager. Every knob that decides how we
* talk to Pacemaker (binary paths, sudo, timeouts) or how patient we are with
* a live migration lives here.
*
* Configuration Hierarchy (from lowest to highest priority):
* -----------------------------------------------------
* 1. Hardcoded defaults (set_default below)
* 2. <CONFIG_PATH>/default.toml
* 3. <CONFIG_PATH>/local.toml (per-host overrides, never committed)
* 4. Environment variables: HAVM__MIGRATION__MAX_ATTEMPTS=30 and friends
*
* Sections:
* --------
* server:    where the JSON API listens
* cluster:   how the crm / crm_mon / vm-mgr tools are invoked
* migration: poll interval, attempt budget and the settlement policy
* logging:   default tracing filter (RUST_LOG still wins)
*
* Usage:
* -----
* ```rust,ignore
* let settings = Settings::new()?;
* let interval = settings.migration.poll_interval();
* ```
*/

use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::core::migration::SettlementPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub cluster: ClusterSettings,
    pub migration: MigrationSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub vm_mgr_bin: String,
    pub crm_bin: String,
    pub crm_mon_bin: String,
    /// Prefix every command with `sudo -n`.
    pub use_sudo: bool,
    pub command_timeout_secs: u64,
}

impl ClusterSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub settlement_policy: SettlementPolicy,
}

impl MigrationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_attempts: 15,
            settlement_policy: SettlementPolicy::RoleStarted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub filter: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH")
            .unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        Self::with_defaults()?
            .add_source(File::with_name(&format!("{}/default", config_path)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_path)).required(false))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    /// Loads a single explicit file on top of the defaults. Environment
    /// overrides still apply.
    pub fn new_from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        Self::with_defaults()?
            .add_source(File::from(path))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()
    }

    fn environment() -> Environment {
        Environment::with_prefix("HAVM")
            .separator("__")
            .try_parsing(true)
    }

    fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        let defaults = generate_default_config();
        Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", defaults.server.port as i64)?
            .set_default("server.api_prefix", defaults.server.api_prefix)?
            .set_default("cluster.vm_mgr_bin", defaults.cluster.vm_mgr_bin)?
            .set_default("cluster.crm_bin", defaults.cluster.crm_bin)?
            .set_default("cluster.crm_mon_bin", defaults.cluster.crm_mon_bin)?
            .set_default("cluster.use_sudo", defaults.cluster.use_sudo)?
            .set_default("cluster.command_timeout_secs", defaults.cluster.command_timeout_secs as i64)?
            .set_default("migration.poll_interval_ms", defaults.migration.poll_interval_ms as i64)?
            .set_default("migration.max_attempts", defaults.migration.max_attempts as i64)?
            .set_default("migration.settlement_policy", "role-started")?
            .set_default("logging.filter", defaults.logging.filter)
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
        },
        cluster: ClusterSettings {
            vm_mgr_bin: "vm-mgr".to_string(),
            crm_bin: "crm".to_string(),
            crm_mon_bin: "crm_mon".to_string(),
            use_sudo: false,
            command_timeout_secs: 30,
        },
        migration: MigrationSettings::default(),
        logging: LoggingSettings {
            filter: "info".to_string(),
        },
    }
}
