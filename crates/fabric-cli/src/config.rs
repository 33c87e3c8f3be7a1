//! Configuration file management for fabric.
//!
//! Provides a TOML-based config file at `~/.config/fabric/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fabric_core::config::{
    DeviceInfoConfig, ExecutorConfig, HardwareControlConfig, HardwareOpConfig, OsBootConfig,
    WorkflowManagerConfig,
};
use fabric_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(flatten)]
    pub executor: ExecutorConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the fabric config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/fabric` or `~/.config/fabric`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fabric");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fabric")
}

/// Return the path to the fabric config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

/// Load and parse a config file at an explicit path.
pub fn load_config_from(path: &std::path::Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    config
        .executor
        .validate()
        .map_err(|err| anyhow::anyhow!("[{}] invalid configuration: {err}", err.code()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Build the config template written by `fabric init`.
pub fn default_config(db_url: &str) -> ConfigFile {
    ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
        },
        executor: ExecutorConfig {
            hardware_control: HardwareControlConfig {
                host: "localhost".into(),
                port: 8000,
                uri: "cdim/api/v1".into(),
                poweron: HardwareOpConfig::default(),
                poweroff: HardwareOpConfig::default(),
                connect: HardwareOpConfig::default(),
                disconnect: HardwareOpConfig::default(),
                isosboot: OsBootConfig::default(),
            },
            get_information: DeviceInfoConfig {
                host: "localhost".into(),
                port: 8001,
                uri: "cdim/api/v1".into(),
                specs: Default::default(),
            },
            workflow_manager: WorkflowManagerConfig {
                host: "localhost".into(),
                port: 8002,
                uri: "cdim/api/v1".into(),
                timeout: 60,
                extended_procedure: Default::default(),
            },
            server_connection: Default::default(),
            max_workers: 32,
        },
    }
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Resolved runtime configuration for one command invocation.
pub struct FabricConfig {
    pub db_config: DbConfig,
    pub executor: ExecutorConfig,
}

impl FabricConfig {
    /// Resolve configuration: CLI flag > `FABRIC_DATABASE_URL` > config file.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config()?;

        let db_config = if let Some(url) = cli_db_url {
            DbConfig::new(url)
        } else if let Ok(url) = std::env::var("FABRIC_DATABASE_URL") {
            DbConfig::new(url)
        } else {
            DbConfig::new(&file.database.url)
        };

        Ok(Self {
            db_config,
            executor: file.executor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = default_config("postgresql://localhost:5432/fabric");
        let toml_str = toml::to_string_pretty(&config).expect("should serialize");
        let back: ConfigFile = toml::from_str(&toml_str).expect("should parse");
        assert_eq!(back.database.url, "postgresql://localhost:5432/fabric");
        assert_eq!(back.executor, config.executor);
    }

    #[test]
    fn load_config_from_validates_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = default_config("postgresql://localhost:5432/fabric");
        config.executor.max_workers = 500;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("E40001"), "got: {err}");
    }

    #[test]
    fn load_config_from_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
