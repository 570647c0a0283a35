//! User configuration management
//!
//! Configuration is stored in TOML format at `~/.mclauncher/config.toml`.
//! Every field has a default, so a missing file (or a partial one) is valid.
//!
//! # Examples
//!
//! ```no_run
//! use mclauncher::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::load()?;
//! println!("Versions are installed into {}", config.paths.versions_dir.display());
//!
//! config.download.delete_package_after_install = false;
//! config.save()?;
//! # Ok(())
//! # }
//! ```

use crate::protocol::{UrlPolicy, SECURED_ENDPOINT};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the configuration directory
pub const CONFIG_DIR_ENV: &str = "MCLAUNCHER_CONFIG_DIR";

/// Environment variable carrying a pre-fetched user ticket
pub const TICKET_ENV: &str = "MCLAUNCHER_TICKET";

/// User configuration file (`~/.mclauncher/config.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where versions, downloads and temporary state live
    #[serde(default)]
    pub paths: PathsConfig,

    /// Update-service protocol settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Download behaviour
    #[serde(default)]
    pub download: DownloadConfig,

    /// User authorization
    #[serde(default)]
    pub auth: AuthConfig,

    /// Encrypted container installs
    #[serde(default)]
    pub container: ContainerConfig,

    /// Saved data locations
    #[serde(default)]
    pub data: DataConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Managed install directories for downloaded versions
    #[serde(default = "default_versions_dir")]
    pub versions_dir: PathBuf,

    /// Install directories for imported packages
    #[serde(default = "default_imported_dir")]
    pub imported_dir: PathBuf,

    /// Where downloaded package files are written
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,

    /// Fixed temporary location that holds saved data while a package is removed
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Scratch directory for decrypted executables
    #[serde(default = "default_decrypt_staging_dir")]
    pub decrypt_staging_dir: PathBuf,
}

fn launcher_home() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mclauncher")
}

fn default_versions_dir() -> PathBuf {
    launcher_home().join("versions")
}

fn default_imported_dir() -> PathBuf {
    launcher_home().join("imported_versions")
}

fn default_downloads_dir() -> PathBuf {
    launcher_home().join("downloads")
}

fn default_backup_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("TmpMinecraftLocalState")
}

fn default_decrypt_staging_dir() -> PathBuf {
    std::env::temp_dir().join("mclauncher-decrypt")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            versions_dir: default_versions_dir(),
            imported_dir: default_imported_dir(),
            downloads_dir: default_downloads_dir(),
            backup_dir: default_backup_dir(),
            decrypt_staging_dir: default_decrypt_staging_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Client web-service endpoint that resolves update identities
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Which returned URLs are acceptable download locations
    #[serde(default)]
    pub url_policy: UrlPolicy,

    /// Revision number sent alongside every update identity
    #[serde(default = "default_revision")]
    pub revision: String,
}

fn default_endpoint() -> String {
    SECURED_ENDPOINT.to_string()
}

fn default_revision() -> String {
    "1".to_string()
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            url_policy: UrlPolicy::default(),
            revision: default_revision(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Delete the downloaded package once it has been installed
    #[serde(default = "default_true")]
    pub delete_package_after_install: bool,

    /// Overall request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            delete_package_after_install: true,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Native helper that prints a user ticket on stdout
    #[serde(default = "default_token_helper")]
    pub token_helper: PathBuf,

    /// Static ticket, used instead of the helper when set
    #[serde(default)]
    pub ticket: Option<String>,
}

fn default_token_helper() -> PathBuf {
    PathBuf::from("WUTokenHelper.exe")
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_helper: default_token_helper(),
            ticket: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Try staging in bootstrapper mode first, then retry once without it
    #[serde(default = "default_true")]
    pub bootstrapper: bool,

    /// How long to wait for the decrypt helper to produce the executable
    #[serde(default = "default_helper_timeout_secs")]
    pub helper_timeout_secs: u64,

    /// Interval between checks for the decrypted executable
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Protected executable inside the container package
    #[serde(default = "default_executable_name")]
    pub executable_name: String,

    /// Application id the decrypt helper runs as
    #[serde(default = "default_app_id")]
    pub app_id: String,
}

fn default_helper_timeout_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_executable_name() -> String {
    "Minecraft.Windows.exe".to_string()
}

fn default_app_id() -> String {
    "Game".to_string()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            bootstrapper: true,
            helper_timeout_secs: default_helper_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            executable_name: default_executable_name(),
            app_id: default_app_id(),
        }
    }
}

impl ContainerConfig {
    pub fn helper_timeout(&self) -> Duration {
        Duration::from_secs(self.helper_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Parent of the per-account save directories used by the container format
    #[serde(default = "default_container_data_root")]
    pub container_data_root: PathBuf,

    /// Root of the archive format's per-family application data
    #[serde(default = "default_packages_root")]
    pub packages_root: PathBuf,

    /// Subdirectory of `com.mojang` holding one directory per world
    #[serde(default = "default_worlds_dir")]
    pub worlds_dir: String,

    /// File that tells the container build its data was already migrated,
    /// relative to `container_data_root`
    #[serde(default = "default_migration_marker")]
    pub migration_marker: PathBuf,
}

fn default_container_data_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("Minecraft Bedrock")
        .join("Users")
}

fn default_packages_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("Packages")
}

fn default_worlds_dir() -> String {
    "minecraftWorlds".to_string()
}

fn default_migration_marker() -> PathBuf {
    PathBuf::from("Shared")
        .join("games")
        .join("com.mojang")
        .join("uwp_migration_complete")
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            container_data_root: default_container_data_root(),
            packages_root: default_packages_root(),
            worlds_dir: default_worlds_dir(),
            migration_marker: default_migration_marker(),
        }
    }
}

impl Config {
    /// Get the default config file path
    ///
    /// Uses MCLAUNCHER_CONFIG_DIR if set, otherwise ~/.mclauncher/config.toml
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(config_dir) = std::env::var(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(config_dir).join("config.toml"));
        }

        let home = dirs::home_dir()
            .ok_or_else(|| Error::Other("Could not find home directory".to_string()))?;

        Ok(home.join(".mclauncher").join("config.toml"))
    }

    /// Load config from file, or use defaults if it doesn't exist
    ///
    /// Environment variable overrides:
    /// - `MCLAUNCHER_TICKET`: Overrides `auth.ticket`
    /// - `MCLAUNCHER_CONFIG_DIR`: Overrides the config directory location
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;

        let mut config = if !path.exists() {
            Self::default()
        } else {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        };

        if let Ok(ticket) = std::env::var(TICKET_ENV) {
            if !ticket.is_empty() {
                config.auth.ticket = Some(ticket);
            }
        }

        Ok(config)
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }

    /// Set a single value by its dotted key (e.g. `download.timeout_secs`)
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "paths.versions_dir" => self.paths.versions_dir = PathBuf::from(value),
            "paths.imported_dir" => self.paths.imported_dir = PathBuf::from(value),
            "paths.downloads_dir" => self.paths.downloads_dir = PathBuf::from(value),
            "paths.backup_dir" => self.paths.backup_dir = PathBuf::from(value),
            "paths.decrypt_staging_dir" => self.paths.decrypt_staging_dir = PathBuf::from(value),
            "protocol.endpoint" => self.protocol.endpoint = value.to_string(),
            "protocol.revision" => self.protocol.revision = value.to_string(),
            "protocol.url_policy" => {
                self.protocol.url_policy = if value == "any-http" {
                    UrlPolicy::AnyHttp
                } else {
                    UrlPolicy::HostPrefix {
                        prefix: value.to_string(),
                    }
                }
            }
            "download.delete_package_after_install" => {
                self.download.delete_package_after_install = parse_bool(value)?
            }
            "download.timeout_secs" => self.download.timeout_secs = parse_number(value)?,
            "auth.token_helper" => self.auth.token_helper = PathBuf::from(value),
            "auth.ticket" => {
                self.auth.ticket = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "container.bootstrapper" => self.container.bootstrapper = parse_bool(value)?,
            "container.helper_timeout_secs" => {
                self.container.helper_timeout_secs = parse_number(value)?
            }
            "container.poll_interval_ms" => self.container.poll_interval_ms = parse_number(value)?,
            "container.executable_name" => self.container.executable_name = value.to_string(),
            "container.app_id" => self.container.app_id = value.to_string(),
            "data.container_data_root" => self.data.container_data_root = PathBuf::from(value),
            "data.packages_root" => self.data.packages_root = PathBuf::from(value),
            "data.worlds_dir" => self.data.worlds_dir = value.to_string(),
            "data.migration_marker" => self.data.migration_marker = PathBuf::from(value),
            _ => return Err(Error::Other(format!("Invalid configuration key: {}", key))),
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    value
        .parse::<bool>()
        .map_err(|_| Error::Other("Invalid boolean value. Use 'true' or 'false'".to_string()))
}

fn parse_number(value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::Other(format!("Invalid number: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.download.delete_package_after_install);
        assert_eq!(config.container.helper_timeout_secs, 30);
        assert_eq!(config.protocol.revision, "1");
        assert_eq!(config.protocol.url_policy, UrlPolicy::AnyHttp);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"[container]
helper_timeout_secs = 5

[protocol]
url_policy = { kind = "host-prefix", prefix = "http://tlu.dl.delivery.mp.microsoft.com/" }
"#,
        )
        .unwrap();

        assert_eq!(config.container.helper_timeout_secs, 5);
        assert_eq!(config.container.executable_name, "Minecraft.Windows.exe");
        assert_eq!(
            config.protocol.url_policy,
            UrlPolicy::HostPrefix {
                prefix: "http://tlu.dl.delivery.mp.microsoft.com/".to_string()
            }
        );
    }

    #[test]
    fn test_set_value() {
        let mut config = Config::default();

        config.set_value("download.timeout_secs", "60").unwrap();
        assert_eq!(config.download.timeout_secs, 60);

        config.set_value("auth.ticket", "abc").unwrap();
        assert_eq!(config.auth.ticket.as_deref(), Some("abc"));
        config.set_value("auth.ticket", "").unwrap();
        assert!(config.auth.ticket.is_none());

        assert!(config.set_value("container.bootstrapper", "maybe").is_err());
        assert!(config.set_value("nope.nope", "1").is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.paths.backup_dir, config.paths.backup_dir);
        assert_eq!(parsed.data.worlds_dir, config.data.worlds_dir);
    }
}
