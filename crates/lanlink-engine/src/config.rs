//! TOML-based engine configuration.
//!
//! Reads and writes `EngineConfig` to the platform-appropriate config file:
//! - Linux:    `~/.config/lanlink/config.toml`
//! - macOS:    `~/Library/Application Support/LanLink/config.toml`
//! - Windows:  `%APPDATA%\LanLink\config.toml`
//!
//! Every field carries a serde default so the engine works on first run,
//! before a config file exists, and keeps working when an older file is
//! missing newer fields. The identity key and the trust table live next to
//! the config file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level engine configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Commands exposed to peers through the run-command plugin.
    #[serde(default)]
    pub commands: Vec<CommandEntry>,
}

/// Identity of this device as shown to peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Display name advertised in discovery announcements.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Device kind: `"desktop"`, `"mobile"`, `"tablet"`, or `"tv"`.
    #[serde(default = "default_device_type")]
    pub device_type: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Network port and bind-address settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP port for LAN discovery broadcasts.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port for incoming link connections.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// IP address to bind all sockets to. `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Address discovery announcements are broadcast to.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
}

/// Protocol timing knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// Seconds between discovery broadcasts.
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,
    /// Silence timeout after which a non-connected device is evicted.
    #[serde(default = "default_device_timeout")]
    pub device_timeout_secs: u64,
    /// Seconds between eviction sweeps.
    #[serde(default = "default_eviction_sweep")]
    pub eviction_sweep_secs: u64,
    /// Deadline for the identity/upgrade handshake on a new connection.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

/// One command exposed through the run-command plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEntry {
    /// Stable key peers execute the command by.
    pub key: String,
    /// Human-readable name shown on the remote device.
    pub name: String,
    /// Shell command line to run.
    pub command: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    "lanlink-device".to_string()
}
fn default_device_type() -> String {
    "desktop".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_discovery_port() -> u16 {
    24820
}
fn default_control_port() -> u16 {
    24821
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_broadcast_interval() -> u64 {
    5
}
fn default_device_timeout() -> u64 {
    180
}
fn default_eviction_sweep() -> u64 {
    30
}
fn default_handshake_timeout() -> u64 {
    10
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            device_type: default_device_type(),
            log_level: default_log_level(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            control_port: default_control_port(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: default_broadcast_interval(),
            device_timeout_secs: default_device_timeout(),
            eviction_sweep_secs: default_eviction_sweep(),
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for engine state.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config
/// base directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

/// Resolves the path of the persisted identity secret key.
pub fn identity_key_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("identity.key"))
}

/// Resolves the path of the persisted trust table.
pub fn trust_table_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("trust.toml"))
}

/// Loads `EngineConfig` from disk, returning `EngineConfig::default()` if
/// the file does not yet exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than
/// "not found", and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config() -> Result<EngineConfig, ConfigError> {
    let path = config_file_path()?;

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let cfg: EngineConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Persists `config` to disk, creating the config directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(config: &EngineConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("LanLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("lanlink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("LanLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_expected_ports() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.network.discovery_port, 24820);
        assert_eq!(cfg.network.control_port, 24821);
    }

    #[test]
    fn test_default_config_has_expected_timing() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.timing.broadcast_interval_secs, 5);
        assert_eq!(cfg.timing.device_timeout_secs, 180);
        assert_eq!(cfg.timing.handshake_timeout_secs, 10);
    }

    #[test]
    fn test_default_config_has_no_commands() {
        assert!(EngineConfig::default().commands.is_empty());
    }

    #[test]
    fn test_config_round_trips_through_toml() {
        let mut cfg = EngineConfig::default();
        cfg.device.name = "workbench".to_string();
        cfg.network.control_port = 9000;
        cfg.commands.push(CommandEntry {
            key: "k1".to_string(),
            name: "Reboot".to_string(),
            command: "reboot".to_string(),
        });

        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: EngineConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_deserialize_minimal_toml_uses_defaults() {
        let toml_str = r#"
[device]
[network]
[timing]
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).expect("deserialize minimal");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: EngineConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn test_deserialize_partial_network_overrides_defaults() {
        let toml_str = r#"
[network]
discovery_port = 9999
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).expect("deserialize partial");
        assert_eq!(cfg.network.discovery_port, 9999);
        assert_eq!(cfg.network.control_port, 24821);
    }

    #[test]
    fn test_deserialize_invalid_toml_returns_parse_error() {
        let result: Result<EngineConfig, toml::de::Error> = toml::from_str("[[[ not valid");
        assert!(result.is_err());
    }

    #[test]
    fn test_command_entries_parse_from_toml() {
        let toml_str = r#"
[[commands]]
key = "reboot"
name = "Reboot"
command = "systemctl reboot"

[[commands]]
key = "lock"
name = "Lock Screen"
command = "loginctl lock-session"
"#;
        let cfg: EngineConfig = toml::from_str(toml_str).expect("deserialize");
        assert_eq!(cfg.commands.len(), 2);
        assert_eq!(cfg.commands[1].key, "lock");
    }

    #[test]
    fn test_save_and_load_round_trip_via_temp_dir() {
        let dir = std::env::temp_dir().join(format!("lanlink_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut cfg = EngineConfig::default();
        cfg.network.control_port = 12345;
        cfg.device.log_level = "debug".to_string();

        let content = toml::to_string_pretty(&cfg).unwrap();
        std::fs::write(&path, &content).unwrap();
        let loaded: EngineConfig =
            toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded.network.control_port, 12345);
        assert_eq!(loaded.device.log_level, "debug");

        std::fs::remove_dir_all(&dir).ok();
    }
}
