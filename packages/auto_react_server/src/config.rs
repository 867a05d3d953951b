use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use auto_react::PairingConfig;
use auto_react::ReactorSettings;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [reactor]
//                    max_reconnect_attempts = 5
//
//   env var:         AUTO_REACT_REACTOR__MAX_RECONNECT_ATTEMPTS=5   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub pairing: PairingFileConfig,
    #[serde(default)]
    pub reactor: ReactorFileConfig,
    #[serde(default)]
    pub events: EventsFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
}

/// Listener settings (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whether to set the Secure flag on the session cookie
    #[serde(default = "default_secure_cookies")]
    pub secure_cookies: bool,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            secure_cookies: default_secure_cookies(),
        }
    }
}

/// Pairing tunables (lives under `[pairing]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairingFileConfig {
    #[serde(default = "default_pairing_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PairingFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pairing_timeout_secs(),
        }
    }
}

/// Reconnect and rate-limit policy (lives under `[reactor]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReactorFileConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_rate_limit_backoff_secs")]
    pub rate_limit_backoff_secs: u64,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

impl Default for ReactorFileConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            rate_limit_backoff_secs: default_rate_limit_backoff_secs(),
            command_buffer: default_command_buffer(),
        }
    }
}

/// Event feed tunables (lives under `[events]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsFileConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

impl Default for EventsFileConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            observer_buffer: default_observer_buffer(),
        }
    }
}

/// Gateway bridge settings (lives under `[gateway]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_secure_cookies() -> bool {
    true
}
fn default_pairing_timeout_secs() -> u64 {
    30
}
fn default_max_reconnect_attempts() -> u32 {
    10
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_rate_limit_backoff_secs() -> u64 {
    30
}
fn default_command_buffer() -> usize {
    32
}
fn default_history_capacity() -> usize {
    100
}
fn default_observer_buffer() -> usize {
    256
}
fn default_bridge_url() -> String {
    "ws://127.0.0.1:8765/".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_send_timeout_secs() -> u64 {
    15
}

/// Build a figment that layers: defaults → config.toml → AUTO_REACT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `AUTO_REACT_SERVER__PORT=9000`  →  `server.port = 9000`
///   `AUTO_REACT_GATEWAY__BRIDGE_URL=ws://bridge:8765/`  →  `gateway.bridge_url = ...`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("AUTO_REACT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Resolved server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub secure_cookies: bool,
    pub pairing: PairingConfig,
    pub reactor: ReactorSettings,
    pub history_capacity: usize,
    pub observer_buffer: usize,
    pub gateway: GatewayConfig,
}

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub bridge_url: String,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

impl ServerConfig {
    pub fn from_file(fc: &FileConfig) -> Result<Self> {
        let bind_addr = format!("{}:{}", fc.server.host, fc.server.port)
            .parse::<SocketAddr>()
            .with_context(|| {
                format!(
                    "Invalid listen address {}:{}",
                    fc.server.host, fc.server.port
                )
            })?;

        Ok(Self {
            bind_addr,
            secure_cookies: fc.server.secure_cookies,
            pairing: PairingConfig {
                timeout: Duration::from_secs(fc.pairing.timeout_secs),
            },
            reactor: ReactorSettings {
                max_reconnect_attempts: fc.reactor.max_reconnect_attempts,
                backoff_base: Duration::from_millis(fc.reactor.backoff_base_ms),
                backoff_cap: Duration::from_millis(fc.reactor.backoff_cap_ms),
                rate_limit_backoff: Duration::from_secs(fc.reactor.rate_limit_backoff_secs),
                command_buffer: fc.reactor.command_buffer,
            },
            history_capacity: fc.events.history_capacity,
            observer_buffer: fc.events.observer_buffer,
            gateway: GatewayConfig {
                bridge_url: fc.gateway.bridge_url.clone(),
                connect_timeout: Duration::from_secs(fc.gateway.connect_timeout_secs),
                send_timeout: Duration::from_secs(fc.gateway.send_timeout_secs),
            },
        })
    }
}

// =============================================================================
// Directory layout config (not tunable via figment, derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct AutoReactConfig {
    pub data_dir: PathBuf,
    /// One credential directory per paired session
    pub sessions_dir: PathBuf,
}

impl AutoReactConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".auto-react"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        let sessions_dir = data_dir.join("sessions");
        std::fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("Failed to create sessions directory: {:?}", sessions_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self {
            data_dir,
            sessions_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let fc = FileConfig::default();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 8080);
        assert!(fc.server.secure_cookies);
        assert_eq!(fc.pairing.timeout_secs, 30);
        assert_eq!(fc.reactor.max_reconnect_attempts, 10);
        assert_eq!(fc.reactor.backoff_base_ms, 1000);
        assert_eq!(fc.reactor.backoff_cap_ms, 30_000);
        assert_eq!(fc.reactor.rate_limit_backoff_secs, 30);
        assert_eq!(fc.events.history_capacity, 100);
        assert_eq!(fc.events.observer_buffer, 256);
        assert_eq!(fc.gateway.bridge_url, "ws://127.0.0.1:8765/");
    }

    // ── ServerConfig::from_file ─────────────────────────────────────────

    #[test]
    fn test_server_config_from_file_defaults() {
        let sc = ServerConfig::from_file(&FileConfig::default()).unwrap();
        assert_eq!(sc.bind_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(sc.pairing.timeout, Duration::from_secs(30));
        assert_eq!(sc.reactor.backoff_base, Duration::from_millis(1000));
        assert_eq!(sc.reactor.backoff_cap, Duration::from_secs(30));
        assert_eq!(sc.reactor.rate_limit_backoff, Duration::from_secs(30));
        assert_eq!(sc.gateway.send_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_server_config_rejects_bad_host() {
        let mut fc = FileConfig::default();
        fc.server.host = "not a host".to_string();
        assert!(ServerConfig::from_file(&fc).is_err());
    }

    // ── AutoReactConfig ─────────────────────────────────────────────────

    #[test]
    fn test_config_with_custom_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AutoReactConfig::new(Some(tmp.path().to_path_buf())).unwrap();

        assert_eq!(config.data_dir, tmp.path());
        assert_eq!(config.sessions_dir, tmp.path().join("sessions"));
        assert!(tmp.path().join("sessions").exists());
        assert_eq!(config.config_toml_path(), tmp.path().join("config.toml"));
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 8080);
        assert_eq!(fc.reactor.max_reconnect_attempts, 10);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[server]\nport = 9000\nsecure_cookies = false\n\n[reactor]\nmax_reconnect_attempts = 3\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.server.port, 9000);
        assert!(!fc.server.secure_cookies);
        assert_eq!(fc.reactor.max_reconnect_attempts, 3);
        // Untouched keys keep their defaults
        assert_eq!(fc.reactor.backoff_cap_ms, 30_000);
        assert_eq!(fc.server.host, "127.0.0.1");
    }

    #[test]
    fn test_load_config_partial_section() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[gateway]\nbridge_url = \"ws://bridge:9999/\"\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.gateway.bridge_url, "ws://bridge:9999/");
        assert_eq!(fc.gateway.connect_timeout_secs, 10);
    }
}
