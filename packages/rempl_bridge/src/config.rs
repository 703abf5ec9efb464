use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / rempl.toml / env vars)
// =============================================================================
//
//   rempl.toml:      [panel]
//                    sandbox_grace_ms = 500
//
//   env var:         REMPL_PANEL__SANDBOX_GRACE_MS=500   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub relay: RelayFileConfig,
    #[serde(default)]
    pub page: PageFileConfig,
    #[serde(default)]
    pub panel: PanelFileConfig,
}

/// Relay hub server (lives under `[relay]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayFileConfig {
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelayFileConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
        }
    }
}

/// Page multiplexer (lives under `[page]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageFileConfig {
    /// Name the multiplexer announces itself with on the page.
    #[serde(default = "default_host_name")]
    pub host_name: String,
    /// Name in-page publishers announce themselves with.
    #[serde(default = "default_publisher_name")]
    pub publisher_name: String,
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

impl Default for PageFileConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            publisher_name: default_publisher_name(),
            bus_capacity: default_bus_capacity(),
        }
    }
}

/// Inspector panel (lives under `[panel]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PanelFileConfig {
    /// How long a sandbox survives a disconnect before it is torn down.
    #[serde(default = "default_sandbox_grace_ms")]
    pub sandbox_grace_ms: u64,
}

impl Default for PanelFileConfig {
    fn default() -> Self {
        Self {
            sandbox_grace_ms: default_sandbox_grace_ms(),
        }
    }
}

fn default_relay_host() -> String {
    "127.0.0.1".to_string()
}
fn default_relay_port() -> u16 {
    8765
}
fn default_host_name() -> String {
    "rempl-browser-extension-host".to_string()
}
fn default_publisher_name() -> String {
    "rempl-browser-extension-publisher".to_string()
}
fn default_bus_capacity() -> usize {
    256
}
fn default_sandbox_grace_ms() -> u64 {
    3000
}

/// Default config directory (`~/.config/rempl` on Linux).
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rempl")
}

/// Build a figment that layers: defaults → rempl.toml → REMPL_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `REMPL_RELAY__PORT=9000`  →  `relay.port = 9000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("rempl.toml")))
        .merge(Env::prefixed("REMPL_").split("__"))
}

impl FileConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        load_config(config_dir)
            .extract()
            .with_context(|| format!("Failed to load configuration from {:?}", config_dir))
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Relay hub server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
}

impl RelayConfig {
    pub fn from_file(fc: &RelayFileConfig) -> Result<Self> {
        let bind_addr = format!("{}:{}", fc.host, fc.port)
            .parse()
            .with_context(|| format!("Invalid relay address {}:{}", fc.host, fc.port))?;
        Ok(Self { bind_addr })
    }
}

/// Page multiplexer configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PageConfig {
    pub host_name: String,
    pub publisher_name: String,
    pub bus_capacity: usize,
}

impl PageConfig {
    pub fn from_file(fc: &PageFileConfig) -> Self {
        Self {
            host_name: fc.host_name.clone(),
            publisher_name: fc.publisher_name.clone(),
            bus_capacity: fc.bus_capacity.max(1),
        }
    }

    /// Address publishers send their handshake to.
    pub fn host_connect_address(&self) -> String {
        format!("{}:connect", self.host_name)
    }

    /// Address the multiplexer sends its handshake to.
    pub fn publisher_connect_address(&self) -> String {
        format!("{}:connect", self.publisher_name)
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self::from_file(&PageFileConfig::default())
    }
}

/// Inspector panel configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PanelConfig {
    pub sandbox_grace: Duration,
}

impl PanelConfig {
    pub fn from_file(fc: &PanelFileConfig) -> Self {
        Self {
            sandbox_grace: Duration::from_millis(fc.sandbox_grace_ms),
        }
    }
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self::from_file(&PanelFileConfig::default())
    }
}
