//! Broker configuration – reads `/etc/capd/config.toml`.
//!
//! A missing file is not an error: every field has a default, so a bare
//! `capd` serves all capabilities on the system bus.

use std::fs;
use std::path::{Path, PathBuf};

use capd_middleware::{BusKind, DbusConfig};
use capd_types::{BrokerError, CapabilityKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Where the configuration lives unless `--config` / `CAPD_CONFIG` says
/// otherwise.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/capd/config.toml";

/// Effective broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Message bus to serve on.
    #[serde(default)]
    pub bus: BusKind,

    /// Well-known bus name the broker claims.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Object path of the broker; endpoints are published below it.
    #[serde(default = "default_object_root")]
    pub object_root: String,

    /// Capabilities to register.
    #[serde(default = "all_capabilities")]
    pub capabilities: Vec<CapabilityKind>,

    /// Depth of the broker task's command queue.
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,

    #[serde(default)]
    pub permissions: Permissions,
}

/// `[permissions]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    /// Capabilities any client may lease.
    #[serde(default = "all_capabilities")]
    pub allow: Vec<CapabilityKind>,
}

fn default_service_name() -> String {
    "org.capd.Broker1".to_string()
}
fn default_object_root() -> String {
    "/org/capd/Broker1".to_string()
}
fn all_capabilities() -> Vec<CapabilityKind> {
    CapabilityKind::ALL.to_vec()
}
fn default_command_queue() -> usize {
    64
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            allow: all_capabilities(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusKind::default(),
            service_name: default_service_name(),
            object_root: default_object_root(),
            capabilities: all_capabilities(),
            command_queue: default_command_queue(),
            permissions: Permissions::default(),
        }
    }
}

impl Config {
    /// The part of the configuration the D-Bus transport needs.
    pub fn dbus(&self) -> DbusConfig {
        DbusConfig {
            bus: self.bus,
            service_name: self.service_name.clone(),
            object_root: self.object_root.clone(),
        }
    }

    /// Reject values the broker cannot start with.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.command_queue == 0 {
            return Err(BrokerError::Config("command_queue must be at least 1".to_string()));
        }
        if !self.object_root.starts_with('/') {
            return Err(BrokerError::Config(format!(
                "object_root must be an absolute object path, got {:?}",
                self.object_root
            )));
        }
        if !self.service_name.contains('.') {
            return Err(BrokerError::Config(format!(
                "service_name must be a well-known bus name, got {:?}",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// Pick the configuration file: the explicit path if given, otherwise
/// [`DEFAULT_CONFIG_PATH`].  `CAPD_CONFIG` arrives here through clap.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load, apply `CAPD_*` overrides and validate.
pub fn load(path: &Path) -> Result<Config, BrokerError> {
    load_with(path, |key| std::env::var(key).ok())
}

/// [`load`] with an explicit environment lookup.
pub(crate) fn load_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, BrokerError> {
    let mut cfg = if path.exists() {
        let raw = fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let cfg: Config = toml::from_str(&raw).map_err(|e| {
            BrokerError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "configuration loaded");
        cfg
    } else {
        info!(path = %path.display(), "no configuration file, using defaults");
        Config::default()
    };
    apply_overrides(&mut cfg, env);
    cfg.validate()?;
    Ok(cfg)
}

/// Apply `CAPD_*` overrides to `cfg`.  Unparseable values are logged and
/// ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `CAPD_BUS` | `bus` (`system` / `session`) |
/// | `CAPD_SERVICE_NAME` | `service_name` |
/// | `CAPD_OBJECT_ROOT` | `object_root` |
/// | `CAPD_CAPABILITIES` | `capabilities` (comma separated) |
pub fn apply_overrides(cfg: &mut Config, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("CAPD_BUS") {
        match v.trim() {
            "system" => cfg.bus = BusKind::System,
            "session" => cfg.bus = BusKind::Session,
            other => warn!(value = other, "ignoring invalid CAPD_BUS"),
        }
    }
    if let Some(v) = env("CAPD_SERVICE_NAME") {
        cfg.service_name = v;
    }
    if let Some(v) = env("CAPD_OBJECT_ROOT") {
        cfg.object_root = v;
    }
    if let Some(v) = env("CAPD_CAPABILITIES") {
        let parsed: Result<Vec<CapabilityKind>, _> = v
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::parse::<CapabilityKind>)
            .collect();
        match parsed {
            Ok(kinds) => cfg.capabilities = kinds,
            Err(e) => warn!(error = %e, "ignoring invalid CAPD_CAPABILITIES"),
        }
    }
}
