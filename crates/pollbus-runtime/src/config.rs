//! Adapter configuration – reads/writes `~/.pollbus/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use pollbus_types::{BusError, BusType};
use serde::{Deserialize, Serialize};

/// Output format of the console log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Compact => write!(f, "compact"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(BusError::Config(format!("unknown log format '{other}'"))),
        }
    }
}

/// Persisted adapter configuration stored in `~/.pollbus/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Bus to connect to.
    #[serde(default)]
    pub bus: BusType,

    /// Well-known name to request after connecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Take the name over from its current owner.
    #[serde(default)]
    pub replace_existing: bool,

    /// Poll slots reserved for the host's own descriptors.
    #[serde(default)]
    pub reserve_slots: usize,

    /// Period of the background dispatch drain, in milliseconds.
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    #[serde(default)]
    pub log_format: LogFormat,

    /// OTLP/HTTP collector base URL; span export is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

fn default_drain_interval_ms() -> u64 {
    100
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            bus: BusType::default(),
            name: None,
            replace_existing: false,
            reserve_slots: 0,
            drain_interval_ms: default_drain_interval_ms(),
            log_format: LogFormat::default(),
            otlp_endpoint: None,
        }
    }
}

/// Return the path to `~/.pollbus/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".pollbus").join("config.toml")
}

/// Load the config from disk and apply environment overrides. Returns `None`
/// if the file does not exist.
///
/// # Errors
///
/// [`BusError::Config`] if the file cannot be read or parsed.
pub fn load() -> Result<Option<AdapterConfig>, BusError> {
    load_from(&config_path())
}

/// Like [`load`], for a specific path.
///
/// # Errors
///
/// [`BusError::Config`] if the file cannot be read or parsed.
pub fn load_from(path: &Path) -> Result<Option<AdapterConfig>, BusError> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

fn read_from(path: &Path) -> Result<Option<AdapterConfig>, BusError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| BusError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| BusError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply environment variable overrides to `cfg`. Unparseable values are
/// ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `POLLBUS_BUS` | `bus` |
/// | `POLLBUS_NAME` | `name` |
/// | `POLLBUS_REPLACE` | `replace_existing` |
/// | `POLLBUS_RESERVE_SLOTS` | `reserve_slots` |
/// | `POLLBUS_DRAIN_INTERVAL_MS` | `drain_interval_ms` |
/// | `POLLBUS_LOG_FORMAT` | `log_format` |
/// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `otlp_endpoint` |
pub fn apply_env_overrides(cfg: &mut AdapterConfig) {
    if let Ok(v) = std::env::var("POLLBUS_BUS")
        && let Ok(bus) = v.parse()
    {
        cfg.bus = bus;
    }
    if let Ok(v) = std::env::var("POLLBUS_NAME") {
        cfg.name = Some(v).filter(|n| !n.is_empty());
    }
    if let Ok(v) = std::env::var("POLLBUS_REPLACE")
        && let Some(replace) = parse_flag(&v)
    {
        cfg.replace_existing = replace;
    }
    if let Ok(v) = std::env::var("POLLBUS_RESERVE_SLOTS")
        && let Ok(slots) = v.parse()
    {
        cfg.reserve_slots = slots;
    }
    if let Ok(v) = std::env::var("POLLBUS_DRAIN_INTERVAL_MS")
        && let Ok(ms) = v.parse()
    {
        cfg.drain_interval_ms = ms;
    }
    if let Ok(v) = std::env::var("POLLBUS_LOG_FORMAT")
        && let Ok(format) = v.parse()
    {
        cfg.log_format = format;
    }
    if let Ok(v) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        cfg.otlp_endpoint = Some(v).filter(|e| !e.is_empty());
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Save the config to disk, creating `~/.pollbus/` if necessary.
///
/// # Errors
///
/// [`BusError::Config`] on any filesystem or serialisation failure.
pub fn save(cfg: &AdapterConfig) -> Result<(), BusError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path.
///
/// # Errors
///
/// [`BusError::Config`] on any filesystem or serialisation failure.
pub fn save_to(cfg: &AdapterConfig, path: &Path) -> Result<(), BusError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| BusError::Config(format!("failed to create config directory: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                BusError::Config(format!("failed to restrict config directory: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BusError::Config(format!("failed to serialise config: {e}")))?;
    write_private(path, &raw)
        .map_err(|e| BusError::Config(format!("failed to write {}: {e}", path.display())))
}

#[cfg(unix)]
fn write_private(path: &Path, raw: &str) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?
        .write_all(raw.as_bytes())
}

#[cfg(not(unix))]
fn write_private(path: &Path, raw: &str) -> std::io::Result<()> {
    fs::write(path, raw)
}
