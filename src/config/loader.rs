//! Configuration loading and validation.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Smallest per-client callback queue the core accepts.
pub const MIN_CLIENT_QUEUE_DEPTH: usize = 128;
/// Deepest topology tier a node may sit on (root hub = 0).
pub const MAX_TIERS: u8 = 7;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Inheritance error: {0}")]
    Inheritance(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// USBD configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UsbdConfig {
    /// Client registration settings.
    #[serde(default)]
    pub clients: ClientSettings,

    /// Bus monitor settings.
    #[serde(default)]
    pub bus: BusSettings,

    /// Hub port timing.
    #[serde(default)]
    pub timing: TimingSettings,

    /// Opaque handle pool.
    #[serde(default)]
    pub handles: HandleSettings,
}

/// Per-client callback thread settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// Depth of each client's callback queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Bounded wait for a callback thread to exit on unregistration.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Per-bus monitor thread settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Maximum topology depth (root hub = 0).
    #[serde(default = "default_max_tiers")]
    pub max_tiers: u8,

    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            max_tiers: default_max_tiers(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Hub port timings, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimingSettings {
    /// Wait after a connect before asserting reset.
    #[serde(default = "default_power_settle_ms")]
    pub power_settle_ms: u64,

    /// Port reset assertion.
    #[serde(default = "default_reset_ms")]
    pub reset_ms: u64,

    /// Recovery after the reset completes.
    #[serde(default = "default_reset_recovery_ms")]
    pub reset_recovery_ms: u64,

    /// Recovery after SET_ADDRESS.
    #[serde(default = "default_set_address_recovery_ms")]
    pub set_address_recovery_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            power_settle_ms: default_power_settle_ms(),
            reset_ms: default_reset_ms(),
            reset_recovery_ms: default_reset_recovery_ms(),
            set_address_recovery_ms: default_set_address_recovery_ms(),
        }
    }
}

impl TimingSettings {
    /// Zero every delay. Used by simulations that do not model electrical settling.
    pub fn immediate() -> Self {
        Self {
            power_settle_ms: 0,
            reset_ms: 0,
            reset_recovery_ms: 0,
            set_address_recovery_ms: 0,
        }
    }

    pub fn power_settle(&self) -> Duration {
        Duration::from_millis(self.power_settle_ms)
    }

    /// Reset assertion plus recovery.
    pub fn reset(&self) -> Duration {
        Duration::from_millis(self.reset_ms + self.reset_recovery_ms)
    }

    pub fn set_address_recovery(&self) -> Duration {
        Duration::from_millis(self.set_address_recovery_ms)
    }
}

/// Opaque handle pool settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HandleSettings {
    #[serde(default = "default_handle_capacity")]
    pub capacity: usize,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            capacity: default_handle_capacity(),
        }
    }
}

fn default_queue_depth() -> usize {
    MIN_CLIENT_QUEUE_DEPTH
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

fn default_max_tiers() -> u8 {
    MAX_TIERS
}

fn default_power_settle_ms() -> u64 {
    100
}

fn default_reset_ms() -> u64 {
    50
}

fn default_reset_recovery_ms() -> u64 {
    10
}

fn default_set_address_recovery_ms() -> u64 {
    2
}

fn default_handle_capacity() -> usize {
    4096
}

impl UsbdConfig {
    /// Load configuration from default locations.
    /// Search order:
    /// 1. ./usbd.toml
    /// 2. ~/.config/usbd/config.toml
    /// 3. /etc/usbd.toml
    pub fn load() -> Result<Self, ConfigError> {
        let paths = Self::config_paths();

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        // No config file found - use defaults
        Ok(UsbdConfig::default())
    }

    /// Load configuration from a specific path, supporting inheritance.
    ///
    /// If the config file contains an `inherit` key (string or array of strings),
    /// the inherited files are loaded first and merged, with the current file's
    /// values taking priority.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let merged = read_and_flatten_toml(path, &mut seen)?;
        let config: UsbdConfig = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string. `inherit` is not resolved.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: UsbdConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get list of possible config paths.
    fn config_paths() -> Vec<Option<PathBuf>> {
        vec![
            std::env::current_dir().ok().map(|p| p.join("usbd.toml")),
            dirs::config_dir().map(|p| p.join("usbd").join("config.toml")),
            Some(PathBuf::from("/etc/usbd.toml")),
        ]
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clients.queue_depth < MIN_CLIENT_QUEUE_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "clients.queue_depth must be at least {}, got {}",
                MIN_CLIENT_QUEUE_DEPTH, self.clients.queue_depth
            )));
        }
        if self.bus.queue_depth == 0 {
            return Err(ConfigError::Invalid("bus.queue_depth must be non-zero".into()));
        }
        if !(1..=MAX_TIERS).contains(&self.bus.max_tiers) {
            return Err(ConfigError::Invalid(format!(
                "bus.max_tiers must be within 1..={}, got {}",
                MAX_TIERS, self.bus.max_tiers
            )));
        }
        if self.handles.capacity == 0 {
            return Err(ConfigError::Invalid("handles.capacity must be non-zero".into()));
        }
        Ok(())
    }

    pub fn client_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.clients.shutdown_timeout_ms)
    }

    pub fn bus_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.bus.shutdown_timeout_ms)
    }
}

/// Read a TOML file and flatten any inheritance.
///
/// If the file contains an `inherit` key, the inherited files are loaded first
/// and merged. The `inherit` key can be:
/// - A string: single file to inherit from
/// - An array of strings: multiple files to inherit from (applied in order)
///
/// Paths in `inherit` are relative to the directory containing the config file.
fn read_and_flatten_toml(
    path: &Path,
    seen: &mut HashSet<PathBuf>,
) -> Result<toml::Value, ConfigError> {
    // Prevent circular inheritance
    let canonical = path.canonicalize().map_err(|e| {
        ConfigError::Inheritance(format!("cannot resolve {}: {}", path.display(), e))
    })?;

    if !seen.insert(canonical) {
        return Err(ConfigError::Inheritance(format!(
            "{} is inherited more than once; circular dependencies are not allowed",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut doc: toml::Value = toml::from_str(&content)?;

    let inherit = if let Some(table) = doc.as_table_mut() {
        table.remove("inherit")
    } else {
        None
    };

    let Some(inherit) = inherit else {
        return Ok(doc);
    };

    let base_dir = path.parent().unwrap_or(Path::new("."));

    let inherited_paths: Vec<PathBuf> = match inherit {
        toml::Value::String(s) => vec![base_dir.join(&s)],
        toml::Value::Array(arr) => {
            let mut paths = Vec::new();
            for item in arr {
                if let toml::Value::String(s) = item {
                    paths.push(base_dir.join(&s));
                } else {
                    return Err(ConfigError::Inheritance(
                        "inherit array must contain only strings".to_string(),
                    ));
                }
            }
            paths
        }
        _ => {
            return Err(ConfigError::Inheritance(
                "inherit must be a string or array of strings".to_string(),
            ));
        }
    };

    let mut merged: Option<toml::Value> = None;
    for inherited_path in inherited_paths {
        let inherited = read_and_flatten_toml(&inherited_path, seen)?;
        merged = Some(match merged {
            Some(base) => merge_toml_values(base, inherited),
            None => inherited,
        });
    }

    // Current file wins over everything it inherits
    let result = match merged {
        Some(base) => merge_toml_values(base, doc),
        None => doc,
    };

    Ok(result)
}

/// Deep-merge two TOML values.
///
/// - Tables are merged recursively (later values override earlier)
/// - Arrays are concatenated
/// - Other values are replaced by the later value
fn merge_toml_values(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                let merged_value = if let Some(base_value) = base_table.remove(&key) {
                    merge_toml_values(base_value, overlay_value)
                } else {
                    overlay_value
                };
                base_table.insert(key, merged_value);
            }
            toml::Value::Table(base_table)
        }
        (toml::Value::Array(mut base_arr), toml::Value::Array(overlay_arr)) => {
            base_arr.extend(overlay_arr);
            toml::Value::Array(base_arr)
        }
        (_, overlay) => overlay,
    }
}

/// Generate example configuration content.
pub fn example_config() -> &'static str {
    r#"# usbd configuration file
# Place in ./usbd.toml, ~/.config/usbd/config.toml, or /etc/usbd.toml
# inherit = "base.toml"

[clients]
# Depth of each client's callback queue (minimum 128)
queue_depth = 128
# How long unregistration waits for a callback thread to exit
shutdown_timeout_ms = 5000

[bus]
# Depth of each bus monitor queue
queue_depth = 128
# Maximum topology depth below the root hub (1-7)
max_tiers = 7
shutdown_timeout_ms = 5000

[timing]
# Wait after a port connect before asserting reset
power_settle_ms = 100
# Port reset assertion
reset_ms = 50
# Recovery after the reset completes
reset_recovery_ms = 10
# Recovery after SET_ADDRESS
set_address_recovery_ms = 2

[handles]
# Maximum number of live opaque handles
capacity = 4096
"#
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_matches_defaults() {
        let config = UsbdConfig::from_toml(example_config()).unwrap();
        let defaults = UsbdConfig::default();
        assert_eq!(config.clients.queue_depth, defaults.clients.queue_depth);
        assert_eq!(config.bus.max_tiers, defaults.bus.max_tiers);
        assert_eq!(config.timing.power_settle_ms, 100);
        assert_eq!(config.timing.reset(), Duration::from_millis(60));
        assert_eq!(config.handles.capacity, 4096);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = UsbdConfig::from_toml("[timing]\npower_settle_ms = 5\n").unwrap();
        assert_eq!(config.timing.power_settle_ms, 5);
        assert_eq!(config.timing.reset_ms, 50);
        assert_eq!(config.clients.queue_depth, 128);
    }

    #[test]
    fn test_validate_rejects_shallow_client_queue() {
        let err = UsbdConfig::from_toml("[clients]\nqueue_depth = 16\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_validate_rejects_tiers() {
        assert!(UsbdConfig::from_toml("[bus]\nmax_tiers = 0\n").is_err());
        assert!(UsbdConfig::from_toml("[bus]\nmax_tiers = 8\n").is_err());
        assert!(UsbdConfig::from_toml("[handles]\ncapacity = 0\n").is_err());
    }

    #[test]
    fn test_merge_toml_values_overlay_wins() {
        let base: toml::Value = toml::from_str("[timing]\nreset_ms = 50\npower_settle_ms = 100\n").unwrap();
        let overlay: toml::Value = toml::from_str("[timing]\nreset_ms = 10\n").unwrap();
        let merged = merge_toml_values(base, overlay);
        let timing = merged.get("timing").unwrap();
        assert_eq!(timing.get("reset_ms").unwrap().as_integer(), Some(10));
        assert_eq!(timing.get("power_settle_ms").unwrap().as_integer(), Some(100));
    }

    #[test]
    fn test_inherit_from_base_file() {
        let dir = std::env::temp_dir().join(format!("usbd-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("base.toml"), "[bus]\nmax_tiers = 3\n[timing]\nreset_ms = 7\n").unwrap();
        std::fs::write(
            dir.join("usbd.toml"),
            "inherit = \"base.toml\"\n[timing]\nreset_ms = 9\n",
        )
        .unwrap();

        let config = UsbdConfig::load_from_path(&dir.join("usbd.toml")).unwrap();
        assert_eq!(config.bus.max_tiers, 3);
        assert_eq!(config.timing.reset_ms, 9);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_circular_inherit_rejected() {
        let dir = std::env::temp_dir().join(format!("usbd-cycle-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.toml"), "inherit = \"b.toml\"\n").unwrap();
        std::fs::write(dir.join("b.toml"), "inherit = \"a.toml\"\n").unwrap();

        let err = UsbdConfig::load_from_path(&dir.join("a.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Inheritance(_)));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
