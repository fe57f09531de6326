//! MIDI port configuration
//!
//! YAML file describing which ports to open and how, persisted under
//! the platform config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tactus_core::queue::DEFAULT_RING_CAPACITY;

/// Persisted port selection and callback filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Case-insensitive substring matched against input port names.
    pub input_port: String,
    /// Output port match; None disables output.
    pub output_port: Option<String>,
    /// Message queue capacity allocated at open.
    pub ring_capacity: usize,
    pub ignore_sysex: bool,
    pub ignore_timing_clock: bool,
    pub ignore_active_sensing: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            input_port: String::new(),
            output_port: None,
            ring_capacity: DEFAULT_RING_CAPACITY,
            ignore_sysex: true,
            ignore_timing_clock: false,
            ignore_active_sensing: true,
        }
    }
}

/// Default location of the persisted port config.
pub fn default_port_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tactus")
        .join("midi.yaml")
}

/// Load port config from a YAML file; a missing or invalid file logs
/// and yields defaults.
pub fn load_port_config(path: &Path) -> PortConfig {
    if !path.exists() {
        log::info!("load_port_config: no config at {:?}, using defaults", path);
        return PortConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<PortConfig>(&contents) {
            Ok(config) => {
                log::info!(
                    "load_port_config: input '{}', queue capacity {}",
                    config.input_port,
                    config.ring_capacity
                );
                config
            }
            Err(e) => {
                log::warn!("load_port_config: failed to parse {:?}: {}", path, e);
                PortConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_port_config: failed to read {:?}: {}", path, e);
            PortConfig::default()
        }
    }
}

/// Persist port config as YAML, creating parent directories.
pub fn save_port_config(path: &Path, config: &PortConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(path, yaml)?;
    log::info!("save_port_config: wrote {:?}", path);
    Ok(())
}
