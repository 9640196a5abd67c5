//! Configuration loading and cross-validation.
//!
//! Parses the controller TOML, validates every section, builds the joint
//! table and checks that the `[behavior]` section assembles into a valid
//! state machine. The result is one [`LoadedConfig`] bundle handed to the
//! scheduler and the behaviors.

use std::path::Path;
use std::sync::Arc;

use humanoid_common::config::{ConfigError, ConfigLoader};
use humanoid_common::control::config::ControllerConfig;
use humanoid_common::control::joint::JointMap;

use crate::behavior::catalogue::build_machine;
use crate::scheduler::SchedulerSettings;

// ─── Loaded Config Bundle ───────────────────────────────────────────

/// Complete validated configuration bundle, ready for runtime use.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ControllerConfig,
    pub joints: Arc<JointMap>,
}

impl LoadedConfig {
    /// Task timing for the scheduler.
    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings::from_config(&self.config)
    }
}

// ─── Loading Functions ──────────────────────────────────────────────

/// Load and validate the controller configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let config = ControllerConfig::load(path)?;
    finish(config)
}

/// Same as [`load_config`] for an in-memory TOML string.
pub fn load_config_from_str(content: &str) -> Result<LoadedConfig, ConfigError> {
    let config = ControllerConfig::from_toml_str(content)?;
    finish(config)
}

fn finish(config: ControllerConfig) -> Result<LoadedConfig, ConfigError> {
    let joints = Arc::new(config.validate()?);
    build_machine(&joints, &config.behavior)
        .map_err(|e| ConfigError::ValidationError(format!("[behavior] {e}")))?;
    Ok(LoadedConfig { config, joints })
}
