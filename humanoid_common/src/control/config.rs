//! Configuration structures for the dual-rate control core.
//!
//! All config types use `serde::Deserialize` for TOML loading.
//! Numeric parameters are checked against the bounds in [`crate::consts`].
//! Optional fields use `#[serde(default)]`.

use serde::{Deserialize, Serialize};

use crate::config::{ConfigError, SharedConfig};
use crate::consts::{
    CONTROL_PERIOD_US, CONTROL_PRIORITY_DEFAULT, ESTIMATION_PERIOD_US,
    ESTIMATION_PRIORITY_DEFAULT, FIRST_SNAPSHOT_TIMEOUT_MS_DEFAULT, PERIOD_US_MAX,
    PERIOD_US_MIN, PRIORITY_MAX, PRIORITY_MIN, STAND_PREP_DURATION_DEFAULT,
};

use super::behavior::HighLevelBehavior;
use super::joint::{JointConfig, JointMap};

// ─── Top-Level Config ───────────────────────────────────────────────

/// Top-level controller configuration, loaded once at startup.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "humanoid-control"
///
/// [estimation]
/// name = "estimation"
/// period_us = 1000
/// priority = 45
///
/// [control]
/// name = "control"
/// period_us = 4000
/// priority = 40
/// cpu_core = 3
///
/// [[joints]]
/// name = "l_knee"
/// stand_position = -0.6
///
/// [behavior]
/// initial_state = "do_nothing"
/// fallback_state = "freeze"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Shared service fields.
    pub shared: SharedConfig,
    /// Estimation task.
    #[serde(default = "TaskConfig::estimation_default")]
    pub estimation: TaskConfig,
    /// Control task.
    #[serde(default = "TaskConfig::control_default")]
    pub control: TaskConfig,
    /// Startup rendezvous and process-wide RT setup.
    #[serde(default)]
    pub startup: StartupConfig,
    /// Ordered joint table.
    pub joints: Vec<JointConfig>,
    /// Behavior state machine setup.
    #[serde(default)]
    pub behavior: BehaviorConfig,
}

impl ControllerConfig {
    /// Validate every section and build the joint table.
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<JointMap, ConfigError> {
        self.shared.validate()?;
        self.estimation.validate("estimation")?;
        self.control.validate("control")?;
        self.startup.validate()?;
        self.behavior.validate()?;

        if self.estimation.name == self.control.name {
            return Err(ConfigError::ValidationError(format!(
                "estimation and control tasks share the name '{}'",
                self.control.name
            )));
        }

        JointMap::from_config(&self.joints)
    }
}

// ─── Tasks ──────────────────────────────────────────────────────────

/// One periodic real-time task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Thread name (max 15 bytes are visible to the kernel).
    pub name: String,
    /// Target period [µs].
    pub period_us: u32,
    /// SCHED_FIFO priority, higher is more urgent.
    pub priority: i32,
    /// Optional CPU core to pin the thread to.
    #[serde(default)]
    pub cpu_core: Option<usize>,
}

impl TaskConfig {
    /// 1 kHz estimation task.
    pub fn estimation_default() -> Self {
        Self {
            name: "estimation".to_string(),
            period_us: ESTIMATION_PERIOD_US,
            priority: ESTIMATION_PRIORITY_DEFAULT,
            cpu_core: None,
        }
    }

    /// 250 Hz control task.
    pub fn control_default() -> Self {
        Self {
            name: "control".to_string(),
            period_us: CONTROL_PERIOD_US,
            priority: CONTROL_PRIORITY_DEFAULT,
            cpu_core: None,
        }
    }

    /// Period as a `Duration`.
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_micros(u64::from(self.period_us))
    }

    /// Validate bounds. `section` names the TOML table in the message.
    pub fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "[{section}] name cannot be empty"
            )));
        }
        if self.period_us < PERIOD_US_MIN || self.period_us > PERIOD_US_MAX {
            return Err(ConfigError::ValidationError(format!(
                "[{section}] period_us {} out of range [{PERIOD_US_MIN}, {PERIOD_US_MAX}]",
                self.period_us
            )));
        }
        if self.priority < PRIORITY_MIN || self.priority > PRIORITY_MAX {
            return Err(ConfigError::ValidationError(format!(
                "[{section}] priority {} out of range [{PRIORITY_MIN}, {PRIORITY_MAX}]",
                self.priority
            )));
        }
        Ok(())
    }
}

// ─── Startup ────────────────────────────────────────────────────────

/// Startup rendezvous and memory locking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartupConfig {
    /// How long `start()` waits for the first snapshot [ms].
    #[serde(default = "default_first_snapshot_timeout_ms")]
    pub first_snapshot_timeout_ms: u64,
    /// Lock process memory before spawning RT threads (`rt` builds only).
    #[serde(default = "default_true")]
    pub lock_memory: bool,
}

fn default_first_snapshot_timeout_ms() -> u64 {
    FIRST_SNAPSHOT_TIMEOUT_MS_DEFAULT
}
fn default_true() -> bool {
    true
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            first_snapshot_timeout_ms: FIRST_SNAPSHOT_TIMEOUT_MS_DEFAULT,
            lock_memory: true,
        }
    }
}

impl StartupConfig {
    /// Timeout as a `Duration`.
    pub fn first_snapshot_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.first_snapshot_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.first_snapshot_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "[startup] first_snapshot_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ─── Behavior ───────────────────────────────────────────────────────

/// Behavior state machine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorConfig {
    /// State entered on the first control tick.
    #[serde(default)]
    pub initial_state: HighLevelBehavior,
    /// State forced on a failure signal.
    #[serde(default)]
    pub fallback_state: Option<HighLevelBehavior>,
    /// Duration of the stand-prep interpolation [s].
    #[serde(default = "default_stand_prep_duration")]
    pub stand_prep_duration_s: f64,
    /// Honour explicit transition requests.
    #[serde(default = "default_true")]
    pub listen_to_requests: bool,
    /// `[from, to]` pairs taken when `from` reports done.
    #[serde(default)]
    pub finished_transitions: Vec<(HighLevelBehavior, HighLevelBehavior)>,
    /// Narrowed transition policy. Absent means every pair is legal.
    ///
    /// The permissive default allows e.g. `freeze` straight back to
    /// `stand_ready`; whether deployments must narrow it is pending
    /// product review.
    #[serde(default)]
    pub allowed_transitions: Option<Vec<(HighLevelBehavior, HighLevelBehavior)>>,
}

fn default_stand_prep_duration() -> f64 {
    STAND_PREP_DURATION_DEFAULT
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            initial_state: HighLevelBehavior::DoNothing,
            fallback_state: None,
            stand_prep_duration_s: STAND_PREP_DURATION_DEFAULT,
            listen_to_requests: true,
            finished_transitions: Vec::new(),
            allowed_transitions: None,
        }
    }
}

impl BehaviorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.stand_prep_duration_s.is_finite() || self.stand_prep_duration_s <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "[behavior] stand_prep_duration_s {} must be finite and > 0",
                self.stand_prep_duration_s
            )));
        }
        for (idx, (from, to)) in self.finished_transitions.iter().enumerate() {
            if from == to {
                return Err(ConfigError::ValidationError(format!(
                    "[behavior] finished_transitions[{idx}] loops {from} to itself"
                )));
            }
            if self
                .finished_transitions
                .iter()
                .take(idx)
                .any(|(prev, _)| prev == from)
            {
                return Err(ConfigError::ValidationError(format!(
                    "[behavior] more than one finished transition out of {from}"
                )));
            }
        }
        Ok(())
    }
}
