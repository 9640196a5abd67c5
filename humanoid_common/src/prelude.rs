//! Prelude module for common re-exports.
//!
//! ```rust
//! use humanoid_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::control::config::{BehaviorConfig, ControllerConfig, StartupConfig, TaskConfig};

// ─── System Constants ───────────────────────────────────────────────
pub use crate::consts::{MAX_FORCE_SENSORS, MAX_JOINTS};

// ─── Control Types ──────────────────────────────────────────────────
pub use crate::control::behavior::HighLevelBehavior;
pub use crate::control::command::{
    CommandError, ControllerCoreCommand, JointControlMode, JointDesired,
};
pub use crate::control::fault::TickFaults;
pub use crate::control::joint::{JointId, JointMap};
pub use crate::control::snapshot::{
    ImuReading, RobotStateSnapshot, RootPose, RootTwist, SensorReadings, WrenchReading,
};
