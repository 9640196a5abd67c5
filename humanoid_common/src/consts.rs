//! System-wide constants for the humanoid control workspace.
//!
//! Single source of truth for capacity limits and timing defaults.
//! Imported by all crates. No duplication permitted.

use static_assertions::const_assert;

/// Maximum number of actuated joints in the joint table.
pub const MAX_JOINTS: usize = 64;

/// Maximum number of force/torque sensors carried in a snapshot.
pub const MAX_FORCE_SENSORS: usize = 8;

/// Default estimation period in microseconds (1 kHz).
pub const ESTIMATION_PERIOD_US: u32 = 1_000;

/// Default control period in microseconds (250 Hz).
pub const CONTROL_PERIOD_US: u32 = 4_000;

/// Smallest accepted task period [µs].
pub const PERIOD_US_MIN: u32 = 100;

/// Largest accepted task period [µs].
pub const PERIOD_US_MAX: u32 = 1_000_000;

/// Default SCHED_FIFO priority of the estimation thread.
pub const ESTIMATION_PRIORITY_DEFAULT: i32 = 45;

/// Default SCHED_FIFO priority of the control thread.
pub const CONTROL_PRIORITY_DEFAULT: i32 = 40;

/// SCHED_FIFO priority range accepted by the config validator.
pub const PRIORITY_MIN: i32 = 1;
pub const PRIORITY_MAX: i32 = 99;

/// Default startup rendezvous timeout [ms].
pub const FIRST_SNAPSHOT_TIMEOUT_MS_DEFAULT: u64 = 1_000;

/// Default duration of the stand-prep interpolation [s].
pub const STAND_PREP_DURATION_DEFAULT: f64 = 3.0;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/humanoid/control.toml";

// Joint ids are carried as `u16`.
const_assert!(MAX_JOINTS <= u16::MAX as usize);
const_assert!(MAX_FORCE_SENSORS > 0);
const_assert!(PERIOD_US_MIN < PERIOD_US_MAX);
