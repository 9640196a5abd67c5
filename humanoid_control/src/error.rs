//! Error types for the control core.
//!
//! Only lifecycle operations (`start`, `stop`, builders, config loading)
//! return these. Faults inside a periodic tick are reported as
//! [`humanoid_common::control::fault::TickFaults`] instead.

use std::time::Duration;

use humanoid_common::config::ConfigError;
use thiserror::Error;

/// Scheduler and periodic task lifecycle errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Process or thread real-time setup failed.
    #[error("RT setup error: {0}")]
    RtSetup(String),

    /// The OS refused to create a task thread.
    #[error("failed to spawn task '{task}': {reason}")]
    Spawn { task: String, reason: String },

    /// The estimation task published nothing within the startup window.
    #[error("no snapshot published within {waited:?}")]
    StartupTimeout { waited: Duration },

    /// `start()` called while the tasks are running.
    #[error("scheduler already running")]
    AlreadyRunning,

    /// `stop()` called while nothing is running.
    #[error("scheduler not running")]
    NotRunning,

    /// `start()` called after the task bodies were handed back by `stop()`.
    #[error("scheduler parts already consumed")]
    Consumed,

    /// A task thread panicked.
    #[error("task '{0}' panicked")]
    TaskPanicked(String),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// State handoff errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandoffError {
    /// Published sequence does not exceed the previous one.
    #[error("sequence {attempted} does not follow {last}")]
    NonMonotonic { last: u64, attempted: u64 },

    /// The in-progress slot was already handed over.
    #[error("no snapshot in progress")]
    NothingInProgress,

    /// No snapshot appeared within the startup window.
    #[error("no snapshot published within {0:?}")]
    FirstSnapshotTimeout(Duration),
}

/// Behavior state machine construction and lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    /// Two registered states report the same id.
    #[error("state '{0}' registered twice")]
    DuplicateState(&'static str),

    /// No initial state was designated.
    #[error("no initial state designated")]
    NoInitialState,

    /// A referenced state id has no registered implementation.
    #[error("{role} state '{name}' is not registered")]
    UnregisteredState { role: &'static str, name: &'static str },

    /// A finished transition falls outside the narrowed allowed set.
    #[error("finished transition {from} -> {to} is not allowed")]
    DisallowedFinishedTransition { from: &'static str, to: &'static str },

    /// Two finished transitions leave the same state.
    #[error("state '{0}' has more than one finished transition")]
    AmbiguousFinishedTransition(&'static str),

    /// `start()` or `warm_up()` called on a running machine.
    #[error("state machine already started")]
    AlreadyStarted,
}

/// Sensor collaborator errors. Non-fatal: the estimation tick is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    /// The named device produced no sample.
    #[error("sensor '{0}' unavailable")]
    Unavailable(&'static str),

    /// The read did not complete in time.
    #[error("sensor read timed out")]
    Timeout,

    /// The named device produced an implausible sample.
    #[error("invalid sample from '{0}'")]
    Invalid(&'static str),
}
