//! # Humanoid Control Core
//!
//! Dual-rate real-time execution and behavior arbitration for a humanoid
//! robot. An estimation task fuses sensor data into snapshots at one rate,
//! a control task consumes the latest snapshot at another rate and runs
//! exactly one behavior state, whose command goes through a validating
//! sink to the output layer.
//!
//! ## Data Flow
//!
//! ```text
//! SensorReader → StateEstimator → SnapshotPublisher ─┐
//!                                      (estimation)  │ handoff
//!                                                    ▼
//!        OutputWriter ← CommandSink ← BehaviorStateMachine ← SnapshotReader
//!                                      (control)
//! ```
//!
//! Transition requests and failure signals enter the state machine from
//! any thread through a [`machine::BehaviorRequester`].
//!
//! ## Tick Discipline
//!
//! Per-tick faults never propagate as errors. They are collected into
//! [`humanoid_common::control::fault::TickFaults`], counted, and reported
//! through a [`telemetry::TelemetrySink`]. Only lifecycle calls return
//! `Result`.

pub mod behavior;
pub mod config;
pub mod control;
pub mod cycle;
pub mod error;
pub mod estimation;
pub mod handoff;
pub mod machine;
pub mod scheduler;
pub mod sim;
pub mod sink;
pub mod telemetry;
