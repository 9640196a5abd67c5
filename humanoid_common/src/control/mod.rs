//! Shared types for the dual-rate control core.
//!
//! Organized by domain: joint table, state snapshot, controller core
//! command, per-tick fault flags, behavior ids and configuration.

pub mod behavior;
pub mod command;
pub mod config;
pub mod fault;
pub mod joint;
pub mod snapshot;
