//! Humanoid Common Library
//!
//! Shared constants, configuration loading and the data types exchanged
//! between the estimation and control threads.
//!
//! # Module Structure
//!
//! - [`consts`] - Capacity limits and timing defaults
//! - [`config`] - Configuration loading traits and types
//! - [`control`] - Snapshot, command, behavior and config types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use humanoid_common::config::{ConfigLoader, SharedConfig};
//! use humanoid_common::control::snapshot::RobotStateSnapshot;
//! ```

pub mod config;
pub mod consts;
pub mod control;
pub mod prelude;
