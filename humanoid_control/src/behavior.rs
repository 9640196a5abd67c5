//! Behavior state lifecycle contract.
//!
//! A behavior state is one interchangeable control law. The state machine
//! drives every registered state through
//! `on_entry → {do_action}* → on_exit`, any number of times, and never
//! has two states active at once.

use std::fmt::Debug;
use std::hash::Hash;

use humanoid_common::control::behavior::HighLevelBehavior;
use humanoid_common::control::command::ControllerCoreCommand;
use humanoid_common::control::snapshot::RobotStateSnapshot;

pub mod catalogue;

/// Enumerated identity of a behavior state.
///
/// Ids round-trip through `u8` so transition requests can cross threads
/// through an atomic.
pub trait BehaviorId: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    /// Raw wire value.
    fn as_u8(self) -> u8;

    /// Decode a raw value. `None` for values outside the catalogue.
    fn from_u8(raw: u8) -> Option<Self>;

    /// Human-readable name for logs and errors.
    fn name(self) -> &'static str;
}

impl BehaviorId for HighLevelBehavior {
    #[inline]
    fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    fn from_u8(raw: u8) -> Option<Self> {
        HighLevelBehavior::from_u8(raw)
    }

    #[inline]
    fn name(self) -> &'static str {
        HighLevelBehavior::name(self)
    }
}

/// One control law.
///
/// Implementations own their working data. They receive the latest
/// snapshot by reference and must not block, log per tick or allocate in
/// [`do_action`](Self::do_action).
pub trait BehaviorState<K: BehaviorId>: Send {
    /// Identity under which the state is registered.
    fn id(&self) -> K;

    /// One-time setup on becoming active. Must not assume any previous
    /// state.
    fn on_entry(&mut self, _snapshot: &RobotStateSnapshot) {}

    /// Write a complete command for this tick. `command` arrives empty.
    fn do_action(
        &mut self,
        snapshot: &RobotStateSnapshot,
        time_in_state: f64,
        command: &mut ControllerCoreCommand,
    );

    /// Pure query used for finished transitions.
    fn is_done(&self, _time_in_state: f64) -> bool {
        false
    }

    /// One-time teardown.
    fn on_exit(&mut self) {}
}
