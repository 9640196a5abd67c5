//! Built-in high-level behaviors.
//!
//! Simple joint-space control laws used for bring-up and as safe fallbacks.
//! Walking and balance controllers register through the same
//! [`BehaviorState`] trait from outside this crate.

use std::f64::consts::PI;
use std::sync::Arc;

use humanoid_common::consts::MAX_JOINTS;
use humanoid_common::control::behavior::HighLevelBehavior;
use humanoid_common::control::command::{ControllerCoreCommand, JointDesired};
use humanoid_common::control::config::BehaviorConfig;
use humanoid_common::control::joint::JointMap;
use humanoid_common::control::snapshot::RobotStateSnapshot;

use super::BehaviorState;
use crate::error::MachineError;
use crate::machine::{BehaviorRequester, BehaviorStateMachine};

/// Sweep amplitude of the diagnostic behavior [rad].
const DIAGNOSTIC_AMPLITUDE: f64 = 0.05;

/// Sweep frequency of the diagnostic behavior [Hz].
const DIAGNOSTIC_FREQUENCY: f64 = 0.5;

// ─── DoNothing ──────────────────────────────────────────────────────

/// All joints off.
pub struct DoNothing {
    joints: Arc<JointMap>,
}

impl DoNothing {
    pub fn new(joints: Arc<JointMap>) -> Self {
        Self { joints }
    }
}

impl BehaviorState<HighLevelBehavior> for DoNothing {
    fn id(&self) -> HighLevelBehavior {
        HighLevelBehavior::DoNothing
    }

    fn do_action(&mut self, _: &RobotStateSnapshot, _: f64, command: &mut ControllerCoreCommand) {
        command.set_all_off(&self.joints);
    }
}

// ─── StandPrep ──────────────────────────────────────────────────────

/// Moves every joint from the pose measured on entry to its stand
/// position with a smooth cubic profile.
pub struct StandPrep {
    joints: Arc<JointMap>,
    duration: f64,
    start: [f64; MAX_JOINTS],
}

impl StandPrep {
    pub fn new(joints: Arc<JointMap>, duration: f64) -> Self {
        Self {
            joints,
            duration,
            start: [0.0; MAX_JOINTS],
        }
    }
}

/// Cubic ease-in/ease-out: returns `(s, ds/dt)` for `t` in `[0, duration]`.
fn smooth_step(t: f64, duration: f64) -> (f64, f64) {
    if duration <= 0.0 || t >= duration {
        return (1.0, 0.0);
    }
    let a = (t / duration).max(0.0);
    let s = a * a * (3.0 - 2.0 * a);
    let ds = 6.0 * a * (1.0 - a) / duration;
    (s, ds)
}

impl BehaviorState<HighLevelBehavior> for StandPrep {
    fn id(&self) -> HighLevelBehavior {
        HighLevelBehavior::StandPrep
    }

    fn on_entry(&mut self, snapshot: &RobotStateSnapshot) {
        for id in self.joints.ids() {
            self.start[id.index()] = snapshot.position(id).unwrap_or(0.0);
        }
    }

    fn do_action(
        &mut self,
        _: &RobotStateSnapshot,
        time_in_state: f64,
        command: &mut ControllerCoreCommand,
    ) {
        let (s, ds) = smooth_step(time_in_state, self.duration);
        for id in self.joints.ids() {
            let start = self.start[id.index()];
            let goal = self.joints.stand_position(id).unwrap_or(start);
            let delta = goal - start;
            command.push(JointDesired::position(id, start + delta * s, delta * ds));
        }
    }

    fn is_done(&self, time_in_state: f64) -> bool {
        time_in_state >= self.duration
    }
}

// ─── StandReady ─────────────────────────────────────────────────────

/// Holds the configured stand pose.
pub struct StandReady {
    joints: Arc<JointMap>,
}

impl StandReady {
    pub fn new(joints: Arc<JointMap>) -> Self {
        Self { joints }
    }
}

impl BehaviorState<HighLevelBehavior> for StandReady {
    fn id(&self) -> HighLevelBehavior {
        HighLevelBehavior::StandReady
    }

    fn do_action(&mut self, _: &RobotStateSnapshot, _: f64, command: &mut ControllerCoreCommand) {
        for id in self.joints.ids() {
            let goal = self.joints.stand_position(id).unwrap_or(0.0);
            command.push(JointDesired::position(id, goal, 0.0));
        }
    }
}

// ─── Freeze ─────────────────────────────────────────────────────────

/// Holds whatever pose was measured on entry.
pub struct Freeze {
    joints: Arc<JointMap>,
    hold: [f64; MAX_JOINTS],
}

impl Freeze {
    pub fn new(joints: Arc<JointMap>) -> Self {
        Self {
            joints,
            hold: [0.0; MAX_JOINTS],
        }
    }
}

impl BehaviorState<HighLevelBehavior> for Freeze {
    fn id(&self) -> HighLevelBehavior {
        HighLevelBehavior::Freeze
    }

    fn on_entry(&mut self, snapshot: &RobotStateSnapshot) {
        for id in self.joints.ids() {
            self.hold[id.index()] = snapshot.position(id).unwrap_or(0.0);
        }
    }

    fn do_action(&mut self, _: &RobotStateSnapshot, _: f64, command: &mut ControllerCoreCommand) {
        for id in self.joints.ids() {
            command.push(JointDesired::position(id, self.hold[id.index()], 0.0));
        }
    }
}

// ─── Diagnostic ─────────────────────────────────────────────────────

/// Small sinusoidal sweep of every joint around its stand position,
/// phase-shifted per joint.
pub struct Diagnostic {
    joints: Arc<JointMap>,
    first_tick: bool,
}

impl Diagnostic {
    pub fn new(joints: Arc<JointMap>) -> Self {
        Self {
            joints,
            first_tick: true,
        }
    }
}

impl BehaviorState<HighLevelBehavior> for Diagnostic {
    fn id(&self) -> HighLevelBehavior {
        HighLevelBehavior::Diagnostic
    }

    fn on_entry(&mut self, _: &RobotStateSnapshot) {
        self.first_tick = true;
    }

    fn do_action(
        &mut self,
        _: &RobotStateSnapshot,
        time_in_state: f64,
        command: &mut ControllerCoreCommand,
    ) {
        let omega = 2.0 * PI * DIAGNOSTIC_FREQUENCY;
        for id in self.joints.ids() {
            let phase = id.index() as f64 * PI / 4.0;
            let center = self.joints.stand_position(id).unwrap_or(0.0);
            let angle = omega * time_in_state + phase;
            let mut desired = JointDesired::position(
                id,
                center + DIAGNOSTIC_AMPLITUDE * angle.sin(),
                DIAGNOSTIC_AMPLITUDE * omega * angle.cos(),
            );
            desired.acceleration = Some(-DIAGNOSTIC_AMPLITUDE * omega * omega * angle.sin());
            desired.reset_integrators = self.first_tick;
            command.push(desired);
        }
        self.first_tick = false;
    }
}

// ─── Assembly ───────────────────────────────────────────────────────

/// Every built-in state, one per [`HighLevelBehavior`] variant.
pub fn builtin_states(
    joints: &Arc<JointMap>,
    config: &BehaviorConfig,
) -> Vec<Box<dyn BehaviorState<HighLevelBehavior>>> {
    vec![
        Box::new(DoNothing::new(Arc::clone(joints))),
        Box::new(StandPrep::new(Arc::clone(joints), config.stand_prep_duration_s)),
        Box::new(StandReady::new(Arc::clone(joints))),
        Box::new(Freeze::new(Arc::clone(joints))),
        Box::new(Diagnostic::new(Arc::clone(joints))),
    ]
}

/// Build the high-level state machine described by `[behavior]`.
pub fn build_machine(
    joints: &Arc<JointMap>,
    config: &BehaviorConfig,
) -> Result<
    (
        BehaviorStateMachine<HighLevelBehavior>,
        BehaviorRequester<HighLevelBehavior>,
    ),
    MachineError,
> {
    let mut builder = BehaviorStateMachine::builder()
        .initial(config.initial_state)
        .listening(config.listen_to_requests);

    for state in builtin_states(joints, config) {
        builder = builder.register(state);
    }
    if let Some(fallback) = config.fallback_state {
        builder = builder.fallback(fallback);
    }
    for &(from, to) in &config.finished_transitions {
        builder = builder.finished_transition(from, to);
    }
    if let Some(allowed) = &config.allowed_transitions {
        for &(from, to) in allowed {
            builder = builder.allow(from, to);
        }
    }
    builder.build()
}
