//! Controller core command: the per-tick output of the active behavior.
//!
//! A command is an ordered list of per-joint desired data. It is cleared
//! and rebuilt from scratch every control tick, validated structurally by
//! the command sink, and handed to the output layer. Storage is a
//! fixed-capacity `heapless::Vec`, so building a command never allocates.

use heapless::Vec as FixedVec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::MAX_JOINTS;

use super::joint::{JointId, JointMap};

/// Low-level control mode of one joint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JointControlMode {
    /// No output; the drive is left passive.
    Off = 0,
    /// Position servo on the drive (desired position required).
    Position = 1,
    /// Torque/force control (desired torque required).
    Torque = 2,
}

impl JointControlMode {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::Position),
            2 => Some(Self::Torque),
            _ => None,
        }
    }
}

/// Desired data for one joint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointDesired {
    /// Target joint.
    pub joint: JointId,
    /// Control mode.
    pub mode: JointControlMode,
    /// Desired position [rad].
    pub position: Option<f64>,
    /// Desired velocity [rad/s].
    pub velocity: Option<f64>,
    /// Desired torque [Nm] (feed-forward in position mode).
    pub torque: Option<f64>,
    /// Desired acceleration [rad/s²].
    pub acceleration: Option<f64>,
    /// Ask the drive to reset its integrators this tick.
    pub reset_integrators: bool,
}

impl JointDesired {
    /// Joint switched off.
    pub const fn off(joint: JointId) -> Self {
        Self {
            joint,
            mode: JointControlMode::Off,
            position: None,
            velocity: None,
            torque: None,
            acceleration: None,
            reset_integrators: false,
        }
    }

    /// Position servo to `position` with feed-forward `velocity`.
    pub const fn position(joint: JointId, position: f64, velocity: f64) -> Self {
        Self {
            joint,
            mode: JointControlMode::Position,
            position: Some(position),
            velocity: Some(velocity),
            torque: None,
            acceleration: None,
            reset_integrators: false,
        }
    }

    /// Pure torque control.
    pub const fn torque(joint: JointId, torque: f64) -> Self {
        Self {
            joint,
            mode: JointControlMode::Torque,
            position: None,
            velocity: None,
            torque: Some(torque),
            acceleration: None,
            reset_integrators: false,
        }
    }
}

/// Structural command defects detected by [`ControllerCoreCommand::validate`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    /// The command references a joint outside the joint table.
    #[error("unknown joint id {0:?}")]
    UnknownJoint(JointId),

    /// The same joint appears more than once.
    #[error("joint {0:?} commanded more than once")]
    DuplicateJoint(JointId),

    /// The mode requires a value that was not supplied.
    #[error("joint {joint:?} in {mode:?} mode is missing its {field}")]
    MissingValue {
        joint: JointId,
        mode: JointControlMode,
        field: &'static str,
    },

    /// The mode forbids a value that was supplied.
    #[error("joint {joint:?} in {mode:?} mode carries an unexpected {field}")]
    UnexpectedValue {
        joint: JointId,
        mode: JointControlMode,
        field: &'static str,
    },

    /// A supplied value is NaN or infinite.
    #[error("joint {joint:?} has a non-finite {field}")]
    NonFinite { joint: JointId, field: &'static str },

    /// More entries than [`MAX_JOINTS`] were pushed.
    #[error("command joint capacity exceeded")]
    CapacityExceeded,
}

/// Ordered collection of per-joint desired data for one control tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerCoreCommand {
    entries: FixedVec<JointDesired, MAX_JOINTS>,
    overflowed: bool,
}

impl ControllerCoreCommand {
    /// Empty command.
    pub const fn new() -> Self {
        Self {
            entries: FixedVec::new(),
            overflowed: false,
        }
    }

    /// Drop every entry; called before each `do_action`.
    #[inline]
    pub fn clear(&mut self) {
        self.entries.clear();
        self.overflowed = false;
    }

    /// Append one joint entry.
    ///
    /// On overflow the entry is dropped and the command is marked so that
    /// validation rejects it as a whole.
    pub fn push(&mut self, desired: JointDesired) {
        if self.entries.push(desired).is_err() {
            self.overflowed = true;
        }
    }

    /// Entries in insertion order.
    #[inline]
    pub fn entries(&self) -> &[JointDesired] {
        &self.entries
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no joint is commanded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry for `joint`, if commanded.
    pub fn get(&self, joint: JointId) -> Option<&JointDesired> {
        self.entries.iter().find(|e| e.joint == joint)
    }

    /// Switch every joint of `joints` off.
    pub fn set_all_off(&mut self, joints: &JointMap) {
        for id in joints.ids() {
            self.push(JointDesired::off(id));
        }
    }

    /// Structural validation against the joint table.
    ///
    /// Checks joint membership, duplicates, mode/value consistency and
    /// finiteness. Performs no interpretation of the values.
    pub fn validate(&self, joints: &JointMap) -> Result<(), CommandError> {
        if self.overflowed {
            return Err(CommandError::CapacityExceeded);
        }

        let mut seen = [false; MAX_JOINTS];
        for entry in &self.entries {
            let joint = entry.joint;
            if !joints.contains(joint) {
                return Err(CommandError::UnknownJoint(joint));
            }
            if seen[joint.index()] {
                return Err(CommandError::DuplicateJoint(joint));
            }
            seen[joint.index()] = true;

            validate_entry(entry)?;
        }
        Ok(())
    }
}

fn validate_entry(entry: &JointDesired) -> Result<(), CommandError> {
    let joint = entry.joint;
    let mode = entry.mode;

    let fields = [
        ("position", entry.position),
        ("velocity", entry.velocity),
        ("torque", entry.torque),
        ("acceleration", entry.acceleration),
    ];
    for (field, value) in fields {
        if let Some(v) = value {
            if !v.is_finite() {
                return Err(CommandError::NonFinite { joint, field });
            }
        }
    }

    match mode {
        JointControlMode::Off => {
            if let Some((field, _)) = fields.iter().find(|(_, v)| v.is_some()) {
                return Err(CommandError::UnexpectedValue { joint, mode, field });
            }
        }
        JointControlMode::Position => {
            if entry.position.is_none() {
                return Err(CommandError::MissingValue {
                    joint,
                    mode,
                    field: "position",
                });
            }
        }
        JointControlMode::Torque => {
            if entry.torque.is_none() {
                return Err(CommandError::MissingValue {
                    joint,
                    mode,
                    field: "torque",
                });
            }
            if entry.position.is_some() {
                return Err(CommandError::UnexpectedValue {
                    joint,
                    mode,
                    field: "position",
                });
            }
        }
    }
    Ok(())
}
