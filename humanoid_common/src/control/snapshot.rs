//! Robot state snapshot and raw sensor readings.
//!
//! A [`RobotStateSnapshot`] is built by the estimation task once per tick,
//! moved into the handoff buffer on publish, and is read-only from then on.
//! All joint data lives in fixed-size arrays sized by [`MAX_JOINTS`] plus a
//! `joint_count`, so building a snapshot never touches the heap.

use heapless::Vec as FixedVec;

use crate::consts::{MAX_FORCE_SENSORS, MAX_JOINTS};

use super::joint::JointId;

/// Root (pelvis) pose in world frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootPose {
    /// Position [m].
    pub position: [f64; 3],
    /// Orientation quaternion `[w, x, y, z]`.
    pub orientation: [f64; 4],
}

impl Default for RootPose {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            orientation: [1.0, 0.0, 0.0, 0.0],
        }
    }
}

/// Root (pelvis) twist in world frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RootTwist {
    /// Linear velocity [m/s].
    pub linear: [f64; 3],
    /// Angular velocity [rad/s].
    pub angular: [f64; 3],
}

/// Raw IMU sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuReading {
    /// Orientation quaternion `[w, x, y, z]`.
    pub orientation: [f64; 4],
    /// Angular velocity [rad/s].
    pub angular_velocity: [f64; 3],
    /// Linear acceleration [m/s²].
    pub linear_acceleration: [f64; 3],
}

impl Default for ImuReading {
    fn default() -> Self {
        Self {
            orientation: [1.0, 0.0, 0.0, 0.0],
            angular_velocity: [0.0; 3],
            linear_acceleration: [0.0; 3],
        }
    }
}

/// Raw six-axis force/torque sample (e.g. a foot sensor).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WrenchReading {
    /// Sensor index in the robot's sensor list.
    pub sensor: u8,
    /// Force [N].
    pub force: [f64; 3],
    /// Torque [Nm].
    pub torque: [f64; 3],
}

/// Raw readings pulled from the sensor collaborator for "now".
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReadings {
    /// Acquisition time [ns], monotonic clock.
    pub timestamp_ns: u64,
    /// Number of valid joint entries.
    pub joint_count: u16,
    /// Measured joint positions [rad].
    pub joint_positions: [f64; MAX_JOINTS],
    /// Measured joint velocities [rad/s].
    pub joint_velocities: [f64; MAX_JOINTS],
    /// Measured joint torques [Nm].
    pub joint_torques: [f64; MAX_JOINTS],
    /// IMU sample.
    pub imu: ImuReading,
    /// Force/torque samples.
    pub wrenches: FixedVec<WrenchReading, MAX_FORCE_SENSORS>,
}

impl SensorReadings {
    /// All-zero readings for `joint_count` joints (clamped to [`MAX_JOINTS`]).
    pub fn zeroed(joint_count: usize) -> Self {
        Self {
            timestamp_ns: 0,
            joint_count: joint_count.min(MAX_JOINTS) as u16,
            joint_positions: [0.0; MAX_JOINTS],
            joint_velocities: [0.0; MAX_JOINTS],
            joint_torques: [0.0; MAX_JOINTS],
            imu: ImuReading::default(),
            wrenches: FixedVec::new(),
        }
    }
}

/// One fully-formed, immutable estimate of robot state.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotStateSnapshot {
    /// Monotonically increasing sequence number (first published = 1).
    pub sequence: u64,
    /// Acquisition timestamp [ns], monotonic clock.
    pub timestamp_ns: u64,
    /// Number of valid joint entries.
    pub joint_count: u16,
    /// Joint positions [rad].
    pub joint_positions: [f64; MAX_JOINTS],
    /// Joint velocities [rad/s].
    pub joint_velocities: [f64; MAX_JOINTS],
    /// Joint torques [Nm].
    pub joint_torques: [f64; MAX_JOINTS],
    /// Estimated root pose.
    pub root_pose: RootPose,
    /// Estimated root twist.
    pub root_twist: RootTwist,
    /// Raw IMU sample used for this estimate.
    pub imu: ImuReading,
    /// Raw force/torque samples used for this estimate.
    pub wrenches: FixedVec<WrenchReading, MAX_FORCE_SENSORS>,
}

impl RobotStateSnapshot {
    /// Zeroed snapshot with sequence 0 for `joint_count` joints.
    pub fn zeroed(joint_count: usize) -> Self {
        Self {
            sequence: 0,
            timestamp_ns: 0,
            joint_count: joint_count.min(MAX_JOINTS) as u16,
            joint_positions: [0.0; MAX_JOINTS],
            joint_velocities: [0.0; MAX_JOINTS],
            joint_torques: [0.0; MAX_JOINTS],
            root_pose: RootPose::default(),
            root_twist: RootTwist::default(),
            imu: ImuReading::default(),
            wrenches: FixedVec::new(),
        }
    }

    /// Copy the raw measurements into this snapshot. Root pose and twist
    /// are left to the estimator.
    pub fn copy_measurements(&mut self, readings: &SensorReadings) {
        let n = readings.joint_count as usize;
        self.timestamp_ns = readings.timestamp_ns;
        self.joint_count = readings.joint_count;
        self.joint_positions[..n].copy_from_slice(&readings.joint_positions[..n]);
        self.joint_velocities[..n].copy_from_slice(&readings.joint_velocities[..n]);
        self.joint_torques[..n].copy_from_slice(&readings.joint_torques[..n]);
        self.imu = readings.imu;
        self.wrenches.clone_from(&readings.wrenches);
    }

    /// Valid joint positions.
    #[inline]
    pub fn positions(&self) -> &[f64] {
        &self.joint_positions[..self.joint_count as usize]
    }

    /// Valid joint velocities.
    #[inline]
    pub fn velocities(&self) -> &[f64] {
        &self.joint_velocities[..self.joint_count as usize]
    }

    /// Measured position of one joint.
    #[inline]
    pub fn position(&self, joint: JointId) -> Option<f64> {
        self.positions().get(joint.index()).copied()
    }

    /// Measured velocity of one joint.
    #[inline]
    pub fn velocity(&self, joint: JointId) -> Option<f64> {
        self.velocities().get(joint.index()).copied()
    }
}
