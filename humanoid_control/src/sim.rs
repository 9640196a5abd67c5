//! Simulated robot: sensor reader and output writer sharing one plant.
//!
//! Position-mode joints track their target with a first-order lag, torque
//! mode integrates a damped drift, off joints coast to rest. The writer
//! side only stores targets in atomics; the plant is stepped by the
//! sensor side on the estimation thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use humanoid_common::consts::MAX_JOINTS;
use humanoid_common::control::command::{ControllerCoreCommand, JointControlMode};
use humanoid_common::control::joint::{JointId, JointMap};
use humanoid_common::control::snapshot::{SensorReadings, WrenchReading};

use crate::error::SensorError;
use crate::estimation::SensorReader;
use crate::sink::OutputWriter;

/// Position tracking time constant [s].
const TRACKING_TAU: f64 = 0.05;

/// Torque-to-acceleration gain of the drift model [rad/s² per Nm].
const TORQUE_GAIN: f64 = 0.5;

/// Velocity damping in torque and off modes [1/s].
const DAMPING: f64 = 5.0;

/// Largest integration step [s]; longer gaps are clamped.
const MAX_STEP: f64 = 0.05;

/// Vertical load per foot sensor [N].
const FOOT_LOAD: f64 = 300.0;

fn atomic_array<T, const N: usize>(init: impl Fn() -> T) -> [T; N] {
    std::array::from_fn(|_| init())
}

struct SimShared {
    joint_count: usize,
    mode: [AtomicU8; MAX_JOINTS],
    target: [AtomicU64; MAX_JOINTS],
    torque: [AtomicU64; MAX_JOINTS],
    position: [AtomicU64; MAX_JOINTS],
    applied: AtomicU64,
    skipped: AtomicU64,
    fail_reads: AtomicBool,
}

impl SimShared {
    fn load(cell: &AtomicU64) -> f64 {
        f64::from_bits(cell.load(Ordering::Relaxed))
    }

    fn store(cell: &AtomicU64, value: f64) {
        cell.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Build the sensor/writer pair plus an observer handle.
pub fn simulated_robot(joints: &JointMap) -> (SimSensors, SimWriter, SimHandle) {
    let shared = Arc::new(SimShared {
        joint_count: joints.len(),
        mode: atomic_array(|| AtomicU8::new(JointControlMode::Off as u8)),
        target: atomic_array(|| AtomicU64::new(0f64.to_bits())),
        torque: atomic_array(|| AtomicU64::new(0f64.to_bits())),
        position: atomic_array(|| AtomicU64::new(0f64.to_bits())),
        applied: AtomicU64::new(0),
        skipped: AtomicU64::new(0),
        fail_reads: AtomicBool::new(false),
    });
    let sensors = SimSensors {
        shared: Arc::clone(&shared),
        position: [0.0; MAX_JOINTS],
        velocity: [0.0; MAX_JOINTS],
        last_ns: None,
    };
    let writer = SimWriter {
        shared: Arc::clone(&shared),
    };
    (sensors, writer, SimHandle { shared })
}

// ─── Sensors ────────────────────────────────────────────────────────

/// Sensor side of the simulated plant.
pub struct SimSensors {
    shared: Arc<SimShared>,
    position: [f64; MAX_JOINTS],
    velocity: [f64; MAX_JOINTS],
    last_ns: Option<u64>,
}

impl SimSensors {
    fn step(&mut self, dt: f64) {
        let alpha = 1.0 - (-dt / TRACKING_TAU).exp();
        for i in 0..self.shared.joint_count {
            let mode = JointControlMode::from_u8(self.shared.mode[i].load(Ordering::Relaxed))
                .unwrap_or(JointControlMode::Off);
            let before = self.position[i];
            match mode {
                JointControlMode::Position => {
                    let target = SimShared::load(&self.shared.target[i]);
                    self.position[i] += (target - before) * alpha;
                    self.velocity[i] = if dt > 0.0 {
                        (self.position[i] - before) / dt
                    } else {
                        0.0
                    };
                }
                JointControlMode::Torque => {
                    let torque = SimShared::load(&self.shared.torque[i]);
                    self.velocity[i] += (TORQUE_GAIN * torque - DAMPING * self.velocity[i]) * dt;
                    self.position[i] += self.velocity[i] * dt;
                }
                JointControlMode::Off => {
                    self.velocity[i] -= DAMPING * self.velocity[i] * dt;
                    self.position[i] += self.velocity[i] * dt;
                }
            }
            SimShared::store(&self.shared.position[i], self.position[i]);
        }
    }
}

impl SensorReader for SimSensors {
    fn read(&mut self, now_ns: u64, readings: &mut SensorReadings) -> Result<(), SensorError> {
        if self.shared.fail_reads.load(Ordering::Relaxed) {
            return Err(SensorError::Unavailable("sim"));
        }
        let dt = self
            .last_ns
            .map_or(0.0, |last| now_ns.saturating_sub(last) as f64 * 1e-9)
            .min(MAX_STEP);
        self.last_ns = Some(now_ns);
        self.step(dt);

        let n = self.shared.joint_count;
        readings.timestamp_ns = now_ns;
        readings.joint_count = n as u16;
        readings.joint_positions[..n].copy_from_slice(&self.position[..n]);
        readings.joint_velocities[..n].copy_from_slice(&self.velocity[..n]);
        for i in 0..n {
            readings.joint_torques[i] = SimShared::load(&self.shared.torque[i]);
        }
        readings.wrenches.clear();
        for sensor in 0..2u8 {
            let _ = readings.wrenches.push(WrenchReading {
                sensor,
                force: [0.0, 0.0, FOOT_LOAD],
                torque: [0.0; 3],
            });
        }
        Ok(())
    }
}

// ─── Writer ─────────────────────────────────────────────────────────

/// Output side of the simulated plant.
pub struct SimWriter {
    shared: Arc<SimShared>,
}

impl OutputWriter for SimWriter {
    fn initialize(&mut self, joints: &JointMap) {
        for id in joints.ids() {
            self.shared.mode[id.index()].store(JointControlMode::Off as u8, Ordering::Relaxed);
        }
    }

    fn apply(&mut self, command: &ControllerCoreCommand) {
        for entry in command.entries() {
            let i = entry.joint.index();
            self.shared.mode[i].store(entry.mode as u8, Ordering::Relaxed);
            if let Some(p) = entry.position {
                SimShared::store(&self.shared.target[i], p);
            }
            SimShared::store(&self.shared.torque[i], entry.torque.unwrap_or(0.0));
        }
        self.shared.applied.fetch_add(1, Ordering::Relaxed);
    }

    fn skip(&mut self) {
        // Hold the last targets.
        self.shared.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

// ─── Observer ───────────────────────────────────────────────────────

/// Test and CLI view of the simulated plant.
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<SimShared>,
}

impl SimHandle {
    /// Make every sensor read fail until cleared.
    pub fn set_sensor_fault(&self, failing: bool) {
        self.shared.fail_reads.store(failing, Ordering::Relaxed);
    }

    /// Commands applied so far.
    pub fn applied(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// Ticks the writer was told to skip.
    pub fn skipped(&self) -> u64 {
        self.shared.skipped.load(Ordering::Relaxed)
    }

    /// Last commanded mode of a joint.
    pub fn mode(&self, joint: JointId) -> Option<JointControlMode> {
        let cell = self.shared.mode.get(joint.index())?;
        JointControlMode::from_u8(cell.load(Ordering::Relaxed))
    }

    /// Last commanded position target of a joint.
    pub fn target(&self, joint: JointId) -> Option<f64> {
        self.shared.target.get(joint.index()).map(SimShared::load)
    }

    /// Simulated position of a joint.
    pub fn position(&self, joint: JointId) -> Option<f64> {
        self.shared.position.get(joint.index()).map(SimShared::load)
    }
}
