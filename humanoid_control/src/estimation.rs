//! Estimation task body: sensors → estimator → handoff publish.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use humanoid_common::control::snapshot::{RobotStateSnapshot, SensorReadings};
use tracing::warn;

use crate::cycle::{TaskBody, TickInfo};
use crate::error::SensorError;
use crate::handoff::SnapshotPublisher;
use crate::telemetry::should_log;

/// Raw sensor collaborator, pulled once per estimation tick.
pub trait SensorReader: Send + 'static {
    /// Fill `readings` for "now". `readings.timestamp_ns` arrives set to
    /// the tick time; overwrite it with the acquisition time if known.
    fn read(&mut self, now_ns: u64, readings: &mut SensorReadings) -> Result<(), SensorError>;
}

/// State estimator collaborator.
pub trait StateEstimator: Send + 'static {
    /// Called once with the first successful sensor readings.
    fn initialize(&mut self, _readings: &SensorReadings) {}

    /// Write a complete estimate into `snapshot`. Sequence is stamped by
    /// the task afterwards.
    fn estimate(&mut self, readings: &SensorReadings, snapshot: &mut RobotStateSnapshot);
}

/// Copies raw readings through; root orientation and angular rate come
/// straight from the IMU.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughEstimator;

impl StateEstimator for PassThroughEstimator {
    fn estimate(&mut self, readings: &SensorReadings, snapshot: &mut RobotStateSnapshot) {
        snapshot.copy_measurements(readings);
        snapshot.root_pose.orientation = readings.imu.orientation;
        snapshot.root_twist.angular = readings.imu.angular_velocity;
    }
}

/// Estimation counters, shared with health readers.
#[derive(Debug, Default)]
pub struct EstimationStats {
    published: AtomicU64,
    sensor_faults: AtomicU64,
    publish_errors: AtomicU64,
}

/// Point-in-time copy of [`EstimationStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EstimationStatsSnapshot {
    pub published: u64,
    pub sensor_faults: u64,
    pub publish_errors: u64,
}

impl EstimationStats {
    pub fn snapshot(&self) -> EstimationStatsSnapshot {
        EstimationStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            sensor_faults: self.sensor_faults.load(Ordering::Relaxed),
            publish_errors: self.publish_errors.load(Ordering::Relaxed),
        }
    }
}

/// Periodic estimation work.
///
/// Each successful tick publishes exactly one snapshot; sequence numbers
/// are consecutive from 1. A failed sensor read publishes nothing.
pub struct EstimationTask<S, E> {
    sensors: S,
    estimator: E,
    publisher: SnapshotPublisher,
    readings: SensorReadings,
    initialized: bool,
    stats: Arc<EstimationStats>,
}

impl<S: SensorReader, E: StateEstimator> EstimationTask<S, E> {
    pub fn new(
        sensors: S,
        estimator: E,
        publisher: SnapshotPublisher,
        joint_count: usize,
        stats: Arc<EstimationStats>,
    ) -> Self {
        Self {
            sensors,
            estimator,
            publisher,
            readings: SensorReadings::zeroed(joint_count),
            initialized: false,
            stats,
        }
    }

    /// Hand the collaborators back; the publisher is dropped.
    pub fn into_parts(self) -> (S, E) {
        (self.sensors, self.estimator)
    }
}

impl<S: SensorReader, E: StateEstimator> TaskBody for EstimationTask<S, E> {
    fn tick(&mut self, info: &TickInfo) {
        self.readings.timestamp_ns = info.now_ns;
        if let Err(e) = self.sensors.read(info.now_ns, &mut self.readings) {
            let count = self.stats.sensor_faults.fetch_add(1, Ordering::Relaxed) + 1;
            if should_log(count) {
                warn!(
                    "Estimation tick {}: sensor read failed: {} (#{})",
                    info.index, e, count
                );
            }
            return;
        }

        if !self.initialized {
            self.estimator.initialize(&self.readings);
            self.initialized = true;
        }

        let sequence = self.publisher.last_sequence() + 1;
        let snapshot = self.publisher.in_progress();
        self.estimator.estimate(&self.readings, snapshot);
        snapshot.sequence = sequence;

        match self.publisher.publish_in_progress() {
            Ok(_) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let count = self.stats.publish_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if should_log(count) {
                    warn!("Estimation tick {}: publish failed: {} (#{})", info.index, e, count);
                }
            }
        }
    }
}
