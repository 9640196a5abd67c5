//! Dual-rate scheduler: estimation task + control task around one handoff.
//!
//! ## Startup
//! 1. `mlockall` (if configured; no-op without `rt`).
//! 2. Spawn the estimation task.
//! 3. Block until the first snapshot is published or the startup timeout
//!    elapses. On timeout the estimation task is stopped and `start()`
//!    fails.
//! 4. Spawn the control task.
//!
//! ## Shutdown
//! Control is stopped and joined first, then estimation. Both tasks stop
//! cooperatively between ticks. The collaborators are handed back to the
//! scheduler so it can be started again.

use std::sync::Arc;

use humanoid_common::control::config::{ControllerConfig, StartupConfig, TaskConfig};
use humanoid_common::control::joint::JointMap;
use humanoid_common::control::snapshot::RobotStateSnapshot;
use tracing::{error, info, warn};

use crate::behavior::BehaviorId;
use crate::control::{ControlStats, ControlStatsSnapshot, ControlTask};
use crate::cycle::{PeriodicRealtimeTask, TaskHandle, TaskHealth, TaskHealthSnapshot, lock_memory};
use crate::error::SchedulerError;
use crate::estimation::{
    EstimationStats, EstimationStatsSnapshot, EstimationTask, SensorReader, StateEstimator,
};
use crate::handoff::{self, HandoffProbe};
use crate::machine::{BehaviorRequester, BehaviorStateMachine, MachineStats};
use crate::sink::{CommandSink, OutputWriter};
use crate::telemetry::TelemetrySink;

/// Timing configuration of both tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub estimation: TaskConfig,
    pub control: TaskConfig,
    pub startup: StartupConfig,
}

impl SchedulerSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            estimation: config.estimation.clone(),
            control: config.control.clone(),
            startup: config.startup.clone(),
        }
    }

    /// Snapshots expected per control tick, when the control period is an
    /// integer multiple of the estimation period.
    pub fn rate_ratio(&self) -> Option<u64> {
        let est = u64::from(self.estimation.period_us);
        let ctl = u64::from(self.control.period_us);
        (est > 0 && ctl % est == 0).then_some(ctl / est)
    }
}

/// Collaborators run by the two tasks.
pub struct SchedulerParts<K: BehaviorId, S, E, W: OutputWriter, T> {
    pub sensors: S,
    pub estimator: E,
    pub machine: BehaviorStateMachine<K>,
    pub sink: CommandSink<W>,
    pub telemetry: T,
}

/// Health of both tasks and the arbitration layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerHealth<K> {
    pub running: bool,
    pub estimation: TaskHealthSnapshot,
    pub control: TaskHealthSnapshot,
    pub estimation_stats: EstimationStatsSnapshot,
    pub control_stats: ControlStatsSnapshot,
    pub machine: MachineStats,
    pub current_state: Option<K>,
    pub last_published: u64,
}

struct Running<K, S, E, W, T>
where
    K: BehaviorId,
    S: SensorReader,
    E: StateEstimator,
    W: OutputWriter,
    T: TelemetrySink<K>,
{
    // Dropped first: control must stop before estimation.
    control: TaskHandle<ControlTask<K, W, T>>,
    estimation: TaskHandle<EstimationTask<S, E>>,
}

/// Owner of the estimation and control tasks.
pub struct DualRateScheduler<K, S, E, W, T>
where
    K: BehaviorId,
    S: SensorReader,
    E: StateEstimator,
    W: OutputWriter,
    T: TelemetrySink<K>,
{
    settings: SchedulerSettings,
    joints: Arc<JointMap>,
    parts: Option<SchedulerParts<K, S, E, W, T>>,
    running: Option<Running<K, S, E, W, T>>,
    requester: BehaviorRequester<K>,
    estimation_stats: Arc<EstimationStats>,
    control_stats: Arc<ControlStats>,
    estimation_health: Arc<TaskHealth>,
    control_health: Arc<TaskHealth>,
    probe: Option<HandoffProbe>,
}

impl<K, S, E, W, T> DualRateScheduler<K, S, E, W, T>
where
    K: BehaviorId,
    S: SensorReader,
    E: StateEstimator,
    W: OutputWriter,
    T: TelemetrySink<K>,
{
    pub fn new(
        settings: SchedulerSettings,
        joints: Arc<JointMap>,
        parts: SchedulerParts<K, S, E, W, T>,
    ) -> Self {
        let requester = parts.machine.requester();
        Self {
            settings,
            joints,
            parts: Some(parts),
            running: None,
            requester,
            estimation_stats: Arc::new(EstimationStats::default()),
            control_stats: Arc::new(ControlStats::default()),
            estimation_health: Arc::new(TaskHealth::default()),
            control_health: Arc::new(TaskHealth::default()),
            probe: None,
        }
    }

    /// Transition request / failure signal handle.
    pub fn requester(&self) -> BehaviorRequester<K> {
        self.requester.clone()
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Start both tasks. Blocks until the first snapshot is published.
    ///
    /// # Errors
    /// - `AlreadyRunning` / `Consumed` on misuse.
    /// - `RtSetup` / `Spawn` if a task thread could not be set up; the
    ///   collaborators of that task are lost and the scheduler reports
    ///   `Consumed` from then on.
    /// - `StartupTimeout` if no snapshot appeared in time. The scheduler
    ///   can be started again, unless the estimation thread panicked: its
    ///   collaborators are then lost and later calls report `Consumed`.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let parts = self.parts.take().ok_or(SchedulerError::Consumed)?;

        if self.settings.startup.lock_memory {
            if let Err(e) = lock_memory() {
                self.parts = Some(parts);
                return Err(e);
            }
        }

        let SchedulerParts {
            sensors,
            estimator,
            machine,
            sink,
            telemetry,
        } = parts;

        let (publisher, reader) = handoff::channel(self.joints.len());
        self.probe = Some(reader.probe());

        let body = EstimationTask::new(
            sensors,
            estimator,
            publisher,
            self.joints.len(),
            Arc::clone(&self.estimation_stats),
        );
        let estimation = PeriodicRealtimeTask::new(self.settings.estimation.clone()).spawn(body)?;
        self.estimation_health = estimation.health_handle();

        let timeout = self.settings.startup.first_snapshot_timeout();
        if let Err(e) = reader.wait_for_first(timeout) {
            error!("Startup failed: {e}");
            match estimation.stop_and_join() {
                Ok(body) => {
                    let (sensors, estimator) = body.into_parts();
                    self.parts = Some(SchedulerParts {
                        sensors,
                        estimator,
                        machine,
                        sink,
                        telemetry,
                    });
                }
                Err(stop_err) => warn!("Estimation task lost during startup: {stop_err}"),
            }
            return Err(SchedulerError::StartupTimeout { waited: timeout });
        }

        let expected_advance = self.settings.rate_ratio();
        let body = ControlTask::new(
            reader,
            machine,
            sink,
            telemetry,
            Arc::clone(&self.control_stats),
            expected_advance,
        );
        let control = match PeriodicRealtimeTask::new(self.settings.control.clone()).spawn(body) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(stop_err) = estimation.stop_and_join() {
                    warn!("Estimation task failed while aborting startup: {stop_err}");
                }
                return Err(e);
            }
        };
        self.control_health = control.health_handle();

        match expected_advance {
            Some(n) => info!(
                "Scheduler running: estimation {}us, control {}us ({} snapshots per control tick)",
                self.settings.estimation.period_us, self.settings.control.period_us, n
            ),
            None => info!(
                "Scheduler running: estimation {}us, control {}us (no fixed ratio)",
                self.settings.estimation.period_us, self.settings.control.period_us
            ),
        }
        self.running = Some(Running {
            control,
            estimation,
        });
        Ok(())
    }

    /// Stop both tasks and join their threads.
    pub fn stop(&mut self) -> Result<(), SchedulerError> {
        let Running {
            control,
            estimation,
        } = self.running.take().ok_or(SchedulerError::NotRunning)?;

        let control = control.stop_and_join();
        let estimation = estimation.stop_and_join();
        match (control, estimation) {
            (Ok(control), Ok(estimation)) => {
                let (machine, sink, telemetry) = control.into_parts();
                let (sensors, estimator) = estimation.into_parts();
                self.parts = Some(SchedulerParts {
                    sensors,
                    estimator,
                    machine,
                    sink,
                    telemetry,
                });
                info!("Scheduler stopped");
                Ok(())
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Scheduler stopped with error: {e}");
                Err(e)
            }
        }
    }

    /// Counters of both tasks and the state machine.
    pub fn health(&self) -> SchedulerHealth<K> {
        SchedulerHealth {
            running: self.running.is_some(),
            estimation: self.estimation_health.snapshot(),
            control: self.control_health.snapshot(),
            estimation_stats: self.estimation_stats.snapshot(),
            control_stats: self.control_stats.snapshot(),
            machine: self.requester.stats(),
            current_state: self.requester.current(),
            last_published: self.probe.as_ref().map_or(0, HandoffProbe::last_published),
        }
    }

    /// Copy of the latest published snapshot, for readers outside the
    /// control loop.
    pub fn latest_snapshot(&self) -> Option<Arc<RobotStateSnapshot>> {
        self.probe.as_ref().and_then(HandoffProbe::latest)
    }

    /// Collaborators, when stopped.
    pub fn parts(&self) -> Option<&SchedulerParts<K, S, E, W, T>> {
        self.parts.as_ref()
    }

    /// Stop if running and hand the collaborators back.
    pub fn into_parts(mut self) -> Result<SchedulerParts<K, S, E, W, T>, SchedulerError> {
        if self.running.is_some() {
            self.stop()?;
        }
        self.parts.take().ok_or(SchedulerError::Consumed)
    }
}
