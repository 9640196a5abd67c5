//! Control task body.
//!
//! Fixed order per tick: snapshot read → state machine (decision +
//! `do_action`) → command sink → telemetry. Every fault is folded into a
//! [`TickFaults`] set and the counters; nothing escapes the tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use humanoid_common::control::command::ControllerCoreCommand;
use humanoid_common::control::fault::TickFaults;

use crate::behavior::BehaviorId;
use crate::cycle::{TaskBody, TickInfo};
use crate::handoff::SnapshotReader;
use crate::machine::BehaviorStateMachine;
use crate::sink::{CommandSink, OutputWriter};
use crate::telemetry::{ControlEvent, TelemetrySink};

/// Control counters, shared with health readers.
#[derive(Debug, Default)]
pub struct ControlStats {
    ticks: AtomicU64,
    fault_ticks: AtomicU64,
    overruns: AtomicU64,
    stale_reads: AtomicU64,
    skipped_snapshots: AtomicU64,
    no_snapshot: AtomicU64,
    accepted_commands: AtomicU64,
    invalid_commands: AtomicU64,
    controller_leads: AtomicU64,
    controller_lags: AtomicU64,
    last_delay_ns: AtomicU64,
    max_delay_ns: AtomicU64,
}

/// Point-in-time copy of [`ControlStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStatsSnapshot {
    pub ticks: u64,
    /// Ticks that raised at least one fault.
    pub fault_ticks: u64,
    pub overruns: u64,
    pub stale_reads: u64,
    /// Snapshots published but overwritten before this task read them.
    pub skipped_snapshots: u64,
    pub no_snapshot: u64,
    pub accepted_commands: u64,
    pub invalid_commands: u64,
    /// Ticks where the snapshot sequence advanced less than expected.
    pub controller_leads: u64,
    /// Ticks where the snapshot sequence advanced more than expected.
    pub controller_lags: u64,
    /// Control time minus snapshot timestamp [ns].
    pub last_delay_ns: u64,
    pub max_delay_ns: u64,
}

impl ControlStats {
    pub fn snapshot(&self) -> ControlStatsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        ControlStatsSnapshot {
            ticks: load(&self.ticks),
            fault_ticks: load(&self.fault_ticks),
            overruns: load(&self.overruns),
            stale_reads: load(&self.stale_reads),
            skipped_snapshots: load(&self.skipped_snapshots),
            no_snapshot: load(&self.no_snapshot),
            accepted_commands: load(&self.accepted_commands),
            invalid_commands: load(&self.invalid_commands),
            controller_leads: load(&self.controller_leads),
            controller_lags: load(&self.controller_lags),
            last_delay_ns: load(&self.last_delay_ns),
            max_delay_ns: load(&self.max_delay_ns),
        }
    }
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Periodic control work.
pub struct ControlTask<K: BehaviorId, W: OutputWriter, T> {
    reader: SnapshotReader,
    machine: BehaviorStateMachine<K>,
    sink: CommandSink<W>,
    telemetry: T,
    command: ControllerCoreCommand,
    stats: Arc<ControlStats>,
    /// Snapshots expected per control tick when the periods divide evenly.
    expected_advance: Option<u64>,
    last_sequence: u64,
}

impl<K, W, T> ControlTask<K, W, T>
where
    K: BehaviorId,
    W: OutputWriter,
    T: TelemetrySink<K>,
{
    pub fn new(
        reader: SnapshotReader,
        machine: BehaviorStateMachine<K>,
        sink: CommandSink<W>,
        telemetry: T,
        stats: Arc<ControlStats>,
        expected_advance: Option<u64>,
    ) -> Self {
        Self {
            reader,
            machine,
            sink,
            telemetry,
            command: ControllerCoreCommand::new(),
            stats,
            expected_advance,
            last_sequence: 0,
        }
    }

    /// Hand the machine, sink and telemetry back; the reader is dropped.
    pub fn into_parts(self) -> (BehaviorStateMachine<K>, CommandSink<W>, T) {
        (self.machine, self.sink, self.telemetry)
    }

    fn track_alignment(&mut self, sequence: u64) {
        if let Some(expected) = self.expected_advance {
            if self.last_sequence > 0 {
                let advance = sequence.saturating_sub(self.last_sequence);
                if advance < expected {
                    bump(&self.stats.controller_leads);
                } else if advance > expected {
                    bump(&self.stats.controller_lags);
                }
            }
        }
        self.last_sequence = sequence;
    }

    fn report(&mut self, tick: u64, faults: TickFaults) {
        if faults.is_empty() {
            return;
        }
        bump(&self.stats.fault_ticks);
        self.telemetry.record(&ControlEvent::Fault { tick, faults });
    }
}

impl<K, W, T> TaskBody for ControlTask<K, W, T>
where
    K: BehaviorId,
    W: OutputWriter,
    T: TelemetrySink<K>,
{
    fn tick(&mut self, info: &TickInfo) {
        bump(&self.stats.ticks);
        let mut faults = TickFaults::empty();
        if info.late {
            faults |= TickFaults::OVERRUN;
            bump(&self.stats.overruns);
        }

        let Some(read) = self.reader.read() else {
            faults |= TickFaults::NO_SNAPSHOT;
            bump(&self.stats.no_snapshot);
            self.sink.skip();
            self.report(info.index, faults);
            return;
        };
        if !read.fresh {
            faults |= TickFaults::STALE_READ;
            bump(&self.stats.stale_reads);
        }
        if read.skipped > 0 {
            self.stats
                .skipped_snapshots
                .fetch_add(read.skipped, Ordering::Relaxed);
        }
        self.track_alignment(read.snapshot.sequence);

        let delay = info.now_ns.saturating_sub(read.snapshot.timestamp_ns);
        self.stats.last_delay_ns.store(delay, Ordering::Relaxed);
        self.stats.max_delay_ns.fetch_max(delay, Ordering::Relaxed);

        let outcome = self
            .machine
            .tick(&read.snapshot, info.now_ns, &mut self.command);
        faults |= outcome.faults;
        if let Some(change) = outcome.transition {
            self.telemetry.record(&ControlEvent::StateChanged(change));
        }

        match self.sink.submit(&self.command) {
            Ok(()) => bump(&self.stats.accepted_commands),
            Err(error) => {
                faults |= TickFaults::INVALID_COMMAND;
                bump(&self.stats.invalid_commands);
                self.telemetry.record(&ControlEvent::CommandRejected {
                    tick: info.index,
                    error,
                });
            }
        }

        self.report(info.index, faults);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::BehaviorState;
    use crate::handoff::{self, SnapshotPublisher};
    use crate::machine::BehaviorRequester;
    use humanoid_common::control::behavior::HighLevelBehavior;
    use humanoid_common::control::command::JointDesired;
    use humanoid_common::control::joint::{JointId, JointMap};
    use humanoid_common::control::snapshot::RobotStateSnapshot;
    use parking_lot::Mutex;

    /// Writes an invalid command whenever the first joint reads negative.
    struct Echo;

    impl BehaviorState<HighLevelBehavior> for Echo {
        fn id(&self) -> HighLevelBehavior {
            HighLevelBehavior::DoNothing
        }
        fn do_action(&mut self, snap: &RobotStateSnapshot, _: f64, cmd: &mut ControllerCoreCommand) {
            let p = snap.joint_positions[0];
            if p < 0.0 {
                cmd.push(JointDesired::torque(JointId(9), p));
            } else {
                cmd.push(JointDesired::position(JointId(0), p, 0.0));
            }
        }
    }

    struct Idle(HighLevelBehavior);

    impl BehaviorState<HighLevelBehavior> for Idle {
        fn id(&self) -> HighLevelBehavior {
            self.0
        }
        fn do_action(&mut self, _: &RobotStateSnapshot, _: f64, cmd: &mut ControllerCoreCommand) {
            cmd.push(JointDesired::off(JointId(0)));
        }
    }

    #[derive(Default)]
    struct Applied(Arc<Mutex<Vec<f64>>>);

    impl OutputWriter for Applied {
        fn apply(&mut self, command: &ControllerCoreCommand) {
            let value = command.entries()[0].position.unwrap_or(f64::NAN);
            self.0.lock().push(value);
        }
    }

    type Events = Arc<Mutex<Vec<ControlEvent<HighLevelBehavior>>>>;

    struct Fixture {
        publisher: SnapshotPublisher,
        task: ControlTask<HighLevelBehavior, Applied, Box<dyn FnMut(&ControlEvent<HighLevelBehavior>) + Send>>,
        requester: BehaviorRequester<HighLevelBehavior>,
        applied: Arc<Mutex<Vec<f64>>>,
        events: Events,
        stats: Arc<ControlStats>,
        index: u64,
    }

    impl Fixture {
        fn new(expected_advance: Option<u64>) -> Self {
            let joints = Arc::new(JointMap::from_names(["hip"]).unwrap());
            let (publisher, reader) = handoff::channel(1);
            let (machine, requester) = BehaviorStateMachine::builder()
                .register(Box::new(Echo))
                .register(Box::new(Idle(HighLevelBehavior::Freeze)))
                .initial(HighLevelBehavior::DoNothing)
                .fallback(HighLevelBehavior::Freeze)
                .build()
                .unwrap();
            let applied = Arc::new(Mutex::new(Vec::new()));
            let sink = CommandSink::new(joints, Applied(Arc::clone(&applied)));
            let events = Events::default();
            let log = Arc::clone(&events);
            let telemetry: Box<dyn FnMut(&ControlEvent<HighLevelBehavior>) + Send> =
                Box::new(move |e| log.lock().push(e.clone()));
            let stats = Arc::new(ControlStats::default());
            let task = ControlTask::new(
                reader,
                machine,
                sink,
                telemetry,
                Arc::clone(&stats),
                expected_advance,
            );
            Self {
                publisher,
                task,
                requester,
                applied,
                events,
                stats,
                index: 0,
            }
        }

        fn publish(&mut self, sequence: u64, position: f64) {
            let mut snap = RobotStateSnapshot::zeroed(1);
            snap.sequence = sequence;
            snap.timestamp_ns = sequence * 1_000_000;
            snap.joint_positions[0] = position;
            self.publisher.publish(snap).unwrap();
        }

        fn tick(&mut self) {
            self.index += 1;
            let info = TickInfo {
                index: self.index,
                now_ns: self.index * 4_000_000,
                latency_ns: 0,
                late: false,
            };
            self.task.tick(&info);
        }

        fn faults(&self) -> Vec<TickFaults> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    ControlEvent::Fault { faults, .. } => Some(*faults),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn no_snapshot_skips_the_writer_without_running_the_machine() {
        let mut f = Fixture::new(None);
        f.tick();
        assert_eq!(f.faults(), vec![TickFaults::NO_SNAPSHOT]);
        assert!(f.applied.lock().is_empty());
        assert_eq!(f.task.sink.stats().skipped, 1);
        assert_eq!(f.requester.current(), None);
    }

    #[test]
    fn stale_read_still_runs_the_tick() {
        let mut f = Fixture::new(None);
        f.publish(1, 0.25);
        f.tick();
        f.tick();
        assert_eq!(*f.applied.lock(), vec![0.25, 0.25]);
        assert_eq!(f.faults(), vec![TickFaults::STALE_READ]);
        assert_eq!(f.stats.snapshot().stale_reads, 1);
    }

    #[test]
    fn invalid_command_dropped_then_next_accepted() {
        let mut f = Fixture::new(None);
        f.publish(1, -1.0);
        f.tick();
        f.publish(2, 0.5);
        f.tick();

        assert_eq!(*f.applied.lock(), vec![0.5]);
        let stats = f.stats.snapshot();
        assert_eq!(stats.invalid_commands, 1);
        assert_eq!(stats.accepted_commands, 1);
        assert!(f.events.lock().iter().any(|e| matches!(
            e,
            ControlEvent::CommandRejected { tick: 1, .. }
        )));
        assert_eq!(f.faults(), vec![TickFaults::INVALID_COMMAND]);
    }

    #[test]
    fn transitions_are_forwarded_to_telemetry() {
        let mut f = Fixture::new(None);
        f.publish(1, 0.0);
        f.tick();
        f.requester.signal_failure();
        f.publish(2, 0.0);
        f.tick();

        let changes: Vec<_> = f
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ControlEvent::StateChanged(c) => Some(c.to),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![HighLevelBehavior::DoNothing, HighLevelBehavior::Freeze]
        );
    }

    #[test]
    fn alignment_counts_leads_and_lags() {
        let mut f = Fixture::new(Some(4));
        f.publish(1, 0.0);
        f.tick();
        f.publish(5, 0.0);
        f.tick(); // advanced 4
        f.publish(7, 0.0);
        f.tick(); // advanced 2: lead
        f.publish(13, 0.0);
        f.tick(); // advanced 6: lag

        let stats = f.stats.snapshot();
        assert_eq!(stats.controller_leads, 1);
        assert_eq!(stats.controller_lags, 1);
        assert_eq!(stats.skipped_snapshots, 3 + 1 + 5);
        assert_eq!(stats.last_delay_ns, 16_000_000 - 13_000_000);
        assert_eq!(stats.max_delay_ns, 12_000_000 - 7_000_000);
    }
}
