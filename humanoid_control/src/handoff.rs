//! State handoff buffer: single-producer / single-consumer snapshot slot.
//!
//! The estimation task owns the [`SnapshotPublisher`], the control task
//! owns the [`SnapshotReader`]. Each published snapshot is a complete,
//! independently owned `Arc<RobotStateSnapshot>` swapped atomically into a
//! single slot, so a reader sees either the previous snapshot or the new
//! one, never a mix. Neither side blocks the other.
//!
//! The publisher keeps one "in-progress" snapshot. After a publish the
//! snapshot displaced from the slot becomes the next in-progress buffer;
//! it is reused in place when the reader no longer holds it and copied
//! otherwise, so published data is never mutated.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use humanoid_common::control::snapshot::RobotStateSnapshot;
use parking_lot::{Condvar, Mutex};

use crate::error::HandoffError;

struct Shared {
    slot: ArcSwapOption<RobotStateSnapshot>,
    last_published: AtomicU64,
    first_published: Mutex<bool>,
    first_cv: Condvar,
}

/// Create a connected publisher/reader pair for `joint_count` joints.
pub fn channel(joint_count: usize) -> (SnapshotPublisher, SnapshotReader) {
    let shared = Arc::new(Shared {
        slot: ArcSwapOption::empty(),
        last_published: AtomicU64::new(0),
        first_published: Mutex::new(false),
        first_cv: Condvar::new(),
    });
    let publisher = SnapshotPublisher {
        shared: Arc::clone(&shared),
        spare: Some(Arc::new(RobotStateSnapshot::zeroed(joint_count))),
        joint_count,
        last_sequence: 0,
        announced: false,
    };
    let reader = SnapshotReader {
        shared,
        last_seen: 0,
    };
    (publisher, reader)
}

// ─── Producer ───────────────────────────────────────────────────────

/// Producer side. Not `Clone`: there is exactly one publisher.
pub struct SnapshotPublisher {
    shared: Arc<Shared>,
    spare: Option<Arc<RobotStateSnapshot>>,
    joint_count: usize,
    last_sequence: u64,
    announced: bool,
}

impl SnapshotPublisher {
    /// Snapshot being built for the next publish.
    ///
    /// Copies the recycled buffer first if the reader still holds it.
    pub fn in_progress(&mut self) -> &mut RobotStateSnapshot {
        let joint_count = self.joint_count;
        let spare = self
            .spare
            .get_or_insert_with(|| Arc::new(RobotStateSnapshot::zeroed(joint_count)));
        Arc::make_mut(spare)
    }

    /// Publish the in-progress snapshot. Returns its sequence number.
    pub fn publish_in_progress(&mut self) -> Result<u64, HandoffError> {
        let built = self.spare.take().ok_or(HandoffError::NothingInProgress)?;
        if let Err(e) = self.check_sequence(built.sequence) {
            self.spare = Some(built);
            return Err(e);
        }
        Ok(self.store(built))
    }

    /// Move a fully built snapshot into the slot. Returns its sequence.
    ///
    /// # Errors
    /// `HandoffError::NonMonotonic` if `snapshot.sequence` does not exceed
    /// the last published sequence; the slot is left untouched.
    pub fn publish(&mut self, snapshot: RobotStateSnapshot) -> Result<u64, HandoffError> {
        self.check_sequence(snapshot.sequence)?;
        Ok(self.store(Arc::new(snapshot)))
    }

    /// Last successfully published sequence (0 before the first publish).
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    fn check_sequence(&self, attempted: u64) -> Result<(), HandoffError> {
        if attempted <= self.last_sequence {
            return Err(HandoffError::NonMonotonic {
                last: self.last_sequence,
                attempted,
            });
        }
        Ok(())
    }

    fn store(&mut self, snapshot: Arc<RobotStateSnapshot>) -> u64 {
        let sequence = snapshot.sequence;
        let displaced = self.shared.slot.swap(Some(snapshot));
        self.last_sequence = sequence;
        self.shared
            .last_published
            .store(sequence, Ordering::Release);
        if self.spare.is_none() {
            self.spare = displaced;
        }

        if !self.announced {
            self.announced = true;
            *self.shared.first_published.lock() = true;
            self.shared.first_cv.notify_all();
        }
        sequence
    }
}

// ─── Consumer ───────────────────────────────────────────────────────

/// Result of one consumer read.
#[derive(Debug, Clone)]
pub struct SnapshotRead {
    /// The latest published snapshot.
    pub snapshot: Arc<RobotStateSnapshot>,
    /// False when this sequence was already consumed by a previous read.
    pub fresh: bool,
    /// Published snapshots that were overwritten before being read.
    pub skipped: u64,
}

/// Consumer side. Not `Clone`: there is exactly one reader.
pub struct SnapshotReader {
    shared: Arc<Shared>,
    last_seen: u64,
}

impl SnapshotReader {
    /// Most recently published snapshot, or `None` before the first publish.
    #[inline]
    pub fn latest(&self) -> Option<Arc<RobotStateSnapshot>> {
        self.shared.slot.load_full()
    }

    /// Read the latest snapshot and classify it as fresh or stale.
    pub fn read(&mut self) -> Option<SnapshotRead> {
        let snapshot = self.latest()?;
        let sequence = snapshot.sequence;
        debug_assert!(sequence >= self.last_seen, "handoff went backwards");

        let fresh = sequence > self.last_seen;
        let skipped = if fresh && self.last_seen > 0 {
            sequence - self.last_seen - 1
        } else {
            0
        };
        if fresh {
            self.last_seen = sequence;
        }
        Some(SnapshotRead {
            snapshot,
            fresh,
            skipped,
        })
    }

    /// Block until the first snapshot is published or `timeout` elapses.
    ///
    /// Startup only; never call from a periodic tick.
    pub fn wait_for_first(
        &self,
        timeout: Duration,
    ) -> Result<Arc<RobotStateSnapshot>, HandoffError> {
        let deadline = Instant::now() + timeout;
        let mut published = self.shared.first_published.lock();
        while !*published {
            if self
                .shared
                .first_cv
                .wait_until(&mut published, deadline)
                .timed_out()
            {
                break;
            }
        }
        drop(published);
        self.latest()
            .ok_or(HandoffError::FirstSnapshotTimeout(timeout))
    }

    /// Sequence of the last consumed snapshot.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    /// Read-only observer for threads outside the control loop.
    pub fn probe(&self) -> HandoffProbe {
        HandoffProbe {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Read-only view of the slot for telemetry and health reporting.
#[derive(Clone)]
pub struct HandoffProbe {
    shared: Arc<Shared>,
}

impl HandoffProbe {
    /// Latest published snapshot. Callers get their own `Arc`.
    pub fn latest(&self) -> Option<Arc<RobotStateSnapshot>> {
        self.shared.slot.load_full()
    }

    /// Last published sequence (0 before the first publish).
    pub fn last_published(&self) -> u64 {
        self.shared.last_published.load(Ordering::Acquire)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn snapshot(sequence: u64) -> RobotStateSnapshot {
        let mut snap = RobotStateSnapshot::zeroed(2);
        snap.sequence = sequence;
        snap.timestamp_ns = sequence * 1_000;
        snap
    }

    #[test]
    fn empty_before_first_publish() {
        let (_publisher, mut reader) = channel(2);
        assert!(reader.latest().is_none());
        assert!(reader.read().is_none());
        assert_eq!(reader.probe().last_published(), 0);
    }

    #[test]
    fn publish_then_read_fresh_then_stale() {
        let (mut publisher, mut reader) = channel(2);
        assert_eq!(publisher.publish(snapshot(1)), Ok(1));

        let first = reader.read().unwrap();
        assert!(first.fresh);
        assert_eq!(first.snapshot.sequence, 1);

        let again = reader.read().unwrap();
        assert!(!again.fresh);
        assert_eq!(again.snapshot.sequence, 1);
        assert_eq!(reader.last_seen(), 1);
    }

    #[test]
    fn skipped_counts_overwritten_snapshots() {
        let (mut publisher, mut reader) = channel(2);
        publisher.publish(snapshot(1)).unwrap();
        assert_eq!(reader.read().unwrap().skipped, 0);
        for seq in 2..=5 {
            publisher.publish(snapshot(seq)).unwrap();
        }
        let read = reader.read().unwrap();
        assert_eq!(read.snapshot.sequence, 5);
        assert_eq!(read.skipped, 3);
    }

    #[test]
    fn non_monotonic_publish_rejected() {
        let (mut publisher, reader) = channel(2);
        publisher.publish(snapshot(3)).unwrap();
        assert_eq!(
            publisher.publish(snapshot(3)),
            Err(HandoffError::NonMonotonic {
                last: 3,
                attempted: 3
            })
        );
        assert!(publisher.publish(snapshot(2)).is_err());
        assert_eq!(reader.latest().unwrap().sequence, 3);
        assert_eq!(publisher.last_sequence(), 3);
    }

    #[test]
    fn in_progress_is_recycled_without_touching_held_snapshot() {
        let (mut publisher, mut reader) = channel(2);

        publisher.in_progress().sequence = 1;
        publisher.in_progress().joint_positions[0] = 0.25;
        publisher.publish_in_progress().unwrap();
        let held = reader.read().unwrap().snapshot;

        publisher.in_progress().sequence = 2;
        publisher.in_progress().joint_positions[0] = 0.5;
        publisher.publish_in_progress().unwrap();

        // The displaced snapshot #1 is still held here and must be copied,
        // not overwritten, when building #3.
        publisher.in_progress().sequence = 3;
        publisher.in_progress().joint_positions[0] = 0.75;
        assert_eq!(held.sequence, 1);
        assert_eq!(held.joint_positions[0], 0.25);

        publisher.publish_in_progress().unwrap();
        let latest = reader.read().unwrap();
        assert_eq!(latest.snapshot.sequence, 3);
        assert_eq!(latest.snapshot.joint_positions[0], 0.75);
    }

    #[test]
    fn rejected_in_progress_stays_available() {
        let (mut publisher, _reader) = channel(2);
        publisher.publish(snapshot(4)).unwrap();
        publisher.in_progress().sequence = 4;
        assert!(publisher.publish_in_progress().is_err());
        publisher.in_progress().sequence = 5;
        assert_eq!(publisher.publish_in_progress(), Ok(5));
    }

    #[test]
    fn wait_for_first_times_out() {
        let (_publisher, reader) = channel(2);
        let start = Instant::now();
        let result = reader.wait_for_first(Duration::from_millis(20));
        assert_eq!(
            result.unwrap_err(),
            HandoffError::FirstSnapshotTimeout(Duration::from_millis(20))
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn wait_for_first_wakes_on_publish() {
        let (mut publisher, reader) = channel(2);
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            publisher.publish(snapshot(1)).unwrap();
            publisher
        });
        let first = reader.wait_for_first(Duration::from_secs(5)).unwrap();
        assert_eq!(first.sequence, 1);
        producer.join().unwrap();
    }
}
