//! Control-thread event reporting.
//!
//! The control task reports state changes and per-tick faults through a
//! [`TelemetrySink`]. Sinks run on the control thread, so they must return
//! quickly; [`TracingTelemetry`] rate-limits repeated faults the same way
//! the task loop rate-limits overrun warnings.

use humanoid_common::control::command::CommandError;
use humanoid_common::control::fault::TickFaults;
use tracing::{info, warn};

use crate::behavior::BehaviorId;
use crate::machine::{StateChange, TransitionCause};

/// Log the first 10 occurrences, then every 1000th.
#[inline]
pub fn should_log(count: u64) -> bool {
    count <= 10 || count % 1000 == 0
}

/// Event emitted by the control task.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent<K> {
    /// The active behavior state changed.
    StateChanged(StateChange<K>),
    /// One or more faults were raised during control tick `tick`.
    Fault { tick: u64, faults: TickFaults },
    /// The command produced in control tick `tick` was dropped.
    CommandRejected { tick: u64, error: CommandError },
}

/// Receiver of control events.
pub trait TelemetrySink<K>: Send + 'static {
    /// Handle one event. Runs on the control thread.
    fn record(&mut self, event: &ControlEvent<K>);
}

impl<K, F> TelemetrySink<K> for F
where
    F: FnMut(&ControlEvent<K>) + Send + 'static,
{
    fn record(&mut self, event: &ControlEvent<K>) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl<K> TelemetrySink<K> for NullTelemetry {
    fn record(&mut self, _event: &ControlEvent<K>) {}
}

/// Writes events to `tracing`, rate-limited per event kind.
#[derive(Debug, Default)]
pub struct TracingTelemetry {
    fault_ticks: u64,
    config_gaps: u64,
    rejected: u64,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: BehaviorId> TelemetrySink<K> for TracingTelemetry {
    fn record(&mut self, event: &ControlEvent<K>) {
        match event {
            ControlEvent::StateChanged(change) => {
                let from = change.from.map_or("none", |k| k.name());
                match change.cause {
                    TransitionCause::Failure => warn!(
                        "Behavior {} -> {} (failure override)",
                        from,
                        change.to.name()
                    ),
                    cause => info!("Behavior {} -> {} ({:?})", from, change.to.name(), cause),
                }
            }
            ControlEvent::Fault { tick, faults } => {
                if faults.has_config_gap() {
                    self.config_gaps += 1;
                    if should_log(self.config_gaps) {
                        warn!(
                            "Control tick {}: behavior configuration gap {:?} (#{})",
                            tick, faults, self.config_gaps
                        );
                    }
                }
                let runtime = faults.difference(TickFaults::CONFIG_MASK);
                if !runtime.is_empty() {
                    self.fault_ticks += 1;
                    if should_log(self.fault_ticks) {
                        warn!(
                            "Control tick {}: faults {:?} (#{})",
                            tick, runtime, self.fault_ticks
                        );
                    }
                }
            }
            ControlEvent::CommandRejected { tick, error } => {
                self.rejected += 1;
                if should_log(self.rejected) {
                    warn!(
                        "Control tick {}: command rejected: {} (#{})",
                        tick, error, self.rejected
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use humanoid_common::control::behavior::HighLevelBehavior;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[test]
    fn rate_limit_pattern() {
        assert!((1..=10).all(should_log));
        assert!(!should_log(11));
        assert!(!should_log(999));
        assert!(should_log(1000));
        assert!(!should_log(1001));
        assert!(should_log(5000));
    }

    #[test]
    fn closures_are_sinks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let mut sink = move |event: &ControlEvent<HighLevelBehavior>| log.lock().push(event.clone());

        let event = ControlEvent::Fault {
            tick: 3,
            faults: TickFaults::STALE_READ,
        };
        sink.record(&event);
        assert_eq!(*seen.lock(), vec![event]);
    }

    #[test]
    fn tracing_sink_counts_by_kind() {
        let mut sink = TracingTelemetry::new();
        let gap = ControlEvent::<HighLevelBehavior>::Fault {
            tick: 1,
            faults: TickFaults::ILLEGAL_REQUEST | TickFaults::STALE_READ,
        };
        sink.record(&gap);
        sink.record(&ControlEvent::<HighLevelBehavior>::CommandRejected {
            tick: 2,
            error: CommandError::CapacityExceeded,
        });
        assert_eq!(sink.config_gaps, 1);
        assert_eq!(sink.fault_ticks, 1);
        assert_eq!(sink.rejected, 1);
    }
}
