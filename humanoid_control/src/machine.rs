//! Behavior state machine: one active control law, arbitrated per tick.
//!
//! Decision order, evaluated once per control tick:
//! 1. **Failure override**: a failure signal with a registered fallback
//!    forces the fallback, discarding any pending request. Ignores the
//!    allowed-transition set.
//! 2. **Explicit request**: a request naming another registered state,
//!    when listening and allowed.
//! 3. **Finished transition**: the active state reports `is_done` and has
//!    a configured successor.
//! 4. No transition.
//!
//! On transition: `on_exit` of the old state → current updated →
//! `on_entry` of the new state → listeners notified. `do_action` always
//! runs after the decision in the same tick.
//!
//! Requests, failure signals and the fallback are written from any thread
//! through a cloneable [`BehaviorRequester`]; the machine itself lives on
//! the control thread.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use humanoid_common::control::command::ControllerCoreCommand;
use humanoid_common::control::fault::TickFaults;
use humanoid_common::control::snapshot::RobotStateSnapshot;
use static_assertions::const_assert;

use crate::behavior::{BehaviorId, BehaviorState};
use crate::error::MachineError;

/// Sentinel for "no id" in the signal atomics.
const NONE: u16 = u16::MAX;
const_assert!(NONE > u8::MAX as u16);

/// Spacing of the synthetic clock used by `warm_up` [s].
const WARM_UP_DT: f64 = 0.001;

// ─── Events ─────────────────────────────────────────────────────────

/// What triggered a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionCause {
    /// Initial state entered on start.
    Initial,
    /// Failure override to the fallback state.
    Failure,
    /// Explicit transition request.
    Request,
    /// Active state reported done.
    Finished,
}

/// State-changed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange<K> {
    /// Previous state, `None` for the initial entry.
    pub from: Option<K>,
    /// New state.
    pub to: K,
    /// Trigger.
    pub cause: TransitionCause,
    /// Control tick time of the change [ns].
    pub at_ns: u64,
}

/// Result of one machine tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickOutcome<K> {
    /// State whose `do_action` ran this tick.
    pub state: K,
    /// Transition taken this tick, if any.
    pub transition: Option<StateChange<K>>,
    /// Arbitration faults (illegal request, unregistered fallback, ...).
    pub faults: TickFaults,
    /// Time in `state` passed to `do_action` [s].
    pub time_in_state: f64,
}

type Listener<K> = Box<dyn FnMut(&StateChange<K>) + Send>;

// ─── Signals ────────────────────────────────────────────────────────

#[derive(Debug)]
struct MachineSignals {
    requested: AtomicU16,
    failure: AtomicBool,
    fallback: AtomicU16,
    listening: AtomicBool,
    current: AtomicU16,
    transitions: AtomicU64,
    failures: AtomicU64,
    illegal_requests: AtomicU64,
    illegal_transitions: AtomicU64,
    unregistered_fallbacks: AtomicU64,
    ignored_requests: AtomicU64,
}

impl MachineSignals {
    fn new(fallback: u16, listening: bool) -> Self {
        Self {
            requested: AtomicU16::new(NONE),
            failure: AtomicBool::new(false),
            fallback: AtomicU16::new(fallback),
            listening: AtomicBool::new(listening),
            current: AtomicU16::new(NONE),
            transitions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            illegal_requests: AtomicU64::new(0),
            illegal_transitions: AtomicU64::new(0),
            unregistered_fallbacks: AtomicU64::new(0),
            ignored_requests: AtomicU64::new(0),
        }
    }
}

/// Arbitration counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineStats {
    /// State changes, including the initial entry.
    pub transitions: u64,
    /// Failure signals consumed.
    pub failures: u64,
    /// Requests naming an unregistered state.
    pub illegal_requests: u64,
    /// Requests refused by the narrowed transition set.
    pub illegal_transitions: u64,
    /// Failures signaled without a registered fallback.
    pub unregistered_fallbacks: u64,
    /// Requests dropped while not listening.
    pub ignored_requests: u64,
}

/// Thread-safe handle for requesting transitions and signaling failures.
///
/// All signals are fire-and-forget; the last write before the next
/// control tick wins.
#[derive(Debug, Clone)]
pub struct BehaviorRequester<K> {
    signals: Arc<MachineSignals>,
    _id: PhantomData<fn() -> K>,
}

impl<K: BehaviorId> BehaviorRequester<K> {
    /// Request a transition to `id`.
    pub fn request_state(&self, id: K) {
        self.request_raw(id.as_u8());
    }

    /// Request a transition by raw id, e.g. from a network bridge.
    /// Unknown ids are reported as illegal requests on the next tick.
    pub fn request_raw(&self, raw: u8) {
        self.signals
            .requested
            .store(u16::from(raw), Ordering::Release);
    }

    /// Signal a failure. Consumed at most once, on the next tick.
    pub fn signal_failure(&self) {
        self.signals.failure.store(true, Ordering::Release);
    }

    /// Replace the fallback state. `None` unregisters it.
    pub fn set_fallback(&self, id: Option<K>) {
        let raw = id.map_or(NONE, |k| u16::from(k.as_u8()));
        self.signals.fallback.store(raw, Ordering::Release);
    }

    /// Current fallback state.
    pub fn fallback(&self) -> Option<K> {
        decode_id(self.signals.fallback.load(Ordering::Acquire))
    }

    /// Enable or disable explicit requests. Failure override is unaffected.
    pub fn set_listening(&self, listening: bool) {
        self.signals.listening.store(listening, Ordering::Release);
    }

    /// Whether explicit requests are honoured.
    pub fn is_listening(&self) -> bool {
        self.signals.listening.load(Ordering::Acquire)
    }

    /// Active state as last published by the control thread.
    pub fn current(&self) -> Option<K> {
        decode_id(self.signals.current.load(Ordering::Acquire))
    }

    /// Arbitration counters.
    pub fn stats(&self) -> MachineStats {
        let s = &self.signals;
        MachineStats {
            transitions: s.transitions.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
            illegal_requests: s.illegal_requests.load(Ordering::Relaxed),
            illegal_transitions: s.illegal_transitions.load(Ordering::Relaxed),
            unregistered_fallbacks: s.unregistered_fallbacks.load(Ordering::Relaxed),
            ignored_requests: s.ignored_requests.load(Ordering::Relaxed),
        }
    }
}

fn decode_id<K: BehaviorId>(raw: u16) -> Option<K> {
    u8::try_from(raw).ok().and_then(K::from_u8)
}

// ─── Builder ────────────────────────────────────────────────────────

/// Builder for [`BehaviorStateMachine`].
pub struct MachineBuilder<K: BehaviorId> {
    states: Vec<Box<dyn BehaviorState<K>>>,
    initial: Option<K>,
    fallback: Option<K>,
    finished: Vec<(K, K)>,
    allowed: Option<Vec<(K, K)>>,
    listening: bool,
    listeners: Vec<Listener<K>>,
}

impl<K: BehaviorId> MachineBuilder<K> {
    fn new() -> Self {
        Self {
            states: Vec::new(),
            initial: None,
            fallback: None,
            finished: Vec::new(),
            allowed: None,
            listening: true,
            listeners: Vec::new(),
        }
    }

    /// Register a state implementation.
    pub fn register(mut self, state: Box<dyn BehaviorState<K>>) -> Self {
        self.states.push(state);
        self
    }

    /// State entered on start.
    pub fn initial(mut self, id: K) -> Self {
        self.initial = Some(id);
        self
    }

    /// Fallback state for failure override.
    pub fn fallback(mut self, id: K) -> Self {
        self.fallback = Some(id);
        self
    }

    /// Take `from → to` when `from` reports done.
    pub fn finished_transition(mut self, from: K, to: K) -> Self {
        self.finished.push((from, to));
        self
    }

    /// Narrow the transition policy. The first call switches from "every
    /// pair allowed" to "only listed pairs allowed".
    pub fn allow(mut self, from: K, to: K) -> Self {
        self.allowed.get_or_insert_with(Vec::new).push((from, to));
        self
    }

    /// Honour explicit requests from the start (default true).
    pub fn listening(mut self, listening: bool) -> Self {
        self.listening = listening;
        self
    }

    /// Add a state-changed listener. Runs on the control thread.
    pub fn on_state_change<F>(mut self, listener: F) -> Self
    where
        F: FnMut(&StateChange<K>) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<(BehaviorStateMachine<K>, BehaviorRequester<K>), MachineError> {
        let ids: Vec<K> = self.states.iter().map(|s| s.id()).collect();
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                return Err(MachineError::DuplicateState(id.name()));
            }
        }
        let index_of = |role: &'static str, id: K| {
            ids.iter()
                .position(|k| *k == id)
                .ok_or(MachineError::UnregisteredState {
                    role,
                    name: id.name(),
                })
        };

        let initial = index_of("initial", self.initial.ok_or(MachineError::NoInitialState)?)?;
        if let Some(fallback) = self.fallback {
            index_of("fallback", fallback)?;
        }

        let n = ids.len();
        let allowed = match &self.allowed {
            None => None,
            Some(pairs) => {
                let mut matrix = vec![false; n * n];
                for &(from, to) in pairs {
                    matrix[index_of("allowed source", from)? * n + index_of("allowed target", to)?] =
                        true;
                }
                Some(matrix)
            }
        };

        let mut finished = vec![None; n];
        for &(from, to) in &self.finished {
            let f = index_of("finished source", from)?;
            let t = index_of("finished target", to)?;
            if finished[f].is_some() {
                return Err(MachineError::AmbiguousFinishedTransition(from.name()));
            }
            if allowed.as_ref().is_some_and(|m| !m[f * n + t]) {
                return Err(MachineError::DisallowedFinishedTransition {
                    from: from.name(),
                    to: to.name(),
                });
            }
            finished[f] = Some(t);
        }

        let fallback_raw = self.fallback.map_or(NONE, |k| u16::from(k.as_u8()));
        let signals = Arc::new(MachineSignals::new(fallback_raw, self.listening));
        let requester = BehaviorRequester {
            signals: Arc::clone(&signals),
            _id: PhantomData,
        };
        let machine = BehaviorStateMachine {
            states: self.states,
            ids,
            initial,
            finished,
            allowed,
            current: None,
            entered_at_ns: 0,
            signals,
            listeners: self.listeners,
        };
        Ok((machine, requester))
    }
}

// ─── Machine ────────────────────────────────────────────────────────

/// Owner of every registered behavior state. Lives on the control thread.
pub struct BehaviorStateMachine<K: BehaviorId> {
    states: Vec<Box<dyn BehaviorState<K>>>,
    ids: Vec<K>,
    initial: usize,
    finished: Vec<Option<usize>>,
    /// Row-major `from * n + to` matrix; `None` means unrestricted.
    allowed: Option<Vec<bool>>,
    current: Option<usize>,
    entered_at_ns: u64,
    signals: Arc<MachineSignals>,
    listeners: Vec<Listener<K>>,
}

impl<K: BehaviorId> BehaviorStateMachine<K> {
    /// Start building a machine.
    pub fn builder() -> MachineBuilder<K> {
        MachineBuilder::new()
    }

    /// Another handle for requests and failure signals.
    pub fn requester(&self) -> BehaviorRequester<K> {
        BehaviorRequester {
            signals: Arc::clone(&self.signals),
            _id: PhantomData,
        }
    }

    /// Registered state ids, in registration order.
    pub fn registered(&self) -> impl Iterator<Item = K> + '_ {
        self.ids.iter().copied()
    }

    /// Active state, `None` before start.
    pub fn current(&self) -> Option<K> {
        self.current.map(|i| self.ids[i])
    }

    /// True once the initial state has been entered.
    pub fn is_started(&self) -> bool {
        self.current.is_some()
    }

    /// Add a state-changed listener after construction.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: FnMut(&StateChange<K>) + Send + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Whether `from → to` is permitted for requests.
    pub fn is_allowed(&self, from: K, to: K) -> bool {
        match (self.index_of(from), self.index_of(to)) {
            (Some(f), Some(t)) => self.allowed_idx(f, t),
            _ => false,
        }
    }

    /// Exercise every registered state `iterations` times before start,
    /// discarding the commands. No notifications are emitted.
    pub fn warm_up(
        &mut self,
        snapshot: &RobotStateSnapshot,
        iterations: usize,
    ) -> Result<(), MachineError> {
        if self.is_started() {
            return Err(MachineError::AlreadyStarted);
        }
        let mut scratch = ControllerCoreCommand::new();
        for state in &mut self.states {
            for i in 0..iterations {
                let t = i as f64 * WARM_UP_DT;
                state.on_entry(snapshot);
                scratch.clear();
                state.do_action(snapshot, t, &mut scratch);
                let _ = state.is_done(t);
                state.on_exit();
            }
        }
        Ok(())
    }

    /// Enter the initial state. Also done implicitly by the first `tick`.
    pub fn start(
        &mut self,
        snapshot: &RobotStateSnapshot,
        now_ns: u64,
    ) -> Result<StateChange<K>, MachineError> {
        if self.is_started() {
            return Err(MachineError::AlreadyStarted);
        }
        Ok(self.enter(self.initial, TransitionCause::Initial, snapshot, now_ns))
    }

    /// One control tick: arbitrate, transition if needed, then run the
    /// active state's `do_action` into `command` (cleared first).
    ///
    /// The tick that starts the machine only enters the initial state;
    /// pending signals are handled from the next tick on.
    pub fn tick(
        &mut self,
        snapshot: &RobotStateSnapshot,
        now_ns: u64,
        command: &mut ControllerCoreCommand,
    ) -> TickOutcome<K> {
        let mut faults = TickFaults::empty();
        let (active, transition) = match self.current {
            None => {
                let change = self.enter(self.initial, TransitionCause::Initial, snapshot, now_ns);
                (self.initial, Some(change))
            }
            Some(current) => {
                let (decision, decision_faults) = self.decide(current, now_ns);
                faults = decision_faults;
                match decision {
                    Some((to, cause)) => (to, Some(self.enter(to, cause, snapshot, now_ns))),
                    None => (current, None),
                }
            }
        };

        command.clear();
        let time_in_state = self.time_in_state(now_ns);
        self.states[active].do_action(snapshot, time_in_state, command);

        TickOutcome {
            state: self.ids[active],
            transition,
            faults,
            time_in_state,
        }
    }

    /// Seconds since the active state was entered.
    pub fn time_in_state(&self, now_ns: u64) -> f64 {
        now_ns.saturating_sub(self.entered_at_ns) as f64 * 1e-9
    }

    fn index_of(&self, id: K) -> Option<usize> {
        self.ids.iter().position(|k| *k == id)
    }

    fn decode(&self, raw: u16) -> Option<usize> {
        decode_id::<K>(raw).and_then(|id| self.index_of(id))
    }

    fn allowed_idx(&self, from: usize, to: usize) -> bool {
        let n = self.ids.len();
        self.allowed.as_ref().is_none_or(|m| m[from * n + to])
    }

    fn decide(
        &self,
        current: usize,
        now_ns: u64,
    ) -> (Option<(usize, TransitionCause)>, TickFaults) {
        let signals = &self.signals;
        let mut faults = TickFaults::empty();

        // Failure first: a request written before the failure signal is
        // visible once the failure is seen, and is discarded with it.
        let failed = signals.failure.swap(false, Ordering::AcqRel);
        // Consumed every tick, whether or not it is acted upon.
        let requested = signals.requested.swap(NONE, Ordering::AcqRel);

        if failed {
            signals.failures.fetch_add(1, Ordering::Relaxed);
            match self.decode(signals.fallback.load(Ordering::Acquire)) {
                Some(fallback) if fallback == current => return (None, faults),
                Some(fallback) => return (Some((fallback, TransitionCause::Failure)), faults),
                None => {
                    faults |= TickFaults::UNREGISTERED_FALLBACK;
                    signals
                        .unregistered_fallbacks
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if requested != NONE {
            if !signals.listening.load(Ordering::Acquire) {
                signals.ignored_requests.fetch_add(1, Ordering::Relaxed);
            } else {
                match self.decode(requested) {
                    None => {
                        faults |= TickFaults::ILLEGAL_REQUEST;
                        signals.illegal_requests.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(target) if target == current => {}
                    Some(target) if self.allowed_idx(current, target) => {
                        return (Some((target, TransitionCause::Request)), faults);
                    }
                    Some(_) => {
                        faults |= TickFaults::ILLEGAL_TRANSITION;
                        signals.illegal_transitions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        if let Some(next) = self.finished[current] {
            if self.states[current].is_done(self.time_in_state(now_ns)) {
                return (Some((next, TransitionCause::Finished)), faults);
            }
        }

        (None, faults)
    }

    fn enter(
        &mut self,
        to: usize,
        cause: TransitionCause,
        snapshot: &RobotStateSnapshot,
        now_ns: u64,
    ) -> StateChange<K> {
        let from = self.current.take();
        if let Some(old) = from {
            self.states[old].on_exit();
        }
        self.current = Some(to);
        self.states[to].on_entry(snapshot);
        self.entered_at_ns = now_ns;

        let to_id = self.ids[to];
        self.signals
            .current
            .store(u16::from(to_id.as_u8()), Ordering::Release);
        self.signals.transitions.fetch_add(1, Ordering::Relaxed);

        let change = StateChange {
            from: from.map(|i| self.ids[i]),
            to: to_id,
            cause,
            at_ns: now_ns,
        };
        for listener in &mut self.listeners {
            listener(&change);
        }
        change
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
