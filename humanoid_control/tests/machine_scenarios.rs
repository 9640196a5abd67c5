//! Behavior arbitration scenarios driven tick by tick. Only the signal race
//! test uses a second thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;

use humanoid_common::control::command::{CommandError, ControllerCoreCommand, JointDesired};
use humanoid_common::control::fault::TickFaults;
use humanoid_common::control::joint::{JointId, JointMap};
use humanoid_common::control::snapshot::RobotStateSnapshot;
use humanoid_control::behavior::{BehaviorId, BehaviorState};
use humanoid_control::machine::{
    BehaviorRequester, BehaviorStateMachine, TickOutcome, TransitionCause,
};
use humanoid_control::sink::{CommandSink, OutputWriter};
use parking_lot::Mutex;
use proptest::prelude::*;

const TICK_NS: u64 = 1_000_000;
const WALK_LIMIT_S: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Gait {
    Idle,
    Walk,
    Fallen,
}

impl BehaviorId for Gait {
    fn as_u8(self) -> u8 {
        self as u8
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Walk),
            2 => Some(Self::Fallen),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Walk => "walk",
            Self::Fallen => "fallen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Entry(Gait),
    Action(Gait),
    Exit(Gait),
}

fn walk_done(time_in_state: f64) -> bool {
    time_in_state >= WALK_LIMIT_S
}

struct GaitState {
    id: Gait,
    joints: Arc<JointMap>,
    active: Arc<AtomicI32>,
    calls: Arc<Mutex<Vec<Call>>>,
    corrupt: Arc<AtomicBool>,
}

impl BehaviorState<Gait> for GaitState {
    fn id(&self) -> Gait {
        self.id
    }

    fn on_entry(&mut self, _snapshot: &RobotStateSnapshot) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().push(Call::Entry(self.id));
    }

    fn do_action(&mut self, _: &RobotStateSnapshot, _: f64, cmd: &mut ControllerCoreCommand) {
        self.calls.lock().push(Call::Action(self.id));
        cmd.set_all_off(&self.joints);
        if self.corrupt.swap(false, Ordering::SeqCst) {
            cmd.push(JointDesired::off(JointId(0)));
        }
    }

    fn is_done(&self, time_in_state: f64) -> bool {
        self.id == Gait::Walk && walk_done(time_in_state)
    }

    fn on_exit(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().push(Call::Exit(self.id));
    }
}

struct Rig {
    machine: BehaviorStateMachine<Gait>,
    requester: BehaviorRequester<Gait>,
    joints: Arc<JointMap>,
    active: Arc<AtomicI32>,
    calls: Arc<Mutex<Vec<Call>>>,
    corrupt: Arc<AtomicBool>,
    snapshot: RobotStateSnapshot,
    command: ControllerCoreCommand,
    now_ns: u64,
}

impl Rig {
    fn new() -> Self {
        let joints = Arc::new(JointMap::from_names(["hip", "knee"]).unwrap());
        let active = Arc::new(AtomicI32::new(0));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let corrupt = Arc::new(AtomicBool::new(false));

        let mut builder = BehaviorStateMachine::builder();
        for id in [Gait::Idle, Gait::Walk, Gait::Fallen] {
            builder = builder.register(Box::new(GaitState {
                id,
                joints: Arc::clone(&joints),
                active: Arc::clone(&active),
                calls: Arc::clone(&calls),
                corrupt: Arc::clone(&corrupt),
            }));
        }
        let (machine, requester) = builder
            .initial(Gait::Idle)
            .fallback(Gait::Fallen)
            .finished_transition(Gait::Walk, Gait::Idle)
            .build()
            .unwrap();

        Self {
            machine,
            requester,
            snapshot: RobotStateSnapshot::zeroed(joints.len()),
            joints,
            active,
            calls,
            corrupt,
            command: ControllerCoreCommand::new(),
            now_ns: 0,
        }
    }

    fn tick(&mut self) -> TickOutcome<Gait> {
        self.now_ns += TICK_NS;
        self.calls.lock().clear();
        self.machine
            .tick(&self.snapshot, self.now_ns, &mut self.command)
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[test]
fn walk_then_fall_discards_pending_request() {
    let mut rig = Rig::new();
    let first = rig.tick();
    assert_eq!(first.state, Gait::Idle);
    assert_eq!(first.transition.unwrap().cause, TransitionCause::Initial);

    rig.requester.request_state(Gait::Walk);
    let walk = rig.tick();
    assert_eq!(walk.state, Gait::Walk);
    assert_eq!(
        rig.calls(),
        [Call::Exit(Gait::Idle), Call::Entry(Gait::Walk), Call::Action(Gait::Walk)]
    );

    // Failure and request land in the same tick: the failure wins.
    rig.requester.request_state(Gait::Idle);
    rig.requester.signal_failure();
    let fall = rig.tick();
    assert_eq!(fall.state, Gait::Fallen);
    let change = fall.transition.unwrap();
    assert_eq!(change.from, Some(Gait::Walk));
    assert_eq!(change.cause, TransitionCause::Failure);
    assert!(fall.faults.is_empty());

    // The request was consumed with the failure, not deferred.
    let after = rig.tick();
    assert_eq!(after.state, Gait::Fallen);
    assert!(after.transition.is_none());
    assert_eq!(rig.requester.stats().failures, 1);
}

#[test]
fn failure_while_in_fallback_is_a_no_op() {
    let mut rig = Rig::new();
    rig.tick();
    rig.requester.signal_failure();
    assert_eq!(rig.tick().state, Gait::Fallen);

    rig.requester.signal_failure();
    let again = rig.tick();
    assert_eq!(again.state, Gait::Fallen);
    assert!(again.transition.is_none());
    assert_eq!(rig.calls(), [Call::Action(Gait::Fallen)]);
    assert_eq!(rig.requester.stats().failures, 2);
}

#[test]
fn walk_finishes_back_to_idle() {
    let mut rig = Rig::new();
    rig.tick();
    rig.requester.request_state(Gait::Walk);
    rig.tick();

    let mut finished = None;
    for _ in 0..20 {
        let outcome = rig.tick();
        if let Some(change) = outcome.transition {
            finished = Some(change);
            break;
        }
        assert_eq!(outcome.state, Gait::Walk);
    }
    let change = finished.unwrap();
    assert_eq!(change.from, Some(Gait::Walk));
    assert_eq!(change.to, Gait::Idle);
    assert_eq!(change.cause, TransitionCause::Finished);
}

#[test]
fn missing_fallback_reports_and_still_serves_request() {
    let mut rig = Rig::new();
    rig.tick();
    rig.requester.set_fallback(None);
    rig.requester.request_state(Gait::Walk);
    rig.requester.signal_failure();

    let outcome = rig.tick();
    assert!(outcome.faults.contains(TickFaults::UNREGISTERED_FALLBACK));
    assert_eq!(outcome.state, Gait::Walk);
    assert_eq!(outcome.transition.unwrap().cause, TransitionCause::Request);
    assert_eq!(rig.requester.stats().unregistered_fallbacks, 1);
}

#[test]
fn repeated_request_for_active_state_is_idempotent() {
    let mut rig = Rig::new();
    rig.tick();
    for _ in 0..3 {
        rig.requester.request_state(Gait::Idle);
        let outcome = rig.tick();
        assert!(outcome.transition.is_none());
        assert!(outcome.faults.is_empty());
        assert_eq!(rig.calls(), [Call::Action(Gait::Idle)]);
    }
    assert_eq!(rig.requester.stats().transitions, 1);
}

#[test]
fn request_racing_a_failure_never_outlives_the_override() {
    let mut rig = Rig::new();
    rig.tick();

    for round in 0..5_000 {
        assert_eq!(rig.machine.current(), Some(Gait::Idle), "round {round}");
        let before = rig.requester.stats().failures;

        let signaler = {
            let requester = rig.requester.clone();
            thread::spawn(move || {
                requester.request_state(Gait::Walk);
                requester.signal_failure();
            })
        };
        while rig.requester.stats().failures == before {
            rig.tick();
        }
        signaler.join().unwrap();
        assert_eq!(rig.machine.current(), Some(Gait::Fallen), "round {round}");

        let next = rig.tick();
        assert_eq!(next.state, Gait::Fallen, "round {round}");
        assert!(next.transition.is_none(), "round {round}: {:?}", next.transition);

        rig.requester.request_state(Gait::Idle);
        assert_eq!(rig.tick().state, Gait::Idle);
    }
}

// ─── Output Isolation ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Output {
    Applied(usize),
    Skipped,
}

#[derive(Default)]
struct Recorder(Arc<Mutex<Vec<Output>>>);

impl OutputWriter for Recorder {
    fn apply(&mut self, command: &ControllerCoreCommand) {
        self.0.lock().push(Output::Applied(command.len()));
    }

    fn skip(&mut self) {
        self.0.lock().push(Output::Skipped);
    }
}

#[test]
fn invalid_command_is_dropped_for_one_tick_only() {
    let mut rig = Rig::new();
    let outputs = Arc::new(Mutex::new(Vec::new()));
    let mut sink = CommandSink::new(Arc::clone(&rig.joints), Recorder(Arc::clone(&outputs)));

    rig.tick();
    assert!(sink.submit(&rig.command).is_ok());

    rig.corrupt.store(true, Ordering::SeqCst);
    rig.tick();
    assert_eq!(
        sink.submit(&rig.command),
        Err(CommandError::DuplicateJoint(JointId(0)))
    );

    rig.tick();
    assert!(sink.submit(&rig.command).is_ok());

    assert_eq!(
        *outputs.lock(),
        [Output::Applied(2), Output::Skipped, Output::Applied(2)]
    );
    assert_eq!(sink.stats().accepted, 2);
    assert_eq!(sink.stats().rejected, 1);
    assert_eq!(rig.machine.current(), Some(Gait::Idle));
}

// ─── Randomized Signal Sequences ────────────────────────────────────

/// Reference arbitration: failure override, then request, then finished.
struct Model {
    current: Gait,
    entered_ns: u64,
    fallback: Option<Gait>,
}

impl Model {
    fn next(&self, request: Option<u8>, failure: bool, now_ns: u64) -> (Gait, TickFaults) {
        let mut faults = TickFaults::empty();
        if failure {
            match self.fallback {
                Some(f) if f == self.current => return (self.current, faults),
                Some(f) => return (f, faults),
                None => faults |= TickFaults::UNREGISTERED_FALLBACK,
            }
        }
        if let Some(raw) = request {
            match Gait::from_u8(raw) {
                None => faults |= TickFaults::ILLEGAL_REQUEST,
                Some(target) if target != self.current => return (target, faults),
                Some(_) => {}
            }
        }
        let time_in_state = now_ns.saturating_sub(self.entered_ns) as f64 * 1e-9;
        if self.current == Gait::Walk && walk_done(time_in_state) {
            return (Gait::Idle, faults);
        }
        (self.current, faults)
    }
}

fn step() -> impl Strategy<Value = (Option<u8>, bool, bool)> {
    (
        proptest::option::of(0u8..5),
        proptest::bool::weighted(0.2),
        proptest::bool::weighted(0.1),
    )
}

proptest! {
    #[test]
    fn exactly_one_state_active_and_precedence_holds(
        steps in proptest::collection::vec(step(), 1..60)
    ) {
        let mut rig = Rig::new();
        rig.tick();
        let mut model = Model {
            current: Gait::Idle,
            entered_ns: rig.now_ns,
            fallback: Some(Gait::Fallen),
        };

        for (request, failure, toggle_fallback) in steps {
            if toggle_fallback {
                model.fallback = match model.fallback {
                    Some(_) => None,
                    None => Some(Gait::Fallen),
                };
                rig.requester.set_fallback(model.fallback);
            }
            if let Some(raw) = request {
                rig.requester.request_raw(raw);
            }
            if failure {
                rig.requester.signal_failure();
            }

            let (expected, expected_faults) = model.next(request, failure, rig.now_ns + TICK_NS);
            let outcome = rig.tick();

            prop_assert_eq!(outcome.state, expected);
            prop_assert_eq!(outcome.faults, expected_faults);
            prop_assert_eq!(rig.active.load(Ordering::SeqCst), 1);
            prop_assert_eq!(rig.requester.current(), Some(expected));

            let calls = rig.calls();
            if expected == model.current {
                prop_assert!(outcome.transition.is_none());
                prop_assert_eq!(calls, vec![Call::Action(expected)]);
            } else {
                prop_assert_eq!(
                    calls,
                    vec![Call::Exit(model.current), Call::Entry(expected), Call::Action(expected)]
                );
                model.current = expected;
                model.entered_ns = rig.now_ns;
            }
        }
    }
}
