//! Periodic real-time task: RT setup, pacing and cycle statistics.
//!
//! Every [`PeriodicRealtimeTask`] owns exactly one named OS thread for its
//! whole life. The thread performs its own RT setup, then calls
//! [`TaskBody::tick`] once per period until a cooperative stop is
//! requested, and finally hands the body back through the join handle.
//!
//! ## RT Setup Sequence
//! 1. `mlockall(MCL_CURRENT | MCL_FUTURE)`, once per process.
//! 2. Prefault the task thread's stack.
//! 3. `sched_setaffinity` to the configured core, if any.
//! 4. `sched_setscheduler(SCHED_FIFO, priority)`.
//!
//! Without the `rt` feature steps 1, 3 and 4 are no-ops.
//!
//! ## Pacing
//! Deadlines are absolute on the monotonic clock (`clock_nanosleep` with
//! `TIMER_ABSTIME` under `rt`, `Instant` + `thread::sleep` otherwise).
//! A tick that overruns its period re-anchors the next deadline to "now":
//! the next tick runs immediately and exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use humanoid_common::control::config::TaskConfig;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::telemetry::should_log;

/// Stack size of every task thread.
const TASK_STACK_BYTES: usize = 2 * 1024 * 1024;

/// Portion of the task stack touched before the first tick.
const PREFAULT_STACK_BYTES: usize = 256 * 1024;

/// Ticks between periodic debug statistics.
const STATS_LOG_INTERVAL: u64 = 10_000;

// ─── Monotonic Clock ────────────────────────────────────────────────

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds on the process-wide monotonic clock.
///
/// Shared by both tasks so snapshot timestamps and control tick times are
/// directly comparable.
#[inline]
pub fn monotonic_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// ─── Cycle Statistics ───────────────────────────────────────────────

/// O(1) per-tick timing statistics, owned by the task thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStats {
    /// Total ticks executed.
    pub tick_count: u64,
    /// Last tick duration [ns].
    pub last_tick_ns: u64,
    /// Minimum tick duration [ns].
    pub min_tick_ns: u64,
    /// Maximum tick duration [ns].
    pub max_tick_ns: u64,
    /// Running sum for average computation.
    pub sum_tick_ns: u64,
    /// Maximum wake-up latency [ns] (actual wake minus deadline).
    pub max_latency_ns: u64,
    /// Ticks whose work ran past the next deadline.
    pub late_ticks: u64,
}

impl CycleStats {
    /// Create a new zeroed stats instance.
    pub const fn new() -> Self {
        Self {
            tick_count: 0,
            last_tick_ns: 0,
            min_tick_ns: u64::MAX,
            max_tick_ns: 0,
            sum_tick_ns: 0,
            max_latency_ns: 0,
            late_ticks: 0,
        }
    }

    /// Record one tick. O(1), no allocation.
    #[inline]
    pub fn record(&mut self, duration_ns: u64, latency_ns: u64, late: bool) {
        self.tick_count += 1;
        self.last_tick_ns = duration_ns;
        self.min_tick_ns = self.min_tick_ns.min(duration_ns);
        self.max_tick_ns = self.max_tick_ns.max(duration_ns);
        self.sum_tick_ns = self.sum_tick_ns.saturating_add(duration_ns);
        self.max_latency_ns = self.max_latency_ns.max(latency_ns);
        if late {
            self.late_ticks += 1;
        }
    }

    /// Average tick duration [ns] (0 if no ticks).
    #[inline]
    pub fn avg_tick_ns(&self) -> u64 {
        if self.tick_count == 0 {
            0
        } else {
            self.sum_tick_ns / self.tick_count
        }
    }
}

impl Default for CycleStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free mirror of [`CycleStats`] readable from any thread.
#[derive(Debug, Default)]
pub struct TaskHealth {
    running: AtomicBool,
    tick_count: AtomicU64,
    late_ticks: AtomicU64,
    last_tick_ns: AtomicU64,
    max_tick_ns: AtomicU64,
    avg_tick_ns: AtomicU64,
    max_latency_ns: AtomicU64,
}

/// Point-in-time copy of a task's health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskHealthSnapshot {
    pub running: bool,
    pub tick_count: u64,
    pub late_ticks: u64,
    pub last_tick_ns: u64,
    pub max_tick_ns: u64,
    pub avg_tick_ns: u64,
    pub max_latency_ns: u64,
}

impl TaskHealth {
    fn publish(&self, stats: &CycleStats) {
        self.tick_count.store(stats.tick_count, Ordering::Relaxed);
        self.late_ticks.store(stats.late_ticks, Ordering::Relaxed);
        self.last_tick_ns.store(stats.last_tick_ns, Ordering::Relaxed);
        self.max_tick_ns.store(stats.max_tick_ns, Ordering::Relaxed);
        self.avg_tick_ns.store(stats.avg_tick_ns(), Ordering::Relaxed);
        self.max_latency_ns
            .store(stats.max_latency_ns, Ordering::Relaxed);
    }

    /// Copy the current counters.
    pub fn snapshot(&self) -> TaskHealthSnapshot {
        TaskHealthSnapshot {
            running: self.running.load(Ordering::Acquire),
            tick_count: self.tick_count.load(Ordering::Relaxed),
            late_ticks: self.late_ticks.load(Ordering::Relaxed),
            last_tick_ns: self.last_tick_ns.load(Ordering::Relaxed),
            max_tick_ns: self.max_tick_ns.load(Ordering::Relaxed),
            avg_tick_ns: self.avg_tick_ns.load(Ordering::Relaxed),
            max_latency_ns: self.max_latency_ns.load(Ordering::Relaxed),
        }
    }
}

// ─── RT Setup ───────────────────────────────────────────────────────

/// Lock all current and future memory pages.
///
/// No-op when the `rt` feature is not enabled.
#[cfg(feature = "rt")]
pub fn lock_memory() -> Result<(), SchedulerError> {
    use nix::sys::mman::{MlockallFlags, mlockall};
    mlockall(MlockallFlags::MCL_CURRENT | MlockallFlags::MCL_FUTURE)
        .map_err(|e| SchedulerError::RtSetup(format!("mlockall failed: {e}")))
}

#[cfg(not(feature = "rt"))]
pub fn lock_memory() -> Result<(), SchedulerError> {
    Ok(())
}

/// Touch the top of the current stack so the first tick takes no page
/// faults.
fn prefault_stack() {
    let mut buf = [0u8; PREFAULT_STACK_BYTES];
    for byte in buf.iter_mut() {
        // SAFETY: `byte` is a valid, exclusive reference into `buf`.
        unsafe { core::ptr::write_volatile(byte, 0xA5) };
    }
    core::hint::black_box(&buf);
}

#[cfg(feature = "rt")]
fn set_affinity(cpu: usize) -> Result<(), SchedulerError> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut cpuset = CpuSet::new();
    cpuset
        .set(cpu)
        .map_err(|e| SchedulerError::RtSetup(format!("CpuSet::set({cpu}) failed: {e}")))?;
    sched_setaffinity(Pid::from_raw(0), &cpuset)
        .map_err(|e| SchedulerError::RtSetup(format!("sched_setaffinity({cpu}) failed: {e}")))
}

#[cfg(not(feature = "rt"))]
fn set_affinity(_cpu: usize) -> Result<(), SchedulerError> {
    Ok(())
}

#[cfg(feature = "rt")]
fn set_fifo_priority(priority: i32) -> Result<(), SchedulerError> {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pid 0 targets the calling thread; `param` outlives the call.
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        return Err(SchedulerError::RtSetup(format!(
            "sched_setscheduler(SCHED_FIFO, {priority}) failed: {err}"
        )));
    }
    Ok(())
}

#[cfg(not(feature = "rt"))]
fn set_fifo_priority(_priority: i32) -> Result<(), SchedulerError> {
    Ok(())
}

/// Per-thread RT setup. Must run on the task thread itself.
pub fn thread_rt_setup(config: &TaskConfig) -> Result<(), SchedulerError> {
    prefault_stack();
    if let Some(cpu) = config.cpu_core {
        set_affinity(cpu)?;
    }
    set_fifo_priority(config.priority)
}

// ─── Pacing ─────────────────────────────────────────────────────────

/// Absolute-deadline pacer on `CLOCK_MONOTONIC`.
#[cfg(feature = "rt")]
struct Pacer {
    period_ns: i64,
    deadline: nix::sys::time::TimeSpec,
}

#[cfg(feature = "rt")]
impl Pacer {
    fn new(period: Duration) -> Result<Self, SchedulerError> {
        use nix::time::{ClockId, clock_gettime};
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC)
            .map_err(|e| SchedulerError::RtSetup(format!("clock_gettime: {e}")))?;
        Ok(Self {
            period_ns: period.as_nanos() as i64,
            deadline: now,
        })
    }

    /// Sleep until the current deadline. Returns the wake latency [ns].
    fn wait(&mut self) -> u64 {
        use nix::time::{ClockId, ClockNanosleepFlags, clock_gettime, clock_nanosleep};
        let clock = ClockId::CLOCK_MONOTONIC;
        let _ = clock_nanosleep(clock, ClockNanosleepFlags::TIMER_ABSTIME, &self.deadline);
        match clock_gettime(clock) {
            Ok(now) => timespec_diff_ns(&now, &self.deadline).max(0) as u64,
            Err(_) => 0,
        }
    }

    /// Advance the deadline after a tick. Returns true on overrun.
    fn complete(&mut self) -> bool {
        use nix::time::{ClockId, clock_gettime};
        let next = timespec_add_ns(self.deadline, self.period_ns);
        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(now) if timespec_diff_ns(&now, &next) > 0 => {
                self.deadline = now;
                true
            }
            _ => {
                self.deadline = next;
                false
            }
        }
    }
}

/// Add nanoseconds to a TimeSpec.
#[cfg(feature = "rt")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    const NS_PER_SEC: i64 = 1_000_000_000;
    let total = ts.tv_nsec() as i64 + ns;
    let secs = ts.tv_sec() as i64 + total.div_euclid(NS_PER_SEC);
    let nanos = total.rem_euclid(NS_PER_SEC);
    nix::sys::time::TimeSpec::new(secs as _, nanos as _)
}

/// Difference `a - b` in nanoseconds.
#[cfg(feature = "rt")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() as i64 - b.tv_sec() as i64) * 1_000_000_000
        + (a.tv_nsec() as i64 - b.tv_nsec() as i64)
}

/// Absolute-deadline pacer on `Instant`.
#[cfg(not(feature = "rt"))]
struct Pacer {
    period: Duration,
    deadline: Instant,
}

#[cfg(not(feature = "rt"))]
impl Pacer {
    fn new(period: Duration) -> Result<Self, SchedulerError> {
        Ok(Self {
            period,
            deadline: Instant::now(),
        })
    }

    fn wait(&mut self) -> u64 {
        let now = Instant::now();
        if let Some(remaining) = self.deadline.checked_duration_since(now) {
            thread::sleep(remaining);
        }
        Instant::now()
            .saturating_duration_since(self.deadline)
            .as_nanos() as u64
    }

    fn complete(&mut self) -> bool {
        let next = self.deadline + self.period;
        let now = Instant::now();
        if now > next {
            self.deadline = now;
            true
        } else {
            self.deadline = next;
            false
        }
    }
}

// ─── Task Body ──────────────────────────────────────────────────────

/// Timing context handed to every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInfo {
    /// 1-based tick index.
    pub index: u64,
    /// Tick start on the shared monotonic clock [ns].
    pub now_ns: u64,
    /// Wake latency past the deadline [ns].
    pub latency_ns: u64,
    /// The previous tick overran, so this one started immediately.
    pub late: bool,
}

/// Work run by a [`PeriodicRealtimeTask`].
pub trait TaskBody: Send + 'static {
    /// Called once on the task thread before the first tick.
    fn on_start(&mut self) {}

    /// One period's worth of work. Must not block.
    fn tick(&mut self, info: &TickInfo);

    /// Called once on the task thread after the last tick.
    fn on_stop(&mut self) {}
}

// ─── Periodic Task ──────────────────────────────────────────────────

/// A named periodic task bound to one dedicated thread.
#[derive(Debug, Clone)]
pub struct PeriodicRealtimeTask {
    config: TaskConfig,
}

impl PeriodicRealtimeTask {
    /// Create a task from its configuration.
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Spawn the task thread and run `body` on it.
    ///
    /// Returns once the thread has completed its RT setup. A setup failure
    /// is reported here and the thread exits without ticking.
    pub fn spawn<B: TaskBody>(self, body: B) -> Result<TaskHandle<B>, SchedulerError> {
        let config = self.config;
        let name = config.name.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let health = Arc::new(TaskHealth::default());
        let (setup_tx, setup_rx) = mpsc::sync_channel::<Result<(), SchedulerError>>(1);

        let thread = {
            let stop = Arc::clone(&stop);
            let health = Arc::clone(&health);
            thread::Builder::new()
                .name(config.name.clone())
                .stack_size(TASK_STACK_BYTES)
                .spawn(move || {
                    let mut body = body;
                    let pacer = thread_rt_setup(&config).and_then(|()| Pacer::new(config.period()));
                    let mut pacer = match pacer {
                        Ok(pacer) => {
                            let _ = setup_tx.send(Ok(()));
                            pacer
                        }
                        Err(e) => {
                            let _ = setup_tx.send(Err(e));
                            return body;
                        }
                    };

                    health.running.store(true, Ordering::Release);
                    body.on_start();
                    let stats = run_loop(&config, &mut body, &mut pacer, &stop, &health);
                    body.on_stop();
                    health.running.store(false, Ordering::Release);

                    info!(
                        "Task '{}' stopped after {} ticks (late: {}, avg={}ns, max={}ns)",
                        config.name,
                        stats.tick_count,
                        stats.late_ticks,
                        stats.avg_tick_ns(),
                        stats.max_tick_ns
                    );
                    body
                })
                .map_err(|e| SchedulerError::Spawn {
                    task: name.clone(),
                    reason: e.to_string(),
                })?
        };

        match setup_rx.recv() {
            Ok(Ok(())) => {
                info!("Task '{name}' running");
                Ok(TaskHandle {
                    name,
                    stop,
                    health,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(SchedulerError::TaskPanicked(name))
            }
        }
    }
}

fn run_loop<B: TaskBody>(
    config: &TaskConfig,
    body: &mut B,
    pacer: &mut Pacer,
    stop: &AtomicBool,
    health: &TaskHealth,
) -> CycleStats {
    let mut stats = CycleStats::new();
    let mut index = 0u64;
    let mut late = false;

    while !stop.load(Ordering::Acquire) {
        let latency_ns = pacer.wait();
        if stop.load(Ordering::Acquire) {
            break;
        }

        index += 1;
        let start = Instant::now();
        let info = TickInfo {
            index,
            now_ns: monotonic_ns(),
            latency_ns,
            late,
        };

        body.tick(&info);

        let duration_ns = start.elapsed().as_nanos() as u64;
        late = pacer.complete();
        stats.record(duration_ns, latency_ns, late);
        health.publish(&stats);

        if late && should_log(stats.late_ticks) {
            warn!(
                "Task '{}' late tick #{}: tick {} took {}ns (period {}us)",
                config.name, stats.late_ticks, index, duration_ns, config.period_us
            );
        }
        if stats.tick_count % STATS_LOG_INTERVAL == 0 {
            debug!(
                "Task '{}': {} ticks, avg={}ns, max={}ns, late={}",
                config.name,
                stats.tick_count,
                stats.avg_tick_ns(),
                stats.max_tick_ns,
                stats.late_ticks
            );
        }
    }
    stats
}

/// Owner of a running task thread.
///
/// Dropping the handle requests a stop and joins the thread.
#[derive(Debug)]
pub struct TaskHandle<B: TaskBody> {
    name: String,
    stop: Arc<AtomicBool>,
    health: Arc<TaskHealth>,
    thread: Option<JoinHandle<B>>,
}

impl<B: TaskBody> TaskHandle<B> {
    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current health counters.
    pub fn health(&self) -> TaskHealthSnapshot {
        self.health.snapshot()
    }

    /// Shared health counters, for readers that outlive this handle.
    pub fn health_handle(&self) -> Arc<TaskHealth> {
        Arc::clone(&self.health)
    }

    /// Signal the loop to stop after the current tick.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop the task, join its thread and return the body.
    pub fn stop_and_join(mut self) -> Result<B, SchedulerError> {
        self.request_stop();
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SchedulerError::TaskPanicked(self.name.clone())),
            None => Err(SchedulerError::NotRunning),
        }
    }
}

impl<B: TaskBody> Drop for TaskHandle<B> {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.stop.store(true, Ordering::Release);
            let _ = thread.join();
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn task_config(name: &str, period_us: u32) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            period_us,
            priority: 10,
            cpu_core: None,
        }
    }

    struct Counter {
        ticks: Arc<AtomicU64>,
        indices: Vec<u64>,
        started: bool,
        stopped: bool,
        work: Duration,
    }

    impl Counter {
        fn new(ticks: Arc<AtomicU64>) -> Self {
            Self {
                ticks,
                indices: Vec::new(),
                started: false,
                stopped: false,
                work: Duration::ZERO,
            }
        }
    }

    impl TaskBody for Counter {
        fn on_start(&mut self) {
            self.started = true;
        }

        fn tick(&mut self, info: &TickInfo) {
            self.indices.push(info.index);
            self.ticks.fetch_add(1, Ordering::Relaxed);
            if !self.work.is_zero() {
                thread::sleep(self.work);
            }
        }

        fn on_stop(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn cycle_stats_basic() {
        let mut stats = CycleStats::new();
        assert_eq!(stats.avg_tick_ns(), 0);

        stats.record(500_000, 1_000, false);
        assert_eq!(stats.tick_count, 1);
        assert_eq!(stats.min_tick_ns, 500_000);
        assert_eq!(stats.max_latency_ns, 1_000);

        stats.record(700_000, 500, true);
        assert_eq!(stats.tick_count, 2);
        assert_eq!(stats.min_tick_ns, 500_000);
        assert_eq!(stats.max_tick_ns, 700_000);
        assert_eq!(stats.max_latency_ns, 1_000);
        assert_eq!(stats.late_ticks, 1);
        assert_eq!(stats.avg_tick_ns(), 600_000);
    }

    #[test]
    fn rt_setup_without_rt_feature_is_noop() {
        #[cfg(not(feature = "rt"))]
        {
            assert!(lock_memory().is_ok());
            let mut config = task_config("setup", 1000);
            config.cpu_core = Some(0);
            assert!(thread_rt_setup(&config).is_ok());
        }
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        thread::sleep(Duration::from_millis(1));
        assert!(monotonic_ns() > a);
    }

    #[test]
    fn task_ticks_and_returns_body() {
        let ticks = Arc::new(AtomicU64::new(0));
        let handle = PeriodicRealtimeTask::new(task_config("tick-test", 1000))
            .spawn(Counter::new(Arc::clone(&ticks)))
            .unwrap();
        assert_eq!(handle.name(), "tick-test");

        thread::sleep(Duration::from_millis(50));
        assert!(handle.health().running);
        let body = handle.stop_and_join().unwrap();

        assert!(body.started);
        assert!(body.stopped);
        assert!(body.indices.len() >= 5, "ticks: {}", body.indices.len());
        // Indices are consecutive from 1: never skipped, never repeated.
        for (i, idx) in body.indices.iter().enumerate() {
            assert_eq!(*idx, i as u64 + 1);
        }
        assert_eq!(ticks.load(Ordering::Relaxed), body.indices.len() as u64);
    }

    #[test]
    fn overrun_is_counted_and_not_caught_up() {
        let ticks = Arc::new(AtomicU64::new(0));
        let mut body = Counter::new(Arc::clone(&ticks));
        body.work = Duration::from_millis(5);

        let handle = PeriodicRealtimeTask::new(task_config("overrun", 1000))
            .spawn(body)
            .unwrap();
        thread::sleep(Duration::from_millis(60));
        let health = handle.health();
        let body = handle.stop_and_join().unwrap();

        assert!(health.late_ticks > 0);
        // Each tick costs 5 ms, so no burst of catch-up ticks can appear.
        assert!(body.indices.len() <= 14, "ticks: {}", body.indices.len());
    }

    #[test]
    fn dropping_handle_stops_thread() {
        let ticks = Arc::new(AtomicU64::new(0));
        let handle = PeriodicRealtimeTask::new(task_config("drop-test", 500))
            .spawn(Counter::new(Arc::clone(&ticks)))
            .unwrap();
        thread::sleep(Duration::from_millis(10));
        drop(handle);
        let after_drop = ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(ticks.load(Ordering::Relaxed), after_drop);
    }
}
