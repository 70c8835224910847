//! Cooperative poll scheduler
//!
//! One loop drives every poll-capable plugin. On each tick a plugin whose
//! task is mid-flight is resumed for exactly one step; otherwise, if its
//! next-due time has passed, a fresh task is started and run to its first
//! yield. When a task completes or fails, the next-due time is set one
//! `poll_interval` after the tick that finished it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::plugins::trait_def::{PollTask, Poller};

/// Spacing used when a poller has never reported a usable interval
const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

struct SlotState {
    task: Option<PollTask>,
    next_due: Instant,
    /// Last value `poll_interval` returned without panicking
    interval: Duration,
}

struct PollSlot {
    name: String,
    poller: Arc<dyn Poller>,
    state: Mutex<SlotState>,
    /// Set while a step of this plugin's task is executing
    in_flight: AtomicBool,
}

impl PollSlot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the slot for this tick, or `None` if another tick holds it
    fn claim(&self) -> Option<InFlight<'_>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(InFlight(&self.in_flight))
        }
    }

    /// Current poll interval, or the last known one if the poller panics
    fn interval(&self) -> Duration {
        match panic::catch_unwind(AssertUnwindSafe(|| self.poller.poll_interval())) {
            Ok(interval) => {
                self.state().interval = interval;
                interval
            }
            Err(_) => {
                tracing::error!("Poll interval for {} panicked", self.name);
                self.state().interval
            }
        }
    }
}

/// Clears a slot's `in_flight` flag when dropped, including during unwinding
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What happened to one plugin's task during a tick
enum StepOutcome {
    Yielded,
    Completed,
    Failed,
}

/// Summary of a single scheduler tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Task steps executed
    pub steps: usize,
    pub completed: usize,
    pub failed: usize,
    /// Plugins skipped because a previous step was still running
    pub busy: usize,
}

/// Drives every registered poller
#[derive(Default)]
pub struct PollScheduler {
    slots: RwLock<Vec<Arc<PollSlot>>>,
}

impl PollScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a poller. Its first task starts on the first tick at or after `first_due`.
    pub fn register(&self, name: impl Into<String>, poller: Arc<dyn Poller>, first_due: Instant) {
        let slot = PollSlot {
            name: name.into(),
            poller,
            state: Mutex::new(SlotState {
                task: None,
                next_due: first_due,
                interval: FALLBACK_INTERVAL,
            }),
            in_flight: AtomicBool::new(false),
        };
        tracing::debug!("Scheduling poller: {}", slot.name);
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(slot));
    }

    /// Drop every poller and its in-progress task
    pub fn clear(&self) {
        self.slots.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<PollSlot>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Next-due time of the named poller
    pub fn next_due(&self, name: &str) -> Option<Instant> {
        self.snapshot()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.state().next_due)
    }

    /// Whether the named poller has a task suspended at a yield point
    pub fn is_mid_task(&self, name: &str) -> bool {
        self.snapshot()
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.state().task.is_some())
            .unwrap_or(false)
    }

    /// Run one scheduler pass at time `now`
    pub fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        for slot in self.snapshot() {
            let Some(_claim) = slot.claim() else {
                report.busy += 1;
                continue;
            };

            let resumed = slot.state().task.take();
            let outcome = match resumed {
                Some(task) => {
                    report.steps += 1;
                    Self::step(&slot, task)
                }
                None if slot.state().next_due <= now => match Self::start(&slot) {
                    Some(task) => {
                        report.steps += 1;
                        Self::step(&slot, task)
                    }
                    None => StepOutcome::Failed,
                },
                None => continue,
            };

            let finished = match outcome {
                StepOutcome::Yielded => false,
                StepOutcome::Completed => {
                    report.completed += 1;
                    true
                }
                StepOutcome::Failed => {
                    report.failed += 1;
                    true
                }
            };
            if finished {
                let interval = slot.interval();
                slot.state().next_due = now + interval;
            }
        }

        report
    }

    /// Create a fresh task, containing a panic in the poller's `poll`
    fn start(slot: &PollSlot) -> Option<PollTask> {
        tracing::debug!("Starting poll task: {}", slot.name);
        let poller = Arc::clone(&slot.poller);
        match panic::catch_unwind(AssertUnwindSafe(move || poller.poll())) {
            Ok(task) => Some(task),
            Err(_) => {
                tracing::error!("Poll task for {} panicked while starting", slot.name);
                None
            }
        }
    }

    /// Resume `task` up to its next yield point
    fn step(slot: &PollSlot, mut task: PollTask) -> StepOutcome {
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.next()));
        match result {
            Ok(Some(Ok(()))) => {
                slot.state().task = Some(task);
                StepOutcome::Yielded
            }
            Ok(None) => {
                tracing::debug!("Poll task finished: {}", slot.name);
                StepOutcome::Completed
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("Poll task for {} failed: {}", slot.name, e);
                StepOutcome::Failed
            }
            Err(_) => {
                tracing::error!("Poll task for {} panicked", slot.name);
                StepOutcome::Failed
            }
        }
    }

    /// Tick every `period` until `shutdown` flips to true.
    ///
    /// Each tick runs on the blocking pool and is awaited before the next
    /// one starts; poll steps may perform blocking I/O.
    pub async fn run(self: Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("Poll scheduler started with {} pollers", self.len());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let scheduler = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || scheduler.tick(Instant::now())).await {
                Ok(report) if report.failed > 0 => {
                    tracing::debug!("Poll tick: {:?}", report);
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Poll tick aborted: {}", e),
            }
        }

        tracing::info!("Poll scheduler stopped");
    }
}
