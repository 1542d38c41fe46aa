//! Job scheduling API and the dispatch loop.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, sleep_until};
use tracing::{debug, error, info};

use crate::{Payload, SchedulerError, Timer, TimerStore, WaitCoordinator};

/// Look-ahead window. Jobs expiring further out stay in the store and are
/// picked up by a later fetch, bounding the in-memory wait and the cost
/// of a preemption restart.
const HORIZON_DAYS: i64 = 24;

/// Requests at or below this duration skip the store entirely and fire
/// from memory.
const EPHEMERAL_MAX_SECS: i64 = 60;

/// Delay before restarting the loop after a store fault, so a dead
/// database does not spin the loop.
const RESTART_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Completion channel capacity.
const COMPLETION_CAPACITY: usize = 64;

fn horizon() -> Duration {
    Duration::days(HORIZON_DAYS)
}

/// Handle returned by [`Scheduler::schedule`].
#[derive(Debug)]
pub enum TimerRef {
    /// Durable row; the id works with cancel/update.
    Durable(i64),
    /// In-memory one-shot task; aborting the handle cancels it.
    Ephemeral(AbortHandle),
}

/// The timer system's mutation surface and owner of the dispatch worker.
///
/// One `Scheduler` runs at most one dispatch loop. Mutation calls
/// (schedule/cancel/update) may arrive concurrently from many tasks; they
/// interact with the loop only through the store and the
/// [`WaitCoordinator`], never by replacing the worker task.
pub struct Scheduler {
    store: Arc<dyn TimerStore>,
    coordinator: Arc<WaitCoordinator>,
    completions: broadcast::Sender<Timer>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TimerStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (completions, _) = broadcast::channel(COMPLETION_CAPACITY);
        Self {
            store,
            coordinator: Arc::new(WaitCoordinator::new()),
            completions,
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    /// Subscribe to fired timers. Consumers match on
    /// [`Timer::completion_event`] (or [`Timer::event`]) and read the
    /// payload; delivery is fan-out, every subscriber sees every firing.
    pub fn subscribe(&self) -> broadcast::Receiver<Timer> {
        self.completions.subscribe()
    }

    /// The timer the dispatch loop is currently waiting on, if any.
    pub fn current(&self) -> Option<Timer> {
        self.coordinator.current()
    }

    /// Launch the dispatch loop. A no-op when it is already running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("dispatch loop already running");
            return;
        }

        // Reset the shutdown flag left by a previous stop(). send() would
        // fail once the old worker's receiver is gone, so the value is
        // replaced unconditionally.
        self.shutdown_tx.send_replace(false);

        let dispatch = DispatchLoop {
            store: Arc::clone(&self.store),
            coordinator: Arc::clone(&self.coordinator),
            completions: self.completions.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *worker = Some(tokio::spawn(dispatch.run()));
        info!("dispatch loop started");
    }

    /// Cancel any in-flight wait and stop the dispatch loop.
    pub async fn stop(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            self.shutdown_tx.send_replace(true);
            let _ = handle.await;
        }
    }

    /// Force a fresh top-of-loop fetch. Safe to call concurrently;
    /// redundant restarts coalesce into one wake of the single loop.
    pub fn restart(&self) {
        self.coordinator.preempt();
    }

    /// Schedule a job. Requests with `expiry - created` of a minute or
    /// less fire from memory without a durable row; longer requests are
    /// persisted and survive restarts.
    pub async fn schedule(
        &self,
        event: &str,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: Payload,
    ) -> Result<TimerRef, SchedulerError> {
        self.schedule_inner(event, created, expiry, payload, false)
            .await
    }

    /// Schedule a job with a durable row regardless of duration.
    pub async fn schedule_durable(
        &self,
        event: &str,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: Payload,
    ) -> Result<TimerRef, SchedulerError> {
        self.schedule_inner(event, created, expiry, payload, true)
            .await
    }

    async fn schedule_inner(
        &self,
        event: &str,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: Payload,
        force_durable: bool,
    ) -> Result<TimerRef, SchedulerError> {
        if event.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "event name must not be empty".to_string(),
            ));
        }

        let delta = expiry - created;
        if delta <= Duration::seconds(EPHEMERAL_MAX_SECS) && !force_durable {
            // A past expiry yields a zero sleep and fires immediately.
            let timer = Timer::new(event, created, expiry, payload);
            let completions = self.completions.clone();
            let handle = tokio::spawn(async move {
                sleep(timer.remaining(Utc::now())).await;
                let _ = completions.send(timer);
            });
            debug!(event, "scheduled ephemeral timer");
            return Ok(TimerRef::Ephemeral(handle.abort_handle()));
        }

        let id = self.store.insert(event, created, expiry, &payload).await?;

        if delta <= horizon() {
            self.coordinator.signal_available();
            // An empty slot can also mean the loop is between fetch and
            // sleep and may have fetched a later job; preempting then
            // costs one re-fetch rather than a missed wake.
            match self.coordinator.current() {
                Some(current) if expiry >= current.expiry => {}
                _ => self.coordinator.preempt(),
            }
        }

        info!(id, event, expiry = %expiry, "scheduled durable timer");
        Ok(TimerRef::Durable(id))
    }

    /// Cancel a job by id. Returns whether a row was actually removed;
    /// a missing id is not an error.
    pub async fn cancel(&self, id: i64) -> Result<bool, SchedulerError> {
        let removed = self.store.delete(id).await?;
        if removed {
            match self.coordinator.current().and_then(|t| t.id) {
                Some(current_id) if current_id != id => {}
                // Either the loop waits on the now-deleted row, or the
                // slot is empty and it may be about to.
                _ => self.coordinator.preempt(),
            }
            info!(id, "cancelled timer");
        }
        Ok(removed)
    }

    /// Cancel every job matching the event/payload-field filter.
    /// Returns the number removed; triggers at most one restart.
    pub async fn cancel_all(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<u64, SchedulerError> {
        let removed = self.store.delete_matching(event, field, value).await?;
        if !removed.is_empty() {
            match self.coordinator.current().and_then(|t| t.id) {
                Some(current_id) if !removed.contains(&current_id) => {}
                _ => self.coordinator.preempt(),
            }
            info!(event, count = removed.len(), "cancelled matching timers");
        }
        Ok(removed.len() as u64)
    }

    /// Fetch-modify-store a job's payload. The dispatch loop reads the
    /// row back from the store at firing time, so an edit made while it
    /// sleeps is carried by the firing.
    pub async fn update<F>(&self, id: i64, mutate: F) -> Result<bool, SchedulerError>
    where
        F: FnOnce(&mut Payload),
    {
        let Some(mut timer) = self.store.fetch(id).await? else {
            return Ok(false);
        };
        mutate(&mut timer.payload);

        Ok(self.store.update_payload(id, &timer.payload).await?)
    }

    /// Set a boolean payload flag (e.g. marking a reminder secret).
    pub async fn set_payload_flag(
        &self,
        id: i64,
        key: &str,
        value: bool,
    ) -> Result<bool, SchedulerError> {
        self.update(id, |payload| {
            payload.insert(key.to_string(), Value::Bool(value));
        })
        .await
    }

    /// Matching jobs ordered by expiry ascending (per-user listing).
    pub async fn list(
        &self,
        event: &str,
        field: &str,
        value: &Value,
        limit: u32,
    ) -> Result<Vec<Timer>, SchedulerError> {
        Ok(self.store.fetch_matching(event, field, value, limit).await?)
    }

    /// Number of jobs matching the filter.
    pub async fn count(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<u64, SchedulerError> {
        Ok(self.store.count_matching(event, field, value).await?)
    }
}

enum Outcome {
    Continue,
    Shutdown,
}

/// The single dispatch worker.
///
/// Repeatedly fetches the nearest pending job, sleeps until its expiry,
/// then claims the row and broadcasts it. Any fault from the store abandons the
/// iteration and restarts the loop from a fresh fetch after a short
/// delay; shutdown cancels whatever wait is in progress.
struct DispatchLoop {
    store: Arc<dyn TimerStore>,
    coordinator: Arc<WaitCoordinator>,
    completions: broadcast::Sender<Timer>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DispatchLoop {
    async fn run(mut self) {
        let mut preempt_rx = self.coordinator.watch_preempt();

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match self.run_once(&mut preempt_rx).await {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Shutdown) => break,
                Err(e) => {
                    error!(error = %e, "dispatch loop faulted, restarting");
                    tokio::select! {
                        biased;
                        _ = self.shutdown_rx.changed() => {
                            if *self.shutdown_rx.borrow() {
                                break;
                            }
                        }
                        _ = sleep(RESTART_DELAY) => {}
                    }
                }
            }
        }

        self.coordinator.clear();
        info!("dispatch loop stopped");
    }

    /// One pass through FETCHING → {IDLE_WAIT | TIMED_SLEEP} → FIRING.
    async fn run_once(
        &mut self,
        preempt_rx: &mut watch::Receiver<u64>,
    ) -> Result<Outcome, SchedulerError> {
        // Snapshot the preempt generation before fetching so a preempt
        // issued between fetch and sleep still interrupts the sleep.
        preempt_rx.borrow_and_update();

        let Some(timer) = self.wait_for_timer().await? else {
            return Ok(Outcome::Shutdown);
        };

        self.coordinator.set_current(timer.clone());

        let remaining = timer.remaining(Utc::now());
        if !remaining.is_zero() {
            debug!(id = ?timer.id, remaining_ms = remaining.as_millis() as u64, "sleeping until expiry");
            let deadline = tokio::time::Instant::now() + remaining;
            loop {
                tokio::select! {
                    biased;
                    _ = self.shutdown_rx.changed() => {
                        if *self.shutdown_rx.borrow() {
                            self.coordinator.clear();
                            return Ok(Outcome::Shutdown);
                        }
                    }
                    _ = preempt_rx.changed() => {
                        // A nearer job appeared or this one was removed.
                        debug!(id = ?timer.id, "wait preempted, re-fetching");
                        self.coordinator.clear();
                        return Ok(Outcome::Continue);
                    }
                    _ = sleep_until(deadline) => break,
                }
            }
        }

        self.coordinator.clear();
        self.fire(timer).await?;
        Ok(Outcome::Continue)
    }

    /// FETCHING / IDLE_WAIT: next job within the horizon, blocking until
    /// one is signalled. Returns `None` on shutdown.
    async fn wait_for_timer(&mut self) -> Result<Option<Timer>, SchedulerError> {
        if let Some(timer) = self.store.next_before(horizon()).await? {
            return Ok(Some(timer));
        }

        self.coordinator.clear();
        debug!("no pending timers, idling");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return Ok(None);
                    }
                }
                _ = self.coordinator.wait_available() => {
                    if let Some(timer) = self.store.next_before(horizon()).await? {
                        return Ok(Some(timer));
                    }
                    // Stale signal (job was cancelled before we woke, or
                    // it sits beyond the horizon); keep idling.
                }
            }
        }
    }

    /// FIRING: claim the row, then broadcast it.
    ///
    /// The claim deletes and returns the row in one statement, so a
    /// cancel racing the end of the sleep is decided in the store (a
    /// cancelled job never fires) and the broadcast carries any payload
    /// edits made while the loop slept. Send only fails when nobody is
    /// subscribed; firing with no consumers is not an error.
    async fn fire(&self, timer: Timer) -> Result<(), SchedulerError> {
        let Some(id) = timer.id else {
            let _ = self.completions.send(timer);
            return Ok(());
        };

        let Some(claimed) = self.store.remove(id).await? else {
            debug!(id, "timer gone before firing, skipping");
            return Ok(());
        };

        debug!(id, event = %claimed.event, "firing timer");
        let _ = self.completions.send(claimed);
        Ok(())
    }
}
