//! Shared wake state between the dispatch loop and mutation callers.

use std::sync::Mutex;

use tokio::sync::{Notify, watch};

use crate::Timer;

/// Coordinates the dispatch loop's single outstanding wait with the
/// mutation surface.
///
/// Two signals flow through here:
/// - *availability*: at least one job is known to be due within the near
///   horizon. Concurrent signals coalesce into a single wake-up.
/// - *preemption*: the timer currently being waited on is stale (a nearer
///   job appeared, or it was cancelled) and the loop must re-fetch.
///   Redundant preempts coalesce into one observable change.
///
/// The current-timer slot is the only mutable state shared between the
/// loop and mutation callers; everything else lives in the store.
pub struct WaitCoordinator {
    available: Notify,
    current: Mutex<Option<Timer>>,
    preempt_tx: watch::Sender<u64>,
}

impl WaitCoordinator {
    pub fn new() -> Self {
        let (preempt_tx, _) = watch::channel(0);
        Self {
            available: Notify::new(),
            current: Mutex::new(None),
            preempt_tx,
        }
    }

    /// Mark that at least one job is due within the near horizon, waking
    /// the loop if it is idling.
    pub fn signal_available(&self) {
        self.available.notify_one();
    }

    /// Block until availability is signalled. A signal sent while nobody
    /// is waiting is stored and consumed by the next call.
    pub async fn wait_available(&self) {
        self.available.notified().await;
    }

    /// The timer the loop is currently waiting on, if any.
    pub fn current(&self) -> Option<Timer> {
        self.current.lock().unwrap().clone()
    }

    /// Record the timer the loop is about to sleep on.
    pub(crate) fn set_current(&self, timer: Timer) {
        *self.current.lock().unwrap() = Some(timer);
    }

    /// Drop the current-timer slot; called when the loop idles, fires,
    /// or abandons a wait.
    pub(crate) fn clear(&self) {
        *self.current.lock().unwrap() = None;
    }

    /// Interrupt the in-progress wait; the loop re-fetches from the store.
    pub fn preempt(&self) {
        self.preempt_tx.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    /// Receiver observing preempt generations. The loop snapshots it
    /// before each fetch so a preempt issued between fetch and sleep is
    /// never lost.
    pub(crate) fn watch_preempt(&self) -> watch::Receiver<u64> {
        self.preempt_tx.subscribe()
    }
}

impl Default for WaitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn timer_with_id(id: i64) -> Timer {
        let mut timer = Timer::new("reminder", Utc::now(), Utc::now(), Payload::new());
        timer.id = Some(id);
        timer
    }

    #[tokio::test]
    async fn test_availability_signals_coalesce() {
        let coordinator = WaitCoordinator::new();
        coordinator.signal_available();
        coordinator.signal_available();
        coordinator.signal_available();

        // Exactly one stored wake-up.
        timeout(Duration::from_secs(1), coordinator.wait_available())
            .await
            .expect("first wait should complete");
        assert!(
            timeout(Duration::from_millis(50), coordinator.wait_available())
                .await
                .is_err(),
            "second wait should block"
        );
    }

    #[tokio::test]
    async fn test_preempts_coalesce_into_one_change() {
        let coordinator = WaitCoordinator::new();
        let mut rx = coordinator.watch_preempt();
        rx.borrow_and_update();

        coordinator.preempt();
        coordinator.preempt();

        timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("change should be observed")
            .unwrap();
        rx.borrow_and_update();
        assert!(
            timeout(Duration::from_millis(50), rx.changed())
                .await
                .is_err(),
            "coalesced preempts produce a single change"
        );
    }

    #[tokio::test]
    async fn test_preempt_between_snapshot_and_wait_is_seen() {
        let coordinator = WaitCoordinator::new();
        let mut rx = coordinator.watch_preempt();
        rx.borrow_and_update();

        // Preempt lands before the loop starts waiting.
        coordinator.preempt();

        timeout(Duration::from_millis(50), rx.changed())
            .await
            .expect("pending preempt should resolve immediately")
            .unwrap();
    }

    #[test]
    fn test_current_slot() {
        let coordinator = WaitCoordinator::new();
        assert!(coordinator.current().is_none());

        coordinator.set_current(timer_with_id(7));
        assert_eq!(coordinator.current().unwrap().id, Some(7));

        coordinator.clear();
        assert!(coordinator.current().is_none());
    }
}
