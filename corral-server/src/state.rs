//! In-memory mirror of the current assignment, used to answer worker long
//! polls without a store round trip.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::error;

use corral_core::wire::WorkerState;
use corral_core::Job;

use crate::{report, store::Store, AppState, GC_INTERVAL, WORKER_TTL};

/// Snapshot of worker assignments. The map is reassigned whole, never
/// mutated in place: readers clone the `Arc` under the lock and then work
/// on a stable snapshot.
pub struct StateCache {
    states: Mutex<Arc<HashMap<String, WorkerState>>>,
    changed: Notify,
}

impl StateCache {
    pub fn new() -> Self {
        StateCache {
            states: Mutex::new(Arc::new(HashMap::new())),
            changed: Notify::new(),
        }
    }

    /// Swap in a freshly loaded assignment map and wake every long poll.
    pub fn replace(&self, new: HashMap<String, WorkerState>) {
        *self.states.lock().expect("state mutex poisoned") = Arc::new(new);
        self.changed.notify_waiters();
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, WorkerState>> {
        self.states.lock().expect("state mutex poisoned").clone()
    }

    /// Current state for a worker; an unknown worker is idle.
    pub fn get(&self, id: &str) -> WorkerState {
        self.snapshot()
            .get(id)
            .cloned()
            .unwrap_or_else(|| WorkerState::empty(id))
    }

    /// The worker currently assigned the given job, if any.
    pub fn find_worker(&self, job: &Job) -> Option<String> {
        self.snapshot()
            .values()
            .find(|s| s.job.as_ref() == Some(job))
            .map(|s| s.id.clone())
    }

    /// Wait until the worker's state differs from `old`, or until the
    /// ceiling expires. Returns the state and whether it changed.
    pub async fn wait_for_change(&self, old: &WorkerState, ceiling: Duration) -> (WorkerState, bool) {
        let deadline = Instant::now() + ceiling;
        loop {
            // Arm the notification before reading, so a swap between the
            // read and the wait is not missed.
            let notified = self.changed.notified();
            let cur = self.get(&old.id);
            if cur != *old {
                return (cur, true);
            }
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(deadline) => return (old.clone(), false),
            }
        }
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Reload the assignment cache from the store.
pub async fn reload_states(state: &Arc<AppState>) -> Result<()> {
    let states = state.store.load_states().await?;
    state.cache.replace(states);
    Ok(())
}

/// Follow the store's wake-up channels: reload the assignment cache on
/// `state_wakeup` and drain the reporter on `report`. Wake-ups can be
/// spurious (a fill that assigned nothing still bumps the channel), which
/// only costs a redundant reload of a small table.
///
/// The initial load happens here too; failing it means the coordinator
/// would serve stale nothing, so it is fatal.
pub async fn notify_loop(state: Arc<AppState>) {
    let mut wakeup = state.store.subscribe_state();
    let mut report_rx = state.store.subscribe_report();

    if let Err(e) = reload_states(&state).await {
        error!("boot: loading worker state: {e:#}");
        std::process::exit(1);
    }
    if let Err(e) = report::report_results(&state).await {
        error!("boot: reporting results: {e:#}");
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            changed = wakeup.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Err(e) = reload_states(&state).await {
                    error!("loading worker state: {e:#}");
                }
            }
            changed = report_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Err(e) = report::report_results(&state).await {
                    error!("reporting results: {e:#}");
                }
            }
        }
    }
}

/// Periodically delete workers that have stopped pinging. The cascade frees
/// their runs and the fill re-queues the orphaned jobs.
pub async fn gc_loop(store: Store) {
    let mut interval = tokio::time::interval(GC_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = store.gc_workers(WORKER_TTL.as_secs() as i64).await {
            error!("gc stale workers: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_job(id: &str, sha: &str) -> WorkerState {
        WorkerState {
            id: id.to_string(),
            job: Some(Job {
                sha: sha.to_string(),
                dir: "/".to_string(),
                name: "t".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn unknown_worker_is_idle() {
        let cache = StateCache::new();
        assert_eq!(cache.get("w1"), WorkerState::empty("w1"));
    }

    #[tokio::test]
    async fn wait_returns_old_state_on_timeout() {
        let cache = StateCache::new();
        let old = WorkerState::empty("w1");
        let (got, changed) = cache
            .wait_for_change(&old, Duration::from_millis(20))
            .await;
        assert!(!changed);
        assert_eq!(got, old);
    }

    #[tokio::test]
    async fn wait_wakes_on_replace() {
        let cache = Arc::new(StateCache::new());
        let old = WorkerState::empty("w1");

        let waiter = {
            let cache = cache.clone();
            let old = old.clone();
            tokio::spawn(async move { cache.wait_for_change(&old, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut new = HashMap::new();
        new.insert("w1".to_string(), state_with_job("w1", "abc"));
        cache.replace(new);

        let (got, changed) = waiter.await.unwrap();
        assert!(changed);
        assert_eq!(got, state_with_job("w1", "abc"));
    }

    #[tokio::test]
    async fn replace_for_other_worker_does_not_release_the_poll() {
        let cache = Arc::new(StateCache::new());
        let old = WorkerState::empty("w1");

        let waiter = {
            let cache = cache.clone();
            let old = old.clone();
            tokio::spawn(async move {
                cache.wait_for_change(&old, Duration::from_millis(50)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut new = HashMap::new();
        new.insert("w2".to_string(), state_with_job("w2", "abc"));
        cache.replace(new);

        let (got, changed) = waiter.await.unwrap();
        assert!(!changed);
        assert_eq!(got, old);
    }

    #[test]
    fn find_worker_matches_job() {
        let cache = StateCache::new();
        let mut new = HashMap::new();
        new.insert("w1".to_string(), state_with_job("w1", "abc"));
        cache.replace(new);

        let job = Job {
            sha: "abc".into(),
            dir: "/".into(),
            name: "t".into(),
        };
        assert_eq!(cache.find_worker(&job), Some("w1".to_string()));
        let other = Job {
            sha: "def".into(),
            dir: "/".into(),
            name: "t".into(),
        };
        assert_eq!(cache.find_worker(&other), None);
    }
}
