use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use super::CacheKey;

/// Coalesces concurrent computations for the same key. The first caller runs
/// `init`; callers arriving while it runs wait for its value instead.
///
/// If the running caller is dropped or fails, one of the waiters runs its own
/// `init`. Failures are never shared. The map lock is never held across an
/// await, so entries are released synchronously even when a caller is dropped.
pub struct SingleFlight<V> {
    inflight: Mutex<HashMap<CacheKey, Arc<OnceCell<V>>>>,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

/// Value returned by [`SingleFlight::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct Flight<V> {
    pub value: V,
    /// False when another caller's computation produced `value`.
    pub computed: bool,
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut, E>(&self, key: &CacheKey, init: F) -> Result<Flight<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = Arc::clone(self.lock().entry(key.clone()).or_default());
        let _leave = Leave {
            inflight: &self.inflight,
            key,
            cell: &cell,
        };

        let mut computed = false;
        let outcome = cell
            .get_or_try_init(|| {
                computed = true;
                init()
            })
            .await
            .cloned();

        outcome.map(|value| Flight { value, computed })
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Arc<OnceCell<V>>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases a caller's hold on its entry on every exit path, cancellation
/// included. The entry goes once a value exists or no other caller waits on it.
struct Leave<'a, V> {
    inflight: &'a Mutex<HashMap<CacheKey, Arc<OnceCell<V>>>>,
    key: &'a CacheKey,
    cell: &'a Arc<OnceCell<V>>,
}

impl<V> Drop for Leave<'_, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        let ours = inflight
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, self.cell));
        // Two references: the map's and this caller's.
        if ours && (self.cell.initialized() || Arc::strong_count(self.cell) <= 2) {
            inflight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::cache::Normalization;

    fn key(content: &str) -> CacheKey {
        let n = Normalization {
            sample_threshold_chars: 1_000,
            sample_chars: 100,
        };
        CacheKey::derive(content, "t", "m", &n)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let flights = Arc::new(SingleFlight::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            set.spawn(async move {
                flights
                    .run(&key("doc"), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>("value".to_owned())
                    })
                    .await
            });
        }

        let mut computed = 0;
        while let Some(joined) = set.join_next().await {
            let flight = joined.unwrap().unwrap();
            assert_eq!(flight.value, "value");
            computed += usize::from(flight.computed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(computed, 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_are_not_shared_or_remembered() {
        let flights = SingleFlight::<u32>::new();
        let err = flights
            .run(&key("k"), || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(err, Err("boom"));

        let ok = flights
            .run(&key("k"), || async { Ok::<_, &str>(7) })
            .await
            .unwrap();
        assert_eq!(ok.value, 7);
        assert!(ok.computed);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_off_to_waiter() {
        let flights = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run(&key("k"), || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, ()>(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run(&key("k"), || async { Ok::<_, ()>(2) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let flight = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(flight.value, 2);
        assert!(flight.computed);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_leader_without_waiters_releases_its_entry() {
        let flights = SingleFlight::<u32>::new();
        let timed_out = tokio::time::timeout(
            Duration::from_millis(20),
            flights.run(&key("k"), || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, ()>(1)
            }),
        )
        .await;
        assert!(timed_out.is_err());
        assert_eq!(flights.in_flight(), 0);

        let flight = flights
            .run(&key("k"), || async { Ok::<_, ()>(2) })
            .await
            .unwrap();
        assert_eq!(flight.value, 2);
        assert!(flight.computed);
    }

    #[tokio::test]
    async fn failed_leader_without_waiters_releases_its_entry() {
        let flights = SingleFlight::<u32>::new();
        let _ = flights.run(&key("k"), || async { Err::<u32, _>("boom") }).await;
        assert_eq!(flights.in_flight(), 0);
    }
}
