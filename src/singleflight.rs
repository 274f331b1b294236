//! Request coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight fetch:
//! the first caller becomes the leader and runs the work, everyone else
//! subscribes to the outcome. Without this, a cold cache plus a popular
//! author means N identical upstream calls.
//!
//! Cancellation follows the caller that initiated the flight: if the
//! leader's future is dropped mid-fetch, waiters observe [`Error::Canceled`]
//! as the shared outcome. Waiters abandoning their receive have no effect
//! on the flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{Error, Result};

type Flights<T> = Arc<Mutex<HashMap<String, broadcast::Sender<Result<T>>>>>;

/// A coalescing group. Keys are cache-key strings, so distinct entity
/// kinds never collide even when their numeric IDs do.
pub struct Group<T> {
    flights: Flights<T>,
}

impl<T> Default for Group<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Clone + Send + 'static> Group<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fetch` once per key; concurrent callers share the result.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // The mutex guard used to decide leader-vs-waiter must never be
        // live across an `.await` point (parking_lot guards aren't Send),
        // so that decision is made in a plain, non-async helper.
        match self.begin(key) {
            Lead::Waiter(mut rx) => match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(Error::Canceled),
            },
            Lead::Leader(guard) => {
                // Leader path. The guard publishes a cancellation if the
                // future is dropped before the fetch resolves.
                let result = fetch().await;
                guard.complete(result.clone());
                result
            }
        }
    }

    fn begin(&self, key: &str) -> Lead<T> {
        let mut flights = self.flights.lock();
        if let Some(tx) = flights.get(key) {
            Lead::Waiter(tx.subscribe())
        } else {
            let (tx, _) = broadcast::channel(1);
            flights.insert(key.to_string(), tx);
            drop(flights);
            Lead::Leader(FlightGuard {
                key: key.to_string(),
                flights: Arc::clone(&self.flights),
                done: false,
            })
        }
    }

    /// Number of keys currently in flight.
    pub fn len(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.lock().is_empty()
    }
}

enum Lead<T> {
    Waiter(broadcast::Receiver<Result<T>>),
    Leader(FlightGuard<T>),
}

struct FlightGuard<T> {
    key: String,
    flights: Flights<T>,
    done: bool,
}

impl<T: Clone + Send + 'static> FlightGuard<T> {
    fn complete(mut self, result: Result<T>) {
        if let Some(tx) = self.flights.lock().remove(&self.key) {
            // No receivers just means nobody coalesced with us.
            let _ = tx.send(result);
        }
        self.done = true;
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Leader dropped without completing: wake waiters with an error
        // instead of leaving them parked forever.
        if let Some(tx) = self.flights.lock().remove(&self.key) {
            let _ = tx.send(Err(Error::Canceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let group = Arc::new(Group::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = Arc::clone(&group);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                group
                    .run("a1", || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(7)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_errors_fan_out() {
        let group = Arc::new(Group::<u64>::new());

        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("w9", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::NotFound)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run("w9", || async { Ok(0) }).await })
        };

        assert_eq!(leader.await.unwrap().unwrap_err(), Error::NotFound);
        assert_eq!(waiter.await.unwrap().unwrap_err(), Error::NotFound);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let group = Arc::new(Group::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let one = group.run("b1", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        });
        let two = group.run("b2", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        });

        let (one, two) = tokio::join!(one, two);
        assert_eq!(one.unwrap(), 1);
        assert_eq!(two.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_leader_cancellation_wakes_waiters() {
        let group = Arc::new(Group::<u64>::new());

        let leader = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                group
                    .run("a5", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(0)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let group = Arc::clone(&group);
            tokio::spawn(async move { group.run("a5", || async { Ok(0) }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(waiter.await.unwrap().unwrap_err(), Error::Canceled);
        assert!(group.is_empty());
    }
}
