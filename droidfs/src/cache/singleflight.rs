//! Coalesce concurrent fetches for the same key into one device request.
//!
//! The first caller for a key runs the fetch; everyone arriving while it is in
//! flight subscribes and receives a clone of the same result. If the running
//! caller is cancelled, the entry is removed and one of the waiters takes over.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use tokio::sync::broadcast;

use crate::error::Result;

struct InFlight<V> {
    tx: broadcast::Sender<Result<V>>,
}

pub struct SingleFlight<K, V> {
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Clears the in-flight entry when the executing caller finishes or is dropped.
struct Leader<'a, K: Hash + Eq, V> {
    map: &'a Mutex<HashMap<K, InFlight<V>>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V> Leader<'_, K, V> {
    fn finish(mut self, result: &Result<V>)
    where
        V: Clone,
    {
        if let Some(key) = self.key.take() {
            if let Some(entry) = self.map.lock().remove(&key) {
                // no receivers is fine
                let _ = entry.tx.send(result.clone());
            }
        }
    }
}

impl<K: Hash + Eq, V> Drop for Leader<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.map.lock().remove(&key);
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key` unless a run is already in flight, in which case wait
    /// for that one and share its result.
    pub async fn execute<F, Fut>(&self, key: K, mut f: F) -> Result<V>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        loop {
            let rx = {
                let mut guard = self.in_flight.lock();
                match guard.get(&key) {
                    Some(in_flight) => Some(in_flight.tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(1);
                        guard.insert(key.clone(), InFlight { tx });
                        None
                    }
                }
            };

            if let Some(mut rx) = rx {
                match rx.recv().await {
                    Ok(result) => return result,
                    // leader was cancelled; try again
                    Err(_) => continue,
                }
            }

            let leader = Leader {
                map: &self.in_flight,
                key: Some(key.clone()),
            };
            let result = f().await;
            leader.finish(&result);
            return result;
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let sf: Arc<SingleFlight<u64, u64>> = Arc::new(SingleFlight::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                sf.execute(7, || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    }
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn errors_are_shared_too() {
        let sf: SingleFlight<u64, u64> = SingleFlight::new();
        let r = sf.execute(1, || async { Err(BridgeError::Timeout) }).await;
        assert_eq!(r, Err(BridgeError::Timeout));
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_leader_hands_over() {
        let sf: Arc<SingleFlight<u64, u64>> = Arc::new(SingleFlight::new());
        let leader = {
            let sf = sf.clone();
            tokio::spawn(async move {
                sf.execute(1, || async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(0)
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = {
            let sf = sf.clone();
            tokio::spawn(async move { sf.execute(1, || async { Ok(5) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        assert_eq!(follower.await.unwrap().unwrap(), 5);
    }
}
