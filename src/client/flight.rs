//! Single-flight request coalescing

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;

type Inflight<K, V> = Arc<Mutex<HashMap<K, watch::Receiver<Option<V>>>>>;

/// Removes a key from the registry when its flight ends, panics included
struct FlightGuard<K: Eq + Hash, V> {
    registry: Inflight<K, V>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for FlightGuard<K, V> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

/// Coalesces concurrent calls for the same key into one spawned operation.
///
/// The operation runs as its own task, so it completes even if every caller
/// stops waiting; its result is then simply not observed.
#[derive(Debug)]
pub struct SingleFlight<K, V> {
    inflight: Inflight<K, V>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight operation for `key`, or start one with `start`.
    ///
    /// Returns `None` if the operation's task died without a result.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> Option<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut rx = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.clone(), rx.clone());

                    let fut = start();
                    let guard = FlightGuard {
                        registry: Arc::clone(&self.inflight),
                        key: key.clone(),
                    };
                    tokio::spawn(async move {
                        let value = fut.await;
                        // Later callers start a new flight from here on
                        drop(guard);
                        let _ = tx.send(Some(value));
                    });
                    rx
                }
            }
        };

        let result = rx.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
        result
    }

    /// Number of keys with an operation in flight
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
