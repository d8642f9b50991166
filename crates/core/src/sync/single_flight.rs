use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

/// Collapses concurrent calls for the same key into one execution. The first
/// caller runs the work; callers arriving while it is in flight wait for and
/// share its result. Entries are removed as soon as the work completes.
pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Follower(watch::Receiver<Option<V>>),
}

/// Removes the leader's entry even if its future is dropped mid-flight.
struct EntryGuard<'a, K: Eq + Hash, V> {
    flights: &'a SingleFlight<K, V>,
    key: &'a K,
}

impl<K: Eq + Hash, V> Drop for EntryGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut map = match self.flights.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.remove(self.key);
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, watch::Receiver<Option<V>>>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Run `work` for `key` unless a run is already in flight, in which case
    /// wait for that run's result instead.
    pub async fn run<F, Fut>(&self, key: &K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let tx = loop {
            let role = {
                let mut map = self.lock();
                match map.get(key) {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        map.insert(key.clone(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => break tx,
                Role::Follower(mut rx) => {
                    let shared = rx
                        .wait_for(|v| v.is_some())
                        .await
                        .ok()
                        .and_then(|v| (*v).clone());
                    if let Some(value) = shared {
                        return value;
                    }
                    // Leader went away without a result; contend again.
                }
            }
        };

        let _guard = EntryGuard { flights: self, key };
        let value = work().await;
        tx.send_replace(Some(value.clone()));
        value
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
