//! In-process single-flight: at most one operation per key at a time.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

/// Set of keys with an operation in progress.
///
/// [`SingleFlight::try_begin`] checks and inserts atomically; the returned
/// guard removes the key when dropped, including on panic unwind.
pub struct SingleFlight<K: Eq + Hash> {
    inflight: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Clone for SingleFlight<K> {
    fn clone(&self) -> Self {
        Self {
            inflight: self.inflight.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

pub struct FlightGuard<K: Eq + Hash> {
    key: Option<K>,
    inflight: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            set.remove(&key);
        }
    }
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`. `None` if an operation for it is already running.
    pub fn try_begin(&self, key: K) -> Option<FlightGuard<K>> {
        let mut set = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(key.clone()) {
            return None;
        }
        Some(FlightGuard {
            key: Some(key),
            inflight: self.inflight.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn second_claim_is_refused_until_release() {
        let flights = SingleFlight::new();

        let guard = flights.try_begin("dev").unwrap();
        assert!(flights.try_begin("dev").is_none());
        assert!(flights.try_begin("other").is_some());

        drop(guard);
        assert!(flights.try_begin("dev").is_some());
    }

    #[test]
    fn racing_threads_get_one_claim() {
        let flights = SingleFlight::new();
        let winners = Arc::new(AtomicU32::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let hold = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flights = flights.clone();
                let winners = winners.clone();
                let barrier = barrier.clone();
                let hold = hold.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = flights.try_begin(42u32);
                    if guard.is_some() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    // keep the winner's claim alive until everyone has tried
                    hold.wait();
                    drop(guard);
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}
