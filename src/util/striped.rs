//! N-way striped async mutex
//!
//! Per-key mutual exclusion without a single global lock: a key hashes to
//! one of N stripes. Two keys on the same stripe serialize; collisions
//! only reduce parallelism, never correctness.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

pub struct StripedMutex {
    stripes: Vec<Mutex<()>>,
}

impl StripedMutex {
    /// Create a striped mutex with `stripe_count` stripes (minimum 1).
    pub fn new(stripe_count: usize) -> Self {
        let stripe_count = stripe_count.max(1);
        Self {
            stripes: (0..stripe_count).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn stripe_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    /// Lock the stripe owning `key`. Held until the guard drops.
    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe_for(key)].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn single_stripe_serializes_distinct_keys() {
        let mutex = Arc::new(StripedMutex::new(1));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in 0..8u64 {
            let mutex = Arc::clone(&mutex);
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.lock(&key).await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn many_stripes_allow_concurrency() {
        let mutex = Arc::new(StripedMutex::new(64));

        // Find two keys on different stripes.
        let key_a = 0u64;
        let mut key_b = 1u64;
        while mutex.stripe_for(&key_a) == mutex.stripe_for(&key_b) {
            key_b += 1;
        }

        let guard_a = mutex.lock(&key_a).await;
        // Must not deadlock: key_b lives on another stripe.
        let guard_b = tokio::time::timeout(Duration::from_secs(1), mutex.lock(&key_b))
            .await
            .expect("distinct stripes should lock concurrently");
        drop(guard_a);
        drop(guard_b);
    }

    #[tokio::test]
    async fn same_key_excludes() {
        let mutex = Arc::new(StripedMutex::new(64));
        let guard = mutex.lock("record-7").await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), mutex.lock("record-7")).await;
        assert!(blocked.is_err());
        drop(guard);
    }
}
