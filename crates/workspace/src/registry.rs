//! Reference-counted handle registry.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

struct Entry<V> {
    handle: Arc<OnceCell<Arc<V>>>,
    refs: usize,
}

/// Open handles keyed by identity, shared between every caller that asks
/// for the same key.
///
/// The only way in is [`acquire()`](Self::acquire) and the only way out is
/// [`release()`](Self::release), so the count always matches the number of
/// outstanding users. Each key opens at most once: two callers racing for
/// the same key end up with one handle and a count of two. Opening does not
/// hold up callers of other keys.
pub struct Registry<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle for `key`, opening it with `open` if nobody holds it yet.
    ///
    /// A failed open gives back the reference taken for it; a caller that was
    /// waiting on the same key then tries to open it itself.
    pub async fn acquire<F, Fut, E>(&self, key: K, open: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<V>, E>>,
    {
        let cell = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry { handle: Arc::default(), refs: 0 });
            entry.refs += 1;
            entry.handle.clone()
        };
        match cell.get_or_try_init(open).await {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                self.forget_one(&key).await;
                Err(err)
            },
        }
    }

    async fn forget_one(&self, key: &K) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entries.remove(key);
            }
        }
    }

    /// Give back one reference to `key`.
    ///
    /// Returns the handle once the last reference is gone; the caller is
    /// then responsible for closing it. Releasing a key that is not held is
    /// a no-op.
    pub async fn release(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(key)?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return None;
        }
        entries.remove(key).and_then(|entry| entry.handle.get().cloned())
    }

    pub async fn ref_count(&self, key: &K) -> usize {
        self.entries.lock().await.get(key).map_or(0, |entry| entry.refs)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Forget every entry regardless of its count, returning the opened handles.
    pub async fn drain(&self) -> Vec<Arc<V>> {
        self.entries.lock().await.drain().filter_map(|(_, entry)| entry.handle.get().cloned()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_reuses_handle() {
        let registry: Registry<&str, String> = Registry::new();
        let opened = AtomicUsize::new(0);
        let counter = &opened;
        let open = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(Arc::new("db".to_string()))
        };
        let a = registry.acquire("fonts", open).await.unwrap();
        let b = registry.acquire("fonts", open).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&"fonts").await, 2);

        assert!(registry.release(&"fonts").await.is_none());
        let last = registry.release(&"fonts").await.unwrap();
        assert!(Arc::ptr_eq(&a, &last));
        assert!(registry.is_empty().await);
        assert!(registry.release(&"fonts").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_open_leaves_nothing() {
        let registry: Registry<&str, String> = Registry::new();
        let result = registry.acquire("x", || async { Err::<Arc<String>, _>("nope") }).await;
        assert_eq!(result.unwrap_err(), "nope");
        assert_eq!(registry.ref_count(&"x").await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_opens_once() {
        let registry: Arc<Registry<u32, u32>> = Arc::new(Registry::new());
        let opened = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let opened = opened.clone();
                tokio::spawn(async move {
                    registry
                        .acquire(7, || async move {
                            opened.fetch_add(1, Ordering::SeqCst);
                            tokio::task::yield_now().await;
                            Ok::<_, Infallible>(Arc::new(7))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.ref_count(&7).await, 16);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_open_does_not_block_other_keys() {
        let registry: Arc<Registry<&str, &str>> = Arc::new(Registry::new());
        let gate = Arc::new(tokio::sync::Notify::new());
        let slow = {
            let (registry, gate) = (registry.clone(), gate.clone());
            tokio::spawn(async move {
                registry
                    .acquire("remote", || async move {
                        gate.notified().await;
                        Ok::<_, Infallible>(Arc::new("remote"))
                    })
                    .await
                    .unwrap()
            })
        };
        while registry.ref_count(&"remote").await == 0 {
            tokio::task::yield_now().await;
        }

        let open = || async { Ok::<_, Infallible>(Arc::new("local")) };
        let local = tokio::time::timeout(Duration::from_secs(5), registry.acquire("local", open)).await;
        assert_eq!(*local.unwrap().unwrap(), "local");
        assert!(registry.release(&"local").await.is_some());

        gate.notify_one();
        assert_eq!(*slow.await.unwrap(), "remote");
        assert_eq!(registry.ref_count(&"remote").await, 1);
    }

    #[tokio::test]
    async fn test_failed_open_lets_the_next_caller_retry() {
        let registry: Registry<&str, u32> = Registry::new();
        assert!(registry.acquire("x", || async { Err::<Arc<u32>, _>("offline") }).await.is_err());
        let handle = registry.acquire("x", || async { Ok::<_, &str>(Arc::new(1)) }).await.unwrap();
        assert_eq!(*handle, 1);
        assert_eq!(registry.ref_count(&"x").await, 1);
    }
}
