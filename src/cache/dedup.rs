//! In-flight request deduplication: collapses concurrent work for identical
//! keys into a single awaited result (a "single-flight" pattern).

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

type PendingFuture<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

/// Collapses concurrent `getOrCreate(key, factory)` calls for the same key into
/// one execution of `factory`. The pending entry is removed once the factory
/// settles, so a later call with the same key is free to retry.
pub struct Dedup<T, E> {
    pending: Mutex<HashMap<String, PendingFuture<T, E>>>,
}

impl<T, E> Default for Dedup<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Dedup<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Dedup {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `factory` at most once per in-flight `key`. Every concurrent caller
    /// observes the same `Ok`/`Err` outcome.
    pub async fn get_or_create<F, Fut>(&self, key: &str, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let existing = {
            let pending = self.pending.lock().unwrap();
            pending.get(key).cloned()
        };

        if let Some(fut) = existing {
            return fut.await;
        }

        let shared: PendingFuture<T, E> = factory().boxed().shared();
        {
            let mut pending = self.pending.lock().unwrap();
            // Another caller may have raced us between the check above and
            // this insert; prefer whichever already landed to keep the
            // "exactly once" guarantee.
            let shared = pending.entry(key.to_string()).or_insert(shared).clone();
            drop(pending);
            let result = shared.await;
            self.pending.lock().unwrap().remove(key);
            return result;
        }
    }
}
