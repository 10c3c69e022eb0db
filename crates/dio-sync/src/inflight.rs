use std::collections::HashSet;
use std::sync::Arc;

use dio_core::RecordKey;
use parking_lot::Mutex;

/// Keys with a research run in progress. At most one run per key at a time.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    keys: Mutex<HashSet<RecordKey>>,
}

impl InFlightRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Marks `key` in flight, or returns `None` if another run already holds it.
    /// The mark is released when the guard drops, whatever the run's outcome.
    pub fn try_acquire(self: &Arc<Self>, key: RecordKey) -> Option<InFlightGuard> {
        if !self.keys.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            key,
        })
    }

    pub fn is_in_flight(&self, key: &RecordKey) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    key: RecordKey,
}

impl InFlightGuard {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.keys.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let registry = InFlightRegistry::new();
        let key = RecordKey::new("e-1", "u-1");

        let guard = registry.try_acquire(key.clone()).unwrap();
        assert!(registry.is_in_flight(&key));
        assert!(registry.try_acquire(key.clone()).is_none());

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.try_acquire(key).is_some());
    }

    #[test]
    fn keys_are_per_entity_and_user() {
        let registry = InFlightRegistry::new();
        let _a = registry.try_acquire(RecordKey::new("e-1", "u-1")).unwrap();
        let _b = registry.try_acquire(RecordKey::new("e-1", "u-2")).unwrap();
        let _c = registry.try_acquire(RecordKey::new("e-2", "u-1")).unwrap();
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn mark_is_released_on_panic() {
        let registry = InFlightRegistry::new();
        let key = RecordKey::new("e-1", "u-1");
        let cloned = Arc::clone(&registry);
        let inner_key = key.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = cloned.try_acquire(inner_key).unwrap();
            panic!("run blew up");
        }));
        assert!(result.is_err());
        assert!(!registry.is_in_flight(&key));
    }
}
