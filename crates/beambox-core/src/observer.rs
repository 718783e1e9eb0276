//! Observer registries shared by every stateful component.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A list of subscribers notified by the owning component.
///
/// Notification always iterates over a snapshot, so observers may add or
/// remove observers from inside a callback.
pub(crate) struct Observers<T: ?Sized> {
    list: Mutex<Vec<Arc<T>>>,
}

impl<T: ?Sized> Default for Observers<T> {
    fn default() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> Observers<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, observer: Arc<T>) {
        let mut list = lock(&self.list);
        if !list.iter().any(|o| Arc::ptr_eq(o, &observer)) {
            list.push(observer);
        }
    }

    pub(crate) fn remove(&self, observer: &Arc<T>) {
        lock(&self.list).retain(|o| !Arc::ptr_eq(o, observer));
    }

    pub(crate) fn clear(&self) {
        lock(&self.list).clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        lock(&self.list).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.list).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Fixed(&'static str);

    impl Named for Fixed {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_add_remove() {
        let observers: Observers<dyn Named> = Observers::new();
        let a: Arc<dyn Named> = Arc::new(Fixed("a"));
        let b: Arc<dyn Named> = Arc::new(Fixed("b"));

        observers.add(Arc::clone(&a));
        observers.add(Arc::clone(&a));
        observers.add(Arc::clone(&b));
        assert_eq!(observers.len(), 2);

        observers.remove(&a);
        let names: Vec<_> = observers
            .snapshot()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        assert_eq!(names, vec!["b"]);

        observers.clear();
        assert_eq!(observers.len(), 0);
    }
}
