//! Atomicity lock
//!
//! Makes a handler sequence that contains a suspension point behave as one
//! atomic step with respect to other handlers. Waiters are granted the lock in
//! FIFO order. Releasing the guard wakes condition waiters, since "is the lock
//! held" is part of the checkpoint predicate.

use crate::entity::context::ChangeNotifier;
use tokio::sync::{Mutex, MutexGuard};

/// Single-holder lock guarding an entity's shared table across awaits
#[derive(Debug)]
pub struct AtomicityLock {
    mutex: Mutex<()>,
    notifier: ChangeNotifier,
}

impl AtomicityLock {
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            mutex: Mutex::new(()),
            notifier,
        }
    }

    /// Wait for the lock; it is released when the guard drops
    pub async fn acquire(&self) -> AtomicityGuard<'_> {
        let guard = self.mutex.lock().await;
        AtomicityGuard {
            guard: Some(guard),
            notifier: &self.notifier,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.mutex.try_lock().is_err()
    }
}

/// Scoped ownership of an [`AtomicityLock`]
///
/// Released on every exit path, including early returns and unwinding.
#[derive(Debug)]
pub struct AtomicityGuard<'a> {
    guard: Option<MutexGuard<'a, ()>>,
    notifier: &'a ChangeNotifier,
}

impl Drop for AtomicityGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so woken waiters observe the lock as free
        self.guard.take();
        self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let lock = AtomicityLock::new(ChangeNotifier::new());
        assert!(!lock.is_locked());

        let guard = lock.acquire().await;
        assert!(lock.is_locked());

        drop(guard);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_release_notifies_waiters() {
        let notifier = ChangeNotifier::new();
        let lock = AtomicityLock::new(notifier.clone());
        let mut changes = notifier.subscribe();

        {
            let _guard = lock.acquire().await;
        }

        assert!(changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_waiters_are_granted_in_order() {
        let lock = Arc::new(AtomicityLock::new(ChangeNotifier::new()));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let first = lock.acquire().await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let lock = lock.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                order.lock().unwrap().push(i);
            }));
            // Let each task enqueue before spawning the next
            tokio::task::yield_now().await;
        }

        drop(first);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
