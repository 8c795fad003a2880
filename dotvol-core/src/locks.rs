//! Per-dot exclusive sections
//!
//! Operations on the same dot (commit, checkout, reset, delete, receiving a
//! transfer) are serialized by an async mutex keyed on the dot. Distinct
//! dots never contend. Creation, which has no dot id yet, is keyed on the
//! `namespace/name` being created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard for an exclusive section; released on drop
pub type DotGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct DotLocks {
    sections: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the exclusive section for `key`
    pub async fn lock(&self, key: &str) -> DotGuard {
        let section = {
            let mut sections = match self.sections.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Drop sections nobody holds or waits on
            sections.retain(|k, v| k == key || Arc::strong_count(v) > 1);
            sections
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        section.lock_owned().await
    }

    /// Number of tracked sections
    pub fn tracked(&self) -> usize {
        match self.sections.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_serializes() {
        let locks = Arc::new(DotLocks::new());
        let guard = locks.lock("dot-a").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.lock("dot-a").await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let locks = DotLocks::new();
        let _a = locks.lock("dot-a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock("dot-b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_sections_are_pruned() {
        let locks = DotLocks::new();
        for i in 0..10 {
            let _g = locks.lock(&format!("dot-{}", i)).await;
        }
        let _g = locks.lock("last").await;
        assert_eq!(locks.tracked(), 1);
    }
}
