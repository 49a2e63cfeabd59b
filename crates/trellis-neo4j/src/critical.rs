//! Serializes schema-changing and whole-graph operations of one store

use tokio::sync::{Semaphore, SemaphorePermit};
use trellis_core::{Result, StoreError};

/// Single-permit gate; the permit is returned when the guard drops
#[derive(Debug)]
pub struct CriticalSection {
    permits: Semaphore,
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

impl CriticalSection {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(1),
        }
    }

    /// Wait for the permit. Dropping the returned future abandons the wait.
    pub async fn enter(&self, operation: &str) -> Result<SemaphorePermit<'_>> {
        tracing::debug!("Waiting for critical section: {}", operation);
        self.permits
            .acquire()
            .await
            .map_err(|_| StoreError::Precondition(format!("{operation}: store is closed")))
    }

    pub fn is_free(&self) -> bool {
        self.permits.available_permits() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serializes_and_releases() {
        let section = CriticalSection::new();
        {
            let _guard = section.enter("first").await.unwrap();
            assert!(!section.is_free());
            let blocked =
                tokio::time::timeout(Duration::from_millis(20), section.enter("second")).await;
            assert!(blocked.is_err());
        }
        assert!(section.is_free());
    }

    #[tokio::test]
    async fn test_cancelled_wait_does_not_leak() {
        let section = CriticalSection::new();
        let guard = section.enter("holder").await.unwrap();
        let waiter = tokio::time::timeout(Duration::from_millis(10), section.enter("waiter"));
        assert!(waiter.await.is_err());
        drop(guard);
        assert!(section.is_free());
        let _again = section.enter("again").await.unwrap();
    }
}
