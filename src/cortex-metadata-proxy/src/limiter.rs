//! Connection admission.
//!
//! A permit is taken before each `accept`, so once the limit is reached
//! further connections wait in the listen backlog instead of being
//! refused. The permit lives as long as the connection task.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{MetadataProxyError, Result};

/// Bounds the number of connections served at once.
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// Proof of admission. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionLimiter {
    /// Create a limiter admitting at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn admit(&self) -> Result<AdmissionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| MetadataProxyError::Internal("admission limiter closed".to_string()))?;
        Ok(AdmissionPermit { _permit: permit })
    }

    /// Take a slot if one is free right now.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Wait until every admitted connection has finished.
    ///
    /// Holds all slots once reached, so nothing is admitted afterwards.
    pub async fn drain(&self) -> Result<()> {
        let permits = u32::try_from(self.capacity)
            .map_err(|_| MetadataProxyError::Internal("admission limit too large".to_string()))?;
        let all = self
            .semaphore
            .acquire_many(permits)
            .await
            .map_err(|_| MetadataProxyError::Internal("admission limiter closed".to_string()))?;
        all.forget();
        Ok(())
    }

    /// Maximum concurrent connections.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Connections currently admitted.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_limit_blocks_extra_admission() {
        let limiter = AdmissionLimiter::new(100);
        let mut held = Vec::new();
        for _ in 0..100 {
            held.push(limiter.admit().await.unwrap());
        }
        assert_eq!(limiter.in_flight(), 100);
        assert!(limiter.try_admit().is_none());

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        held.pop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be admitted once a slot frees")
            .unwrap()
            .unwrap();
        assert_eq!(limiter.in_flight(), 99);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let limiter = AdmissionLimiter::new(1);
        let permit = limiter.admit().await.unwrap();
        assert_eq!(limiter.available(), 0);
        drop(permit);
        assert_eq!(limiter.available(), 1);
        assert_eq!(limiter.capacity(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let limiter = AdmissionLimiter::new(2);
        let permit = limiter.admit().await.unwrap();

        let drain = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(limiter.try_admit().is_none());
    }
}
