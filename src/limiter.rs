use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Two-stage admission limiter: `max_waiting` bounds how many callers may
/// be queued for a run slot before new arrivals are rejected outright,
/// `max_running` bounds how many run concurrently. Tokio's semaphore
/// grants permits FIFO by arrival order, giving the waiting queue
/// first-in-first-out fairness.
pub struct ConcurrentLimiter {
    running: Semaphore,
    waiting: AtomicUsize,
    max_waiting: usize,
}

/// Held while a request both waits for and then occupies a run slot.
/// Dropping it (including on cancellation) releases the waiting
/// reservation and, once acquired, the run permit.
pub struct Admission<'a> {
    limiter: &'a ConcurrentLimiter,
    permit: Option<SemaphorePermit<'a>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error("too many waiting requests")]
    QueueFull,
    #[error("limiter closed")]
    Closed,
}

impl ConcurrentLimiter {
    pub fn new(max_running: usize, max_waiting: usize) -> Self {
        Self {
            running: Semaphore::new(max_running.max(1)),
            waiting: AtomicUsize::new(0),
            max_waiting,
        }
    }

    /// Reserves a waiting slot, then blocks until a run slot is free.
    /// Returns `AdmitError::QueueFull` immediately if the waiting queue is
    /// already saturated.
    pub async fn admit(&self) -> Result<Admission<'_>, AdmitError> {
        loop {
            let current = self.waiting.load(Ordering::Acquire);
            if current >= self.max_waiting {
                return Err(AdmitError::QueueFull);
            }
            if self
                .waiting
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let permit = self.running.acquire().await.map_err(|_| AdmitError::Closed);
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        let permit = permit?;
        Ok(Admission {
            limiter: self,
            permit: Some(permit),
        })
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn available_permits(&self) -> usize {
        self.running.available_permits()
    }
}

impl<'a> Drop for Admission<'a> {
    fn drop(&mut self) {
        // Explicit for readability; SemaphorePermit::drop already releases.
        self.permit.take();
        let _ = self.limiter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn admits_up_to_max_running_concurrently() {
        let limiter = Arc::new(ConcurrentLimiter::new(2, 10));
        let a = limiter.admit().await.unwrap();
        let b = limiter.admit().await.unwrap();
        assert_eq!(limiter.available_permits(), 0);
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn rejects_when_waiting_queue_full() {
        // max_running=1, max_waiting=1: `first` holds the only run slot, a
        // background task occupies the single waiting slot behind it, so a
        // third admission has nowhere to queue and is rejected outright.
        let limiter = Arc::new(ConcurrentLimiter::new(1, 1));
        let first = limiter.admit().await.unwrap();

        let waiter_limiter = limiter.clone();
        let (admitted_tx, admitted_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = tokio::spawn(async move {
            let _adm = waiter_limiter.admit().await.unwrap();
            let _ = admitted_tx.send(());
            let _ = release_rx.await;
        });
        while limiter.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }

        let rejected = limiter.admit().await;
        assert!(matches!(rejected, Err(AdmitError::QueueFull)));

        drop(first);
        admitted_rx.await.unwrap();
        release_tx.send(()).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn fifo_order_is_respected() {
        let limiter = Arc::new(ConcurrentLimiter::new(1, 10));
        let first = limiter.admit().await.unwrap(); // occupies the only slot
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _adm = limiter.admit().await.unwrap();
                order.lock().await.push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        drop(first);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
