// Copyright (c) The Chain Core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounds how many futures may run concurrently on the current `tokio`
//! runtime. `chain-rpc` uses this to cap concurrent peer connections so
//! a burst of submissions cannot starve the generator loop of CPU.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
}

impl BoundedExecutor {
    pub fn new(capacity: usize) -> Self {
        BoundedExecutor {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Acquires a permit and spawns `future` on the current runtime,
    /// blocking the caller (asynchronously) until a slot is free. The
    /// permit is held for the lifetime of the spawned task so capacity is
    /// only released once the task actually finishes.
    pub async fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        tokio::spawn(with_permit(permit, future))
    }

    /// Non-blocking variant: returns `None` immediately if the executor
    /// is already at capacity instead of waiting for a slot.
    pub fn try_spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(tokio::spawn(with_permit(permit, future)))
    }
}

async fn with_permit<F: std::future::Future>(_permit: OwnedSemaphorePermit, future: F) -> F::Output {
    future.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_capacity() {
        let executor = BoundedExecutor::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(
                executor
                    .spawn(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await,
            );
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn try_spawn_rejects_when_full() {
        let executor = BoundedExecutor::new(1);
        let _first = executor
            .spawn(async { tokio::time::sleep(Duration::from_millis(50)).await })
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(executor.try_spawn(async {}).is_none());
    }
}
