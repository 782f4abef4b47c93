//! Bounded worker pool for background work.
//!
//! Every task is spawned immediately but runs only while holding one of
//! `size` permits, so excess work queues on the semaphore instead of being
//! dropped or running unbounded.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a worker.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Queue fire-and-forget work.
    pub fn submit<F>(&self, work: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.permits.is_closed() {
            return Err(PoolClosed);
        }
        let permits = self.permits.clone();
        let mut tasks = self.tasks.lock();
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
        Ok(())
    }

    /// Queue work and wait for its result.
    pub async fn run<F, T>(&self, work: F) -> Result<T, PoolClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(async move {
            let _ = tx.send(work.await);
        })?;
        rx.await.map_err(|_| PoolClosed)
    }

    /// Refuse new work and abort everything queued or running.
    pub fn shutdown(&self) {
        self.permits.close();
        self.tasks.lock().abort_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
