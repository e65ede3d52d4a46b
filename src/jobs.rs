//! Background job runner for index builds and refreshes.
//!
//! [`JobQueue::submit`] pushes a [`Job`] onto a bounded channel drained by
//! a fixed pool of workers and returns a [`JobHandle`] for the job's
//! outcome. A keyed lock map serializes jobs per collection id, so a
//! refresh can never race a build of the same collection; jobs for
//! different collections run in parallel up to the worker count.
//!
//! Dispatch is at-least-once within the process lifetime. There is no
//! persistence and no automatic retry: a job lost to a crash stays lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::{build_index, refresh_index, BuildContext};
use crate::config::JobsConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Full build of a freshly ingested collection.
    Build { collection_id: i64 },
    /// Merge one added document into a built collection.
    Refresh {
        collection_id: i64,
        document_id: i64,
    },
}

impl Job {
    pub fn collection_id(&self) -> i64 {
        match self {
            Job::Build { collection_id } | Job::Refresh { collection_id, .. } => *collection_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Build { .. } => "build",
            Job::Refresh { .. } => "refresh",
        }
    }
}

/// Completion handle for a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    job: Job,
    done: oneshot::Receiver<bool>,
}

impl JobHandle {
    pub fn job(&self) -> Job {
        self.job
    }

    /// Wait for the job to finish. `false` if it failed or was dropped
    /// by a shutdown.
    pub async fn wait(self) -> bool {
        self.done.await.unwrap_or(false)
    }
}

struct Envelope {
    job: Job,
    done: oneshot::Sender<bool>,
}

/// Per-collection mutexes. Entries are created on demand and removed once
/// no job holds or waits on them.
#[derive(Default)]
struct KeyedLocks {
    locks: StdMutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn map(&self) -> MutexGuard<'_, HashMap<i64, Arc<Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn get(&self, key: i64) -> Arc<Mutex<()>> {
        self.map().entry(key).or_default().clone()
    }

    /// Drop `key`'s entry if the map holds the only reference. Call after
    /// releasing your own clone.
    fn release(&self, key: i64) {
        let mut locks = self.map();
        if locks.get(&key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map().len()
    }
}

pub struct JobQueue {
    sender: StdMutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Start `config.workers` workers running jobs against `ctx`.
    pub fn start(ctx: BuildContext, config: &JobsConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let locks = Arc::new(KeyedLocks::default());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let locks = Arc::clone(&locks);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { rx.lock().await.recv().await };
                        let Some(envelope) = next else {
                            debug!(worker, "job channel closed, worker exiting");
                            break;
                        };
                        let ok = run_job(&ctx, &locks, envelope.job).await;
                        let _ = envelope.done.send(ok);
                    }
                })
            })
            .collect();

        info!(workers = config.workers, "job runner started");
        Self {
            sender: StdMutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue `job`. Waits for channel capacity when the queue is full.
    pub async fn submit(&self, job: Job) -> Result<JobHandle> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| anyhow!("job queue lock poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("job queue is shut down"))?;

        let (done_tx, done_rx) = oneshot::channel();
        sender
            .send(Envelope { job, done: done_tx })
            .await
            .map_err(|_| anyhow!("job queue is shut down"))?;
        debug!(kind = job.kind(), collection_id = job.collection_id(), "job submitted");
        Ok(JobHandle { job, done: done_rx })
    }

    /// Stop accepting jobs, let workers drain what is queued, and wait for
    /// them to exit.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("job worker ended abnormally: {}", e);
            }
        }
        info!("job runner stopped");
    }
}

async fn run_job(ctx: &BuildContext, locks: &KeyedLocks, job: Job) -> bool {
    let key = job.collection_id();
    let lock = locks.get(key);
    let ok = {
        let _guard = lock.lock().await;
        debug!(kind = job.kind(), collection_id = key, "job running");
        match job {
            Job::Build { collection_id } => build_index(ctx, collection_id).await,
            Job::Refresh {
                collection_id,
                document_id,
            } => refresh_index(ctx, collection_id, document_id).await,
        }
    };
    drop(lock);
    locks.release(key);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_report_their_collection() {
        assert_eq!(Job::Build { collection_id: 3 }.collection_id(), 3);
        let refresh = Job::Refresh {
            collection_id: 4,
            document_id: 9,
        };
        assert_eq!(refresh.collection_id(), 4);
        assert_eq!(refresh.kind(), "refresh");
    }

    #[tokio::test]
    async fn keyed_locks_are_shared_per_key() {
        let locks = KeyedLocks::default();
        let a = locks.get(1);
        let b = locks.get(1);
        let c = locks.get(2);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }

    #[tokio::test]
    async fn released_locks_leave_the_map() {
        let locks = KeyedLocks::default();
        let a = locks.get(1);
        let waiting = locks.get(1);

        drop(a);
        locks.release(1);
        assert_eq!(locks.len(), 1, "a waiter still holds the lock");

        drop(waiting);
        locks.release(1);
        assert_eq!(locks.len(), 0);

        locks.release(2);
        assert_eq!(locks.len(), 0);
    }
}
