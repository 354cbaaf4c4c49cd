//! Reconciliation sweeps.
//!
//! Each sweep works in batches of at most `batch_size` rows, one transaction per batch,
//! and stops once a batch comes back short or `limit` rows were handled. A failing batch
//! aborts the sweep; the error carries how many rows earlier batches already committed.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::Error,
    message::ArchivedMessage,
    notifier::ReadinessNotifier,
    policy::Origin,
    task::ArchivedTask,
};

use super::Service;

pub const DEFAULT_BATCH_SIZE: usize = 100;

pub const DEFAULT_SWEEP_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sweep {
    pub batch_size: usize,
    /// Total number of rows one run may handle.
    pub limit: usize,
}

impl Default for Sweep {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            limit: DEFAULT_SWEEP_LIMIT,
        }
    }
}

impl Service {
    async fn sweep<F, Fut>(
        &self,
        job: &'static str,
        sweep: Sweep,
        already_completed: usize,
        mut batch: F,
    ) -> Result<usize, Error>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<usize, Error>>,
    {
        self.check_limit(sweep.batch_size)?;

        let mut completed = 0;

        while completed < sweep.limit {
            let size = sweep.batch_size.min(sweep.limit - completed);

            let processed = batch(size).await.map_err(|source| {
                tracing::error!(job, completed, error = %source, "Sweep aborted");
                Error::SweepAborted {
                    completed: already_completed + completed,
                    source: Box::new(source),
                }
            })?;

            completed += processed;

            if processed < size {
                break;
            }
        }

        tracing::info!(job, completed, "Sweep finished");

        Ok(completed)
    }

    /// Applies the system backoff to processing tasks and messages whose deadline passed.
    pub async fn expire_processing(&self, sweep: Sweep) -> Result<usize, Error> {
        let tasks = self
            .sweep("expire_processing_tasks", sweep, 0, |n| self.expire_tasks(n))
            .await?;
        let messages = self
            .sweep("expire_processing_messages", sweep, tasks, |n| {
                self.expire_messages(n)
            })
            .await?;

        Ok(tasks + messages)
    }

    async fn expire_tasks(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let now = self.clock().now();
        let mut tasks = tx.processing_tasks_to_expire(now, limit).await?;

        for task in &mut tasks {
            tracing::debug!(id = %task.id(), kind = %task.kind(), "Processing timed out");
            self.retry_task(task, false)?;
            tx.save_task(task).await?;
        }

        tx.commit().await?;

        Ok(tasks.len())
    }

    async fn expire_messages(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();
        let now = self.clock().now();
        let mut messages = tx.processing_messages_to_expire(now, limit).await?;

        for message in &mut messages {
            tracing::debug!(id = %message.id(), queue = %message.queue(), "Processing timed out");
            self.retry_message(message, Origin::System, false, &mut notifier)?;
            tx.save_message(message).await?;
        }

        self.commit(tx, notifier).await?;

        Ok(messages.len())
    }

    /// Makes delayed tasks and messages whose time has come ready again.
    pub async fn resume_delayed(&self, sweep: Sweep) -> Result<usize, Error> {
        let tasks = self
            .sweep("resume_delayed_tasks", sweep, 0, |n| self.resume_tasks(n))
            .await?;
        let messages = self
            .sweep("resume_delayed_messages", sweep, tasks, |n| {
                self.resume_messages(n)
            })
            .await?;

        Ok(tasks + messages)
    }

    async fn resume_tasks(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();
        let mut tasks = tx
            .delayed_tasks_to_resume(self.clock().now(), limit)
            .await?;

        for task in &mut tasks {
            task.resume(self.clock(), &mut notifier)?;
            tx.save_task(task).await?;
        }

        self.commit(tx, notifier).await?;

        Ok(tasks.len())
    }

    async fn resume_messages(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();
        let mut messages = tx
            .delayed_messages_to_resume(self.clock().now(), limit)
            .await?;

        for message in &mut messages {
            message.resume(self.clock(), &mut notifier)?;
            tx.save_message(message).await?;
        }

        self.commit(tx, notifier).await?;

        Ok(messages.len())
    }

    /// Moves finalized tasks to the archive.
    pub async fn archive_tasks(&self, sweep: Sweep) -> Result<usize, Error> {
        self.sweep("archive_tasks", sweep, 0, |n| self.archive_task_batch(n))
            .await
    }

    async fn archive_task_batch(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let tasks = tx.finalized_tasks(limit).await?;

        for task in &tasks {
            // The archived copy is written before the live row goes away.
            tx.upsert_archived_task(&ArchivedTask::try_from(task)?)
                .await?;
            tx.delete_task(task).await?;
        }

        tx.commit().await?;

        Ok(tasks.len())
    }

    /// Moves delivered and dropped messages to the archive.
    pub async fn archive_messages(&self, sweep: Sweep) -> Result<usize, Error> {
        self.sweep("archive_messages", sweep, 0, |n| {
            self.archive_message_batch(n)
        })
        .await
    }

    async fn archive_message_batch(&self, limit: usize) -> Result<usize, Error> {
        let mut tx = self.begin().await?;
        let messages = tx.finalized_messages(limit).await?;

        for message in &messages {
            tx.upsert_archived_message(&ArchivedMessage::try_from(message)?)
                .await?;
            tx.delete_message(message).await?;
        }

        tx.commit().await?;

        Ok(messages.len())
    }

    /// Runs the expiry and resume sweeps every `interval` until `cancel` fires.
    ///
    /// Failures are logged and the next tick tries again.
    pub fn spawn_sweeper(
        self: std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let sweep = Sweep {
                batch_size: DEFAULT_BATCH_SIZE.min(self.batch_size_limit()),
                ..Sweep::default()
            };
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(error) = self.expire_processing(sweep).await {
                    tracing::error!(%error, "Expiry sweep failed");
                }

                if let Err(error) = self.resume_delayed(sweep).await {
                    tracing::error!(%error, "Resume sweep failed");
                }
            }

            tracing::debug!("Sweeper stopped");
        })
    }
}
