use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::Error,
    event::Channel,
    lifecycle::add,
    notifier::ReadinessNotifier,
    policy::{self, NackAction, Origin},
    poller::Poller,
    queue::QueueName,
    task::{Task, TaskView},
};

use super::Service;

#[derive(Debug, Clone)]
pub struct CreateTask {
    pub kind: String,
    pub payload: Bytes,
    pub priority: Option<u8>,
    pub auto_confirm: bool,
    pub start_at: Option<DateTime<Utc>>,
}

/// Failure reported by a worker through `work/finish`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkError {
    pub code: Option<String>,
    pub message: Option<String>,
    pub additional_info: Option<serde_json::Value>,
}

impl Service {
    #[tracing::instrument(skip(self, request), fields(kind = %request.kind))]
    pub async fn create_task(&self, request: CreateTask) -> Result<Uuid, Error> {
        let kind = self.queue_name(&request.kind)?;

        let mut task = Task::new(
            self.clock(),
            kind,
            request.payload,
            request.priority,
            request.start_at,
        )?;

        let mut notifier = ReadinessNotifier::new();
        if request.auto_confirm {
            task.confirm(self.clock(), &mut notifier)?;
        }

        let mut tx = self.begin().await?;
        tx.save_task(&mut task).await?;
        self.commit(tx, notifier).await?;

        tracing::debug!(id = %task.id(), status = %task.status(), "Created task");

        Ok(task.id())
    }

    #[tracing::instrument(skip(self))]
    pub async fn confirm_task(&self, id: Uuid) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        let mut task = tx.get_task(id).await?;

        let mut notifier = ReadinessNotifier::new();
        task.confirm(self.clock(), &mut notifier)?;

        tx.save_task(&mut task).await?;
        self.commit(tx, notifier).await
    }

    /// Claims up to `limit` ready tasks of the given kinds in one transaction.
    async fn claim_tasks(&self, kinds: &[QueueName], limit: usize) -> Result<Vec<Task>, Error> {
        let mut tx = self.begin().await?;
        let mut tasks = tx.ready_tasks_with_lock(kinds, limit).await?;

        for task in &mut tasks {
            let timeout = self.queues().policy_for(task.kind()).processing_timeout;
            task.start_processing(self.clock(), timeout)?;
            tx.save_task(task).await?;
        }

        tx.commit().await?;

        Ok(tasks)
    }

    /// Claims ready tasks, waiting up to `poll` for one to appear if none is ready now.
    ///
    /// No transaction is held while waiting.
    #[tracing::instrument(skip(self))]
    pub async fn take_work(
        &self,
        kinds: &[String],
        limit: usize,
        poll: Duration,
    ) -> Result<Vec<Task>, Error> {
        self.check_limit(limit)?;
        self.check_poll(poll)?;

        if kinds.is_empty() {
            return Err(Error::missing_parameter("kind"));
        }

        let kinds = kinds
            .iter()
            .map(|kind| self.queue_name(kind))
            .collect::<Result<Vec<_>, _>>()?;

        let claimed = self.claim_tasks(&kinds, limit).await?;
        if !claimed.is_empty() || poll.is_zero() {
            return Ok(claimed);
        }

        let poller = Poller::new(kinds.iter().map(QueueName::to_string), poll);
        let _subscription = self.bus().subscribe(Channel::TaskReady, poller.handler());

        loop {
            let claimed = self.claim_tasks(&kinds, limit).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            if poller.is_timed_out() || self.shutdown_token().is_cancelled() {
                return Ok(Vec::new());
            }

            poller.wait_for_next_attempt(self.shutdown_token()).await;
        }
    }

    /// Completes a processing task, or schedules a retry when the worker reports an error.
    #[tracing::instrument(skip(self, report, error))]
    pub async fn finish_work(
        &self,
        id: Uuid,
        report: Option<Bytes>,
        error: Option<WorkError>,
    ) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        let mut task = tx.get_task(id).await?;

        match error {
            None => task.complete(self.clock(), report)?,
            Some(error) => {
                tracing::warn!(
                    %id,
                    code = error.code.as_deref(),
                    message = error.message.as_deref(),
                    additional_info = ?error.additional_info,
                    "Worker reported a failure"
                );

                self.retry_task(&mut task, true)?;
            }
        }

        tx.save_task(&mut task).await?;
        tx.commit().await
    }

    /// Applies the system backoff to a processing task.
    pub(crate) fn retry_task(&self, task: &mut Task, redeliver: bool) -> Result<(), Error> {
        let config = self.queues().policy_for(task.kind());
        let retries = task.lifecycle().retries();

        match policy::select(Origin::System).decide(retries, config, redeliver) {
            NackAction::Delay(delay) => {
                let until = add(self.clock().now(), delay);
                task.delay(self.clock(), until)
            }
            // Tasks have no dead-letter queue.
            NackAction::Drop | NackAction::DeadLetter => task.fail(self.clock()),
        }
    }

    /// Looks a task up in live storage, then in the archive.
    #[tracing::instrument(skip(self))]
    pub async fn check_task(&self, id: Uuid) -> Result<TaskView, Error> {
        let mut tx = self.begin().await?;

        match tx.get_task(id).await {
            Ok(task) => Ok(TaskView::from(&task)),
            Err(Error::NotFound { .. }) => tx
                .get_archived_task(id)
                .await?
                .map(|task| TaskView::from(&task))
                .ok_or_else(|| Error::task_not_found(id)),
            Err(e) => Err(e),
        }
    }
}
