use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::Error,
    event::{Channel, Dispatcher},
    lifecycle::add,
    message::{ArchivedMessage, Message, MessageView},
    notifier::ReadinessNotifier,
    policy::{self, NackAction, Origin},
    poller::Poller,
    queue::QueueName,
};

use super::Service;

#[derive(Debug, Clone)]
pub struct CreateMessage {
    pub queue: String,
    pub payload: Bytes,
    pub priority: Option<u8>,
    pub auto_confirm: bool,
    pub start_at: Option<DateTime<Utc>>,
    /// Park in `Prepared` on confirm until released.
    pub hold: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AckItem {
    pub id: Uuid,
    /// Held messages made available by this ack.
    #[serde(default)]
    pub release: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NackItem {
    pub id: Uuid,
    #[serde(default)]
    pub redeliver: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedirectItem {
    pub id: Uuid,
    pub destination: String,
}

impl Service {
    #[tracing::instrument(skip(self, request), fields(queue = %request.queue))]
    pub async fn create_message(&self, request: CreateMessage) -> Result<Uuid, Error> {
        let queue = self.queue_name(&request.queue)?;

        let mut message = Message::new(
            self.clock(),
            queue,
            request.payload,
            request.priority,
            request.start_at,
            request.hold,
        )?;

        let mut notifier = ReadinessNotifier::new();
        if request.auto_confirm {
            message.confirm(self.clock(), &mut notifier)?;
        }

        let mut tx = self.begin().await?;
        tx.save_message(&mut message).await?;
        self.commit(tx, notifier).await?;

        Ok(message.id())
    }

    #[tracing::instrument(skip(self))]
    pub async fn confirm_message(&self, id: Uuid) -> Result<(), Error> {
        let mut tx = self.begin().await?;
        let mut message = tx.get_message(id).await?;

        let mut notifier = ReadinessNotifier::new();
        message.confirm(self.clock(), &mut notifier)?;

        tx.save_message(&mut message).await?;
        self.commit(tx, notifier).await
    }

    async fn claim_messages(&self, queue: &QueueName, limit: usize) -> Result<Vec<Message>, Error> {
        let mut tx = self.begin().await?;
        let mut messages = tx.available_messages_with_lock(queue, limit).await?;

        let timeout = self.queues().policy_for(queue).processing_timeout;

        for message in &mut messages {
            message.start_processing(self.clock(), timeout)?;
            tx.save_message(message).await?;
        }

        tx.commit().await?;

        Ok(messages)
    }

    /// Claims available messages from `queue`, waiting up to `poll` if there are none.
    #[tracing::instrument(skip(self))]
    pub async fn consume(
        &self,
        queue: &str,
        limit: usize,
        poll: Duration,
    ) -> Result<Vec<Message>, Error> {
        self.check_limit(limit)?;
        self.check_poll(poll)?;
        let queue = self.queue_name(queue)?;

        let claimed = self.claim_messages(&queue, limit).await?;
        if !claimed.is_empty() || poll.is_zero() {
            return Ok(claimed);
        }

        let poller = Poller::new([queue.to_string()], poll);
        let _subscription = self
            .bus()
            .subscribe(Channel::MessageReady, poller.handler());

        loop {
            let claimed = self.claim_messages(&queue, limit).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            if poller.is_timed_out() || self.shutdown_token().is_cancelled() {
                return Ok(Vec::new());
            }

            poller.wait_for_next_attempt(self.shutdown_token()).await;
        }
    }

    /// Marks messages delivered, archives them, and releases their dependents, all in
    /// one transaction.
    #[tracing::instrument(skip_all, fields(count = items.len()))]
    pub async fn ack(&self, items: Vec<AckItem>) -> Result<(), Error> {
        self.check_batch(&items)?;

        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();

        for item in items {
            let mut message = tx.get_message(item.id).await?;
            message.complete(self.clock())?;

            tx.upsert_archived_message(&ArchivedMessage::try_from(&message)?)
                .await?;
            tx.delete_message(&message).await?;

            for dependent in item.release {
                let mut dependent = tx.get_message(dependent).await?;
                dependent.release(self.clock(), &mut notifier)?;
                tx.save_message(&mut dependent).await?;
            }
        }

        self.commit(tx, notifier).await
    }

    /// Hands processing messages back according to their queue's backoff.
    #[tracing::instrument(skip_all, fields(count = items.len()))]
    pub async fn nack(&self, items: Vec<NackItem>) -> Result<(), Error> {
        self.check_batch(&items)?;

        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();

        for item in items {
            let mut message = tx.get_message(item.id).await?;
            self.retry_message(&mut message, Origin::Client, item.redeliver, &mut notifier)?;
            tx.save_message(&mut message).await?;
        }

        self.commit(tx, notifier).await
    }

    /// Decides and applies the outcome for a processing message that was not acked.
    pub(crate) fn retry_message(
        &self,
        message: &mut Message,
        origin: Origin,
        redeliver: bool,
        dispatcher: &mut dyn Dispatcher,
    ) -> Result<(), Error> {
        let config = self.queues().policy_for(message.queue());
        let retries = message.lifecycle().retries();

        match policy::select(origin).decide(retries, config, redeliver) {
            NackAction::Delay(delay) => {
                let until = add(self.clock().now(), delay);
                message.delay(self.clock(), until)
            }
            NackAction::Drop => message.fail(self.clock()),
            NackAction::DeadLetter if message.queue().is_dead_letter() => {
                message.fail(self.clock())
            }
            NackAction::DeadLetter => {
                tracing::info!(id = %message.id(), queue = %message.queue(), "Dead-lettering message");
                message.dead_letter(self.clock(), dispatcher)
            }
        }
    }

    #[tracing::instrument(skip_all, fields(count = items.len()))]
    pub async fn redirect(&self, items: Vec<RedirectItem>) -> Result<(), Error> {
        self.check_batch(&items)?;

        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();

        for item in items {
            let destination = self.queue_name(&item.destination)?;
            let mut message = tx.get_message(item.id).await?;
            message.redirect(self.clock(), &mut notifier, destination)?;
            tx.save_message(&mut message).await?;
        }

        self.commit(tx, notifier).await
    }

    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    pub async fn release(&self, ids: Vec<Uuid>) -> Result<(), Error> {
        self.check_batch(&ids)?;

        let mut tx = self.begin().await?;
        let mut notifier = ReadinessNotifier::new();

        for id in ids {
            let mut message = tx.get_message(id).await?;
            message.release(self.clock(), &mut notifier)?;
            tx.save_message(&mut message).await?;
        }

        self.commit(tx, notifier).await
    }

    /// Looks messages up in live storage, then in the archive. Unknown ids are left out.
    #[tracing::instrument(skip_all, fields(count = ids.len()))]
    pub async fn check_messages(&self, ids: &[Uuid]) -> Result<Vec<MessageView>, Error> {
        self.check_batch(ids)?;

        let mut tx = self.begin().await?;
        let mut views = Vec::with_capacity(ids.len());

        for &id in ids {
            match tx.get_message(id).await {
                Ok(message) => views.push(MessageView::from(&message)),
                Err(Error::NotFound { .. }) => {
                    if let Some(archived) = tx.get_archived_message(id).await? {
                        views.push(MessageView::from(&archived));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(views)
    }
}
