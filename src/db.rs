//! Repository boundary.
//!
//! All reads and writes happen inside a [`Transaction`] obtained from a [`Store`].
//! Dropping a transaction without calling [`Transaction::commit`] rolls it back.
//!
//! The claim selects (`ready_tasks_with_lock`, `available_messages_with_lock`) return
//! rows ordered by priority (highest first), then by the time they entered their
//! current status (oldest first), and lock them so that a concurrent claimant skips
//! them instead of waiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    error::Error,
    message::{ArchivedMessage, Message},
    queue::QueueName,
    task::{ArchivedTask, Task},
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn Transaction>, Error>;

    /// Checks that the backing store answers.
    async fn ping(&self) -> Result<(), Error>;
}

#[async_trait]
pub trait Transaction: Send {
    /// Fails with [`Error::NotFound`] if the task is not live.
    async fn get_task(&mut self, id: Uuid) -> Result<Task, Error>;

    async fn ready_tasks_with_lock(
        &mut self,
        kinds: &[QueueName],
        limit: usize,
    ) -> Result<Vec<Task>, Error>;

    /// Processing tasks whose deadline passed, oldest deadline first.
    async fn processing_tasks_to_expire(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, Error>;

    /// Delayed tasks that are due, oldest first.
    async fn delayed_tasks_to_resume(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, Error>;

    /// Completed or failed tasks, oldest finalization first.
    async fn finalized_tasks(&mut self, limit: usize) -> Result<Vec<Task>, Error>;

    /// Inserts a new task, or updates a persisted one if nobody changed it since it was read.
    async fn save_task(&mut self, task: &mut Task) -> Result<(), Error>;

    /// Removes a live task, failing with `StaleVersion` if it changed since it was read.
    async fn delete_task(&mut self, task: &Task) -> Result<(), Error>;

    async fn upsert_archived_task(&mut self, task: &ArchivedTask) -> Result<(), Error>;

    async fn get_archived_task(&mut self, id: Uuid) -> Result<Option<ArchivedTask>, Error>;

    async fn get_message(&mut self, id: Uuid) -> Result<Message, Error>;

    async fn available_messages_with_lock(
        &mut self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<Message>, Error>;

    async fn processing_messages_to_expire(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, Error>;

    async fn delayed_messages_to_resume(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, Error>;

    async fn finalized_messages(&mut self, limit: usize) -> Result<Vec<Message>, Error>;

    async fn save_message(&mut self, message: &mut Message) -> Result<(), Error>;

    /// Removes a live message, failing with `StaleVersion` if it changed since it was read.
    async fn delete_message(&mut self, message: &Message) -> Result<(), Error>;

    async fn upsert_archived_message(&mut self, message: &ArchivedMessage) -> Result<(), Error>;

    async fn get_archived_message(&mut self, id: Uuid) -> Result<Option<ArchivedMessage>, Error>;

    async fn commit(self: Box<Self>) -> Result<(), Error>;
}
