//! In-memory [`Store`].
//!
//! Transactions are serialized: `begin` takes an exclusive lock on the shared state and
//! works on a private copy that replaces the shared state on commit. Because no two
//! transactions overlap, claim selects never see each other's rows.

use std::{cmp::Reverse, collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::{
    error::Error,
    lifecycle::Status,
    message::{ArchivedMessage, ChapterRow, Message, MessageRow},
    queue::QueueName,
    task::{ArchivedTask, Task, TaskRow},
};

use super::{Store, Transaction};

#[derive(Debug, Default, Clone)]
struct State {
    tasks: HashMap<Uuid, TaskRow>,
    archived_tasks: HashMap<Uuid, ArchivedTask>,
    messages: HashMap<Uuid, MessageRow>,
    history: HashMap<Uuid, Vec<ChapterRow>>,
    archived_messages: HashMap<Uuid, ArchivedMessage>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (not yet archived) tasks.
    pub async fn task_count(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    /// Number of live (not yet archived) messages.
    pub async fn message_count(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, Error> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();

        Ok(Box::new(MemoryTransaction { guard, working }))
    }

    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Discards its changes on drop unless committed.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<State>,
    working: State,
}

fn status_of(columns: &crate::lifecycle::LifecycleColumns) -> Option<Status> {
    columns.status.parse().ok()
}

impl MemoryTransaction {
    fn select_tasks<K: Ord>(
        &self,
        filter: impl Fn(&TaskRow) -> bool,
        key: impl Fn(&TaskRow) -> K,
        limit: usize,
    ) -> Result<Vec<Task>, Error> {
        self.working
            .tasks
            .values()
            .filter(|row| filter(row))
            .sorted_by_key(|row| (key(row), row.id))
            .take(limit)
            .cloned()
            .map(Task::from_row)
            .collect()
    }

    fn select_messages<K: Ord>(
        &self,
        filter: impl Fn(&MessageRow) -> bool,
        key: impl Fn(&MessageRow) -> K,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        self.working
            .messages
            .values()
            .filter(|row| filter(row))
            .sorted_by_key(|row| (key(row), row.id))
            .take(limit)
            .map(|row| self.restore_message(row))
            .collect()
    }

    fn restore_message(&self, row: &MessageRow) -> Result<Message, Error> {
        let history = self.working.history.get(&row.id).cloned().unwrap_or_default();
        Message::from_row(row.clone(), history)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get_task(&mut self, id: Uuid) -> Result<Task, Error> {
        let row = self
            .working
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id))?;

        Task::from_row(row)
    }

    async fn ready_tasks_with_lock(
        &mut self,
        kinds: &[QueueName],
        limit: usize,
    ) -> Result<Vec<Task>, Error> {
        self.select_tasks(
            |row| {
                status_of(&row.lifecycle) == Some(Status::Ready)
                    && kinds.iter().any(|kind| kind.as_str() == row.kind)
            },
            |row| (Reverse(row.priority), row.lifecycle.status_changed_at),
            limit,
        )
    }

    async fn processing_tasks_to_expire(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, Error> {
        self.select_tasks(
            |row| {
                status_of(&row.lifecycle) == Some(Status::Processing)
                    && row.lifecycle.timeout_at.is_some_and(|at| at <= now)
            },
            |row| row.lifecycle.timeout_at,
            limit,
        )
    }

    async fn delayed_tasks_to_resume(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, Error> {
        self.select_tasks(
            |row| {
                status_of(&row.lifecycle) == Some(Status::Delayed)
                    && row.lifecycle.delayed_until.is_some_and(|at| at <= now)
            },
            |row| row.lifecycle.delayed_until,
            limit,
        )
    }

    async fn finalized_tasks(&mut self, limit: usize) -> Result<Vec<Task>, Error> {
        self.select_tasks(
            |row| row.lifecycle.finalized_at.is_some(),
            |row| row.lifecycle.finalized_at,
            limit,
        )
    }

    async fn save_task(&mut self, task: &mut Task) -> Result<(), Error> {
        let mut row = task.to_row();

        if !task.is_new() {
            let stored = self.working.tasks.get(&row.id).map(|r| r.lifecycle.version);

            if stored != Some(row.lifecycle.version) {
                return Err(Error::StaleVersion {
                    entity: "task",
                    id: row.id,
                    version: row.lifecycle.version,
                });
            }
        }

        row.lifecycle.version += 1;
        self.working.tasks.insert(row.id, row);
        task.mark_saved();

        Ok(())
    }

    async fn delete_task(&mut self, task: &Task) -> Result<(), Error> {
        let version = task.lifecycle().version();

        match self.working.tasks.get(&task.id()) {
            Some(row) if row.lifecycle.version == version => {
                self.working.tasks.remove(&task.id());
                Ok(())
            }
            _ => Err(Error::StaleVersion {
                entity: "task",
                id: task.id(),
                version,
            }),
        }
    }

    async fn upsert_archived_task(&mut self, task: &ArchivedTask) -> Result<(), Error> {
        self.working.archived_tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_archived_task(&mut self, id: Uuid) -> Result<Option<ArchivedTask>, Error> {
        Ok(self.working.archived_tasks.get(&id).cloned())
    }

    async fn get_message(&mut self, id: Uuid) -> Result<Message, Error> {
        let row = self
            .working
            .messages
            .get(&id)
            .ok_or_else(|| Error::message_not_found(id))?;

        self.restore_message(row)
    }

    async fn available_messages_with_lock(
        &mut self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        self.select_messages(
            |row| status_of(&row.lifecycle) == Some(Status::Ready) && row.queue == queue.as_str(),
            |row| (Reverse(row.priority), row.lifecycle.status_changed_at),
            limit,
        )
    }

    async fn processing_messages_to_expire(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        self.select_messages(
            |row| {
                status_of(&row.lifecycle) == Some(Status::Processing)
                    && row.lifecycle.timeout_at.is_some_and(|at| at <= now)
            },
            |row| row.lifecycle.timeout_at,
            limit,
        )
    }

    async fn delayed_messages_to_resume(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, Error> {
        self.select_messages(
            |row| {
                status_of(&row.lifecycle) == Some(Status::Delayed)
                    && row.lifecycle.delayed_until.is_some_and(|at| at <= now)
            },
            |row| row.lifecycle.delayed_until,
            limit,
        )
    }

    async fn finalized_messages(&mut self, limit: usize) -> Result<Vec<Message>, Error> {
        self.select_messages(
            |row| row.lifecycle.finalized_at.is_some(),
            |row| row.lifecycle.finalized_at,
            limit,
        )
    }

    async fn save_message(&mut self, message: &mut Message) -> Result<(), Error> {
        let mut row = message.to_row();

        if !message.is_new() {
            let stored = self
                .working
                .messages
                .get(&row.id)
                .map(|r| r.lifecycle.version);

            if stored != Some(row.lifecycle.version) {
                return Err(Error::StaleVersion {
                    entity: "message",
                    id: row.id,
                    version: row.lifecycle.version,
                });
            }
        }

        let chapters = message
            .unsaved_chapters()
            .iter()
            .map(|chapter| ChapterRow::new(row.id, chapter));
        self.working.history.entry(row.id).or_default().extend(chapters);

        row.lifecycle.version += 1;
        self.working.messages.insert(row.id, row);
        message.mark_saved();

        Ok(())
    }

    async fn delete_message(&mut self, message: &Message) -> Result<(), Error> {
        let id = message.id();
        let version = message.lifecycle().version();

        match self.working.messages.get(&id) {
            Some(row) if row.lifecycle.version == version => {
                self.working.messages.remove(&id);
                self.working.history.remove(&id);
                Ok(())
            }
            _ => Err(Error::StaleVersion {
                entity: "message",
                id,
                version,
            }),
        }
    }

    async fn upsert_archived_message(&mut self, message: &ArchivedMessage) -> Result<(), Error> {
        self.working
            .archived_messages
            .insert(message.id, message.clone());
        Ok(())
    }

    async fn get_archived_message(&mut self, id: Uuid) -> Result<Option<ArchivedMessage>, Error> {
        Ok(self.working.archived_messages.get(&id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let Self { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::TimeDelta;

    use super::*;
    use crate::{clock::ManualClock, event::Event};

    async fn insert_ready(store: &MemoryStore, clock: &ManualClock, priority: u8) -> Uuid {
        let mut task = Task::new(
            clock,
            QueueName::parse("test").unwrap(),
            Bytes::new(),
            Some(priority),
            None,
        )
        .unwrap();
        task.confirm(clock, &mut Vec::<Event>::new()).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.save_task(&mut task).await.unwrap();
        tx.commit().await.unwrap();

        task.id()
    }

    #[tokio::test]
    async fn test_claim_order_is_priority_then_age() {
        let store = MemoryStore::new();
        let clock = ManualClock::starting_now();

        let low = insert_ready(&store, &clock, 10).await;
        clock.advance(TimeDelta::seconds(1));
        let high = insert_ready(&store, &clock, 200).await;
        clock.advance(TimeDelta::seconds(1));
        let mid = insert_ready(&store, &clock, 100).await;
        clock.advance(TimeDelta::seconds(1));
        let high_later = insert_ready(&store, &clock, 200).await;

        let mut tx = store.begin().await.unwrap();
        let kinds = [QueueName::parse("test").unwrap()];
        let ids: Vec<Uuid> = tx
            .ready_tasks_with_lock(&kinds, 10)
            .await
            .unwrap()
            .iter()
            .map(Task::id)
            .collect();

        assert_eq!(ids, vec![high, high_later, mid, low]);
    }

    #[tokio::test]
    async fn test_stale_save_is_rejected() {
        let store = MemoryStore::new();
        let clock = ManualClock::starting_now();
        let id = insert_ready(&store, &clock, 100).await;

        let mut tx = store.begin().await.unwrap();
        let mut first = tx.get_task(id).await.unwrap();
        let mut second = first.clone();

        first
            .start_processing(&clock, Duration::from_secs(60))
            .unwrap();
        tx.save_task(&mut first).await.unwrap();

        second
            .start_processing(&clock, Duration::from_secs(60))
            .unwrap();
        assert!(matches!(
            tx.save_task(&mut second).await,
            Err(Error::StaleVersion { entity: "task", .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_delete_is_rejected() {
        let store = MemoryStore::new();
        let clock = ManualClock::starting_now();

        let mut message = Message::new(
            &clock,
            QueueName::parse("inbox").unwrap(),
            Bytes::from_static(b"hi"),
            None,
            None,
            false,
        )
        .unwrap();
        message.confirm(&clock, &mut Vec::<Event>::new()).unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.save_message(&mut message).await.unwrap();
        tx.commit().await.unwrap();

        let stale = {
            let mut tx = store.begin().await.unwrap();
            tx.get_message(message.id()).await.unwrap()
        };

        let mut tx = store.begin().await.unwrap();
        let mut current = tx.get_message(message.id()).await.unwrap();
        current
            .start_processing(&clock, Duration::from_secs(30))
            .unwrap();
        tx.save_message(&mut current).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            tx.delete_message(&stale).await,
            Err(Error::StaleVersion { entity: "message", .. })
        ));
        assert_eq!(
            tx.get_message(message.id()).await.unwrap().status(),
            Status::Processing
        );

        tx.delete_message(&current).await.unwrap();
        assert!(matches!(
            tx.delete_message(&current).await,
            Err(Error::StaleVersion { .. })
        ));
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_discarded() {
        let store = MemoryStore::new();
        let clock = ManualClock::starting_now();
        let id = insert_ready(&store, &clock, 100).await;

        {
            let mut tx = store.begin().await.unwrap();
            let task = tx.get_task(id).await.unwrap();
            tx.delete_task(&task).await.unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        assert!(tx.get_task(id).await.is_ok());
        assert!(matches!(
            tx.get_task(Uuid::now_v7()).await,
            Err(Error::NotFound { .. })
        ));
    }
}
