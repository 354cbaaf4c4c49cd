use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool, Postgres,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    error::Error,
    lifecycle::Status,
    message::{ArchivedMessage, ArchivedMessageRow, ChapterRow, Message, MessageRow},
    queue::QueueName,
    task::{ArchivedTask, ArchivedTaskRow, Task, TaskRow},
};

use super::{Store, Transaction};

const TASK_SELECT: &str = r#"
    SELECT t.id, t.kind, t.priority, t.status, t.created_at, t.status_changed_at,
           t.start_at, t.delayed_until, t.timeout_at, t.finalized_at, t.retries, t.version,
           p.payload, r.result
    FROM tasks t
    JOIN task_payloads p ON p.task_id = t.id
    LEFT JOIN task_results r ON r.task_id = t.id
"#;

const MESSAGE_SELECT: &str = r#"
    SELECT m.id, m.queue, m.priority, m.hold, m.generation, m.status, m.created_at,
           m.status_changed_at, m.start_at, m.delayed_until, m.timeout_at, m.finalized_at,
           m.retries, m.version, p.payload
    FROM messages m
    JOIN message_payloads p ON p.message_id = m.id
"#;

fn limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(options: PgConnectOptions, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>, Error> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn ping(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Rolls back on drop unless committed.
pub struct PgTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn fetch_tasks(
        &mut self,
        query: sqlx::query::QueryAs<'_, Postgres, TaskRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Task>, Error> {
        query
            .fetch_all(&mut *self.tx)
            .await?
            .into_iter()
            .map(Task::from_row)
            .collect()
    }

    async fn fetch_messages(&mut self, rows: Vec<MessageRow>) -> Result<Vec<Message>, Error> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();

        let chapters: Vec<ChapterRow> = sqlx::query_as(
            "SELECT message_id, generation, queue, priority, retries, redirected_at
             FROM message_history
             WHERE message_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<ChapterRow>> = HashMap::new();
        for chapter in chapters {
            by_message.entry(chapter.message_id).or_default().push(chapter);
        }

        rows.into_iter()
            .map(|row| {
                let history = by_message.remove(&row.id).unwrap_or_default();
                Message::from_row(row, history)
            })
            .collect()
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    #[instrument(skip(self))]
    async fn get_task(&mut self, id: Uuid) -> Result<Task, Error> {
        let row: Option<TaskRow> = sqlx::query_as(&format!("{TASK_SELECT} WHERE t.id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(Task::from_row)
            .transpose()?
            .ok_or_else(|| Error::task_not_found(id))
    }

    #[instrument(skip(self))]
    async fn ready_tasks_with_lock(
        &mut self,
        kinds: &[QueueName],
        max: usize,
    ) -> Result<Vec<Task>, Error> {
        let kinds: Vec<&str> = kinds.iter().map(QueueName::as_str).collect();
        let sql = format!(
            "{TASK_SELECT}
             WHERE t.kind = ANY($1) AND t.status = $2
             ORDER BY t.priority DESC, t.status_changed_at ASC
             LIMIT $3
             FOR UPDATE OF t SKIP LOCKED"
        );

        self.fetch_tasks(
            sqlx::query_as(&sql)
                .bind(kinds)
                .bind(Status::Ready.as_ref())
                .bind(limit(max)),
        )
        .await
    }

    async fn processing_tasks_to_expire(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Task>, Error> {
        let sql = format!(
            "{TASK_SELECT}
             WHERE t.status = $1 AND t.timeout_at <= $2
             ORDER BY t.timeout_at ASC
             LIMIT $3
             FOR UPDATE OF t SKIP LOCKED"
        );

        self.fetch_tasks(
            sqlx::query_as(&sql)
                .bind(Status::Processing.as_ref())
                .bind(now)
                .bind(limit(max)),
        )
        .await
    }

    async fn delayed_tasks_to_resume(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Task>, Error> {
        let sql = format!(
            "{TASK_SELECT}
             WHERE t.status = $1 AND t.delayed_until <= $2
             ORDER BY t.delayed_until ASC
             LIMIT $3
             FOR UPDATE OF t SKIP LOCKED"
        );

        self.fetch_tasks(
            sqlx::query_as(&sql)
                .bind(Status::Delayed.as_ref())
                .bind(now)
                .bind(limit(max)),
        )
        .await
    }

    async fn finalized_tasks(&mut self, max: usize) -> Result<Vec<Task>, Error> {
        let sql = format!(
            "{TASK_SELECT}
             WHERE t.finalized_at IS NOT NULL
             ORDER BY t.finalized_at ASC
             LIMIT $1
             FOR UPDATE OF t SKIP LOCKED"
        );

        self.fetch_tasks(sqlx::query_as(&sql).bind(limit(max))).await
    }

    #[instrument(skip_all, fields(id = %task.id()))]
    async fn save_task(&mut self, task: &mut Task) -> Result<(), Error> {
        let row = task.to_row();
        let columns = &row.lifecycle;

        if task.is_new() {
            sqlx::query(
                "INSERT INTO tasks (id, kind, priority, status, created_at, status_changed_at,
                                    start_at, delayed_until, timeout_at, finalized_at, retries, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            )
            .bind(row.id)
            .bind(&row.kind)
            .bind(row.priority)
            .bind(&columns.status)
            .bind(columns.created_at)
            .bind(columns.status_changed_at)
            .bind(columns.start_at)
            .bind(columns.delayed_until)
            .bind(columns.timeout_at)
            .bind(columns.finalized_at)
            .bind(columns.retries)
            .bind(columns.version + 1)
            .execute(&mut *self.tx)
            .await?;

            sqlx::query("INSERT INTO task_payloads (task_id, payload) VALUES ($1, $2)")
                .bind(row.id)
                .bind(&row.payload)
                .execute(&mut *self.tx)
                .await?;
        } else {
            let updated = sqlx::query(
                "UPDATE tasks
                 SET status = $1, status_changed_at = $2, start_at = $3, delayed_until = $4,
                     timeout_at = $5, finalized_at = $6, retries = $7, version = version + 1
                 WHERE id = $8 AND version = $9",
            )
            .bind(&columns.status)
            .bind(columns.status_changed_at)
            .bind(columns.start_at)
            .bind(columns.delayed_until)
            .bind(columns.timeout_at)
            .bind(columns.finalized_at)
            .bind(columns.retries)
            .bind(row.id)
            .bind(columns.version)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(Error::StaleVersion {
                    entity: "task",
                    id: row.id,
                    version: columns.version,
                });
            }
        }

        if let (true, Some(result)) = (task.result_pending(), &row.result) {
            sqlx::query("INSERT INTO task_results (task_id, result) VALUES ($1, $2)")
                .bind(row.id)
                .bind(result)
                .execute(&mut *self.tx)
                .await?;
        }

        task.mark_saved();

        Ok(())
    }

    async fn delete_task(&mut self, task: &Task) -> Result<(), Error> {
        let version = task.lifecycle().version();

        let deleted = sqlx::query("DELETE FROM tasks WHERE id = $1 AND version = $2")
            .bind(task.id())
            .bind(version)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(Error::StaleVersion {
                entity: "task",
                id: task.id(),
                version,
            });
        }

        Ok(())
    }

    async fn upsert_archived_task(&mut self, task: &ArchivedTask) -> Result<(), Error> {
        let row = task.to_row();

        sqlx::query(
            "INSERT INTO archived_tasks (id, kind, priority, status, created_at, finalized_at,
                                         retries, payload, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO UPDATE
             SET status = EXCLUDED.status, finalized_at = EXCLUDED.finalized_at,
                 retries = EXCLUDED.retries, result = EXCLUDED.result",
        )
        .bind(row.id)
        .bind(row.kind)
        .bind(row.priority)
        .bind(row.status)
        .bind(row.created_at)
        .bind(row.finalized_at)
        .bind(row.retries)
        .bind(row.payload)
        .bind(row.result)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_archived_task(&mut self, id: Uuid) -> Result<Option<ArchivedTask>, Error> {
        let row: Option<ArchivedTaskRow> = sqlx::query_as(
            "SELECT id, kind, priority, status, created_at, finalized_at, retries, payload, result
             FROM archived_tasks
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(ArchivedTask::from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn get_message(&mut self, id: Uuid) -> Result<Message, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!("{MESSAGE_SELECT} WHERE m.id = $1"))
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await?;

        self.fetch_messages(rows)
            .await?
            .pop()
            .ok_or_else(|| Error::message_not_found(id))
    }

    #[instrument(skip(self), fields(queue = %queue))]
    async fn available_messages_with_lock(
        &mut self,
        queue: &QueueName,
        max: usize,
    ) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT}
             WHERE m.queue = $1 AND m.status = $2
             ORDER BY m.priority DESC, m.status_changed_at ASC
             LIMIT $3
             FOR UPDATE OF m SKIP LOCKED"
        ))
        .bind(queue.as_str())
        .bind(Status::Ready.as_ref())
        .bind(limit(max))
        .fetch_all(&mut *self.tx)
        .await?;

        self.fetch_messages(rows).await
    }

    async fn processing_messages_to_expire(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT}
             WHERE m.status = $1 AND m.timeout_at <= $2
             ORDER BY m.timeout_at ASC
             LIMIT $3
             FOR UPDATE OF m SKIP LOCKED"
        ))
        .bind(Status::Processing.as_ref())
        .bind(now)
        .bind(limit(max))
        .fetch_all(&mut *self.tx)
        .await?;

        self.fetch_messages(rows).await
    }

    async fn delayed_messages_to_resume(
        &mut self,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT}
             WHERE m.status = $1 AND m.delayed_until <= $2
             ORDER BY m.delayed_until ASC
             LIMIT $3
             FOR UPDATE OF m SKIP LOCKED"
        ))
        .bind(Status::Delayed.as_ref())
        .bind(now)
        .bind(limit(max))
        .fetch_all(&mut *self.tx)
        .await?;

        self.fetch_messages(rows).await
    }

    async fn finalized_messages(&mut self, max: usize) -> Result<Vec<Message>, Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "{MESSAGE_SELECT}
             WHERE m.finalized_at IS NOT NULL
             ORDER BY m.finalized_at ASC
             LIMIT $1
             FOR UPDATE OF m SKIP LOCKED"
        ))
        .bind(limit(max))
        .fetch_all(&mut *self.tx)
        .await?;

        self.fetch_messages(rows).await
    }

    #[instrument(skip_all, fields(id = %message.id()))]
    async fn save_message(&mut self, message: &mut Message) -> Result<(), Error> {
        let row = message.to_row();
        let columns = &row.lifecycle;

        if message.is_new() {
            sqlx::query(
                "INSERT INTO messages (id, queue, priority, status, hold, generation, created_at,
                                       status_changed_at, start_at, delayed_until, timeout_at,
                                       finalized_at, retries, version)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
            )
            .bind(row.id)
            .bind(&row.queue)
            .bind(row.priority)
            .bind(&columns.status)
            .bind(row.hold)
            .bind(row.generation)
            .bind(columns.created_at)
            .bind(columns.status_changed_at)
            .bind(columns.start_at)
            .bind(columns.delayed_until)
            .bind(columns.timeout_at)
            .bind(columns.finalized_at)
            .bind(columns.retries)
            .bind(columns.version + 1)
            .execute(&mut *self.tx)
            .await?;

            sqlx::query("INSERT INTO message_payloads (message_id, payload) VALUES ($1, $2)")
                .bind(row.id)
                .bind(&row.payload)
                .execute(&mut *self.tx)
                .await?;
        } else {
            let updated = sqlx::query(
                "UPDATE messages
                 SET queue = $1, priority = $2, generation = $3, status = $4,
                     status_changed_at = $5, start_at = $6, delayed_until = $7, timeout_at = $8,
                     finalized_at = $9, retries = $10, version = version + 1
                 WHERE id = $11 AND version = $12",
            )
            .bind(&row.queue)
            .bind(row.priority)
            .bind(row.generation)
            .bind(&columns.status)
            .bind(columns.status_changed_at)
            .bind(columns.start_at)
            .bind(columns.delayed_until)
            .bind(columns.timeout_at)
            .bind(columns.finalized_at)
            .bind(columns.retries)
            .bind(row.id)
            .bind(columns.version)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

            if updated == 0 {
                return Err(Error::StaleVersion {
                    entity: "message",
                    id: row.id,
                    version: columns.version,
                });
            }
        }

        for chapter in message.unsaved_chapters() {
            let chapter = ChapterRow::new(row.id, chapter);

            sqlx::query(
                "INSERT INTO message_history (message_id, generation, queue, priority, retries,
                                              redirected_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(chapter.message_id)
            .bind(chapter.generation)
            .bind(chapter.queue)
            .bind(chapter.priority)
            .bind(chapter.retries)
            .bind(chapter.redirected_at)
            .execute(&mut *self.tx)
            .await?;
        }

        message.mark_saved();

        Ok(())
    }

    async fn delete_message(&mut self, message: &Message) -> Result<(), Error> {
        let version = message.lifecycle().version();

        let deleted = sqlx::query("DELETE FROM messages WHERE id = $1 AND version = $2")
            .bind(message.id())
            .bind(version)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            return Err(Error::StaleVersion {
                entity: "message",
                id: message.id(),
                version,
            });
        }

        Ok(())
    }

    async fn upsert_archived_message(&mut self, message: &ArchivedMessage) -> Result<(), Error> {
        let row = message.to_row();

        sqlx::query(
            "INSERT INTO archived_messages (id, queue, priority, status, generation, created_at,
                                            finalized_at, retries, payload, history)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE
             SET queue = EXCLUDED.queue, status = EXCLUDED.status,
                 generation = EXCLUDED.generation, finalized_at = EXCLUDED.finalized_at,
                 retries = EXCLUDED.retries, history = EXCLUDED.history",
        )
        .bind(row.id)
        .bind(row.queue)
        .bind(row.priority)
        .bind(row.status)
        .bind(row.generation)
        .bind(row.created_at)
        .bind(row.finalized_at)
        .bind(row.retries)
        .bind(row.payload)
        .bind(row.history)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn get_archived_message(&mut self, id: Uuid) -> Result<Option<ArchivedMessage>, Error> {
        let row: Option<ArchivedMessageRow> = sqlx::query_as(
            "SELECT id, queue, priority, status, generation, created_at, finalized_at, retries,
                    payload, history
             FROM archived_messages
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(ArchivedMessage::from_row).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        self.tx.commit().await?;
        Ok(())
    }
}
