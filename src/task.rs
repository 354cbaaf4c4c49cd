//! Tasks: units of work claimed by kind.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::Error,
    event::{Dispatcher, Event},
    lifecycle::{Lifecycle, LifecycleColumns, Refusal, Status},
    queue::QueueName,
};

pub const DEFAULT_PRIORITY: u8 = 100;

const ENTITY: &str = "task";

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    id: Uuid,
    kind: QueueName,
    payload: Bytes,
    priority: u8,
    result: Option<Bytes>,
    lifecycle: Lifecycle,
    is_new: bool,
    result_pending: bool,
}

impl Task {
    pub fn new(
        clock: &dyn Clock,
        kind: QueueName,
        payload: Bytes,
        priority: Option<u8>,
        start_at: Option<DateTime<Utc>>,
    ) -> Result<Self, Error> {
        Ok(Self {
            id: Uuid::now_v7(),
            kind,
            payload,
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            result: None,
            lifecycle: Lifecycle::new(clock.now(), start_at)?,
            is_new: true,
            result_pending: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &QueueName {
        &self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn result(&self) -> Option<&Bytes> {
        self.result.as_ref()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    /// Not yet persisted; the next save inserts.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Completed with a result that has not been written yet.
    pub fn result_pending(&self) -> bool {
        self.result_pending
    }

    fn refused(&self, refusal: Refusal) -> Error {
        refusal.into_error(ENTITY, self.id)
    }

    fn announce(&self, dispatcher: &mut dyn Dispatcher) {
        dispatcher.dispatch(Event::TaskReady {
            kind: self.kind.to_string(),
        });
    }

    pub fn confirm(&mut self, clock: &dyn Clock, dispatcher: &mut dyn Dispatcher) -> Result<(), Error> {
        let ready = self
            .lifecycle
            .confirm(clock.now(), false)
            .map_err(|r| self.refused(r))?;

        if ready {
            self.announce(dispatcher);
        }

        Ok(())
    }

    pub fn start_processing(&mut self, clock: &dyn Clock, timeout: Duration) -> Result<(), Error> {
        self.lifecycle
            .start_processing(clock.now(), timeout)
            .map_err(|r| self.refused(r))
    }

    pub fn delay(&mut self, clock: &dyn Clock, until: DateTime<Utc>) -> Result<(), Error> {
        self.lifecycle
            .delay(clock.now(), until)
            .map_err(|r| self.refused(r))
    }

    pub fn resume(&mut self, clock: &dyn Clock, dispatcher: &mut dyn Dispatcher) -> Result<(), Error> {
        self.lifecycle
            .resume(clock.now())
            .map_err(|r| self.refused(r))?;
        self.announce(dispatcher);
        Ok(())
    }

    pub fn complete(&mut self, clock: &dyn Clock, result: Option<Bytes>) -> Result<(), Error> {
        self.lifecycle
            .complete(clock.now())
            .map_err(|r| self.refused(r))?;

        self.result_pending = result.is_some();
        self.result = result;

        Ok(())
    }

    pub fn fail(&mut self, clock: &dyn Clock) -> Result<(), Error> {
        self.lifecycle.fail(clock.now()).map_err(|r| self.refused(r))
    }

    pub(crate) fn mark_saved(&mut self) {
        self.is_new = false;
        self.result_pending = false;
        self.lifecycle.bump_version();
    }

    pub fn to_row(&self) -> TaskRow {
        TaskRow {
            id: self.id,
            kind: self.kind.to_string(),
            priority: i16::from(self.priority),
            payload: self.payload.to_vec(),
            result: self.result.as_ref().map(|r| r.to_vec()),
            lifecycle: self.lifecycle.to_columns(),
        }
    }

    pub fn from_row(row: TaskRow) -> Result<Self, Error> {
        let id = row.id;

        let kind = QueueName::parse(&row.kind).map_err(|e| Error::corrupted(ENTITY, id, e.to_string()))?;
        let priority = u8::try_from(row.priority)
            .map_err(|_| Error::corrupted(ENTITY, id, format!("priority {} out of range", row.priority)))?;
        let lifecycle =
            Lifecycle::from_columns(row.lifecycle).map_err(|e| Error::corrupted(ENTITY, id, e))?;

        if row.result.is_some() && lifecycle.status() != Status::Completed {
            return Err(Error::corrupted(
                ENTITY,
                id,
                "result stored for a task that did not complete",
            ));
        }

        Ok(Self {
            id,
            kind,
            payload: Bytes::from(row.payload),
            priority,
            result: row.result.map(Bytes::from),
            lifecycle,
            is_new: false,
            result_pending: false,
        })
    }
}

/// A task row joined with its payload and result.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TaskRow {
    pub id: Uuid,
    pub kind: String,
    pub priority: i16,
    pub payload: Vec<u8>,
    pub result: Option<Vec<u8>>,
    #[sqlx(flatten)]
    pub lifecycle: LifecycleColumns,
}

/// Cold-storage copy of a finalized task.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedTask {
    pub id: Uuid,
    pub kind: String,
    pub priority: u8,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub retries: u32,
    pub payload: Bytes,
    pub result: Option<Bytes>,
}

impl TryFrom<&Task> for ArchivedTask {
    type Error = Error;

    fn try_from(task: &Task) -> Result<Self, Self::Error> {
        let finalized_at = match task.lifecycle.finalized_at() {
            Some(at) if task.status().is_terminal() => at,
            _ => {
                return Err(Error::IllegalTransition {
                    entity: ENTITY,
                    id: task.id,
                    status: task.status(),
                    action: "archive",
                })
            }
        };

        Ok(Self {
            id: task.id,
            kind: task.kind.to_string(),
            priority: task.priority,
            status: task.status(),
            created_at: task.lifecycle.created_at(),
            finalized_at,
            retries: task.lifecycle.retries(),
            payload: task.payload.clone(),
            result: task.result.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ArchivedTaskRow {
    pub id: Uuid,
    pub kind: String,
    pub priority: i16,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub retries: i32,
    pub payload: Vec<u8>,
    pub result: Option<Vec<u8>>,
}

impl ArchivedTask {
    pub fn to_row(&self) -> ArchivedTaskRow {
        ArchivedTaskRow {
            id: self.id,
            kind: self.kind.clone(),
            priority: i16::from(self.priority),
            status: self.status.to_string(),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
            retries: i32::try_from(self.retries).unwrap_or(i32::MAX),
            payload: self.payload.to_vec(),
            result: self.result.as_ref().map(|r| r.to_vec()),
        }
    }

    pub fn from_row(row: ArchivedTaskRow) -> Result<Self, Error> {
        let id = row.id;
        let status: Status = row
            .status
            .parse()
            .map_err(|_| Error::corrupted(ENTITY, id, format!("unknown status '{}'", row.status)))?;

        if !status.is_terminal() {
            return Err(Error::corrupted(ENTITY, id, "archived in a non-terminal status"));
        }

        let priority = u8::try_from(row.priority)
            .map_err(|_| Error::corrupted(ENTITY, id, format!("priority {} out of range", row.priority)))?;
        let retries = u32::try_from(row.retries)
            .map_err(|_| Error::corrupted(ENTITY, id, format!("negative retries {}", row.retries)))?;

        Ok(Self {
            id,
            kind: row.kind,
            priority,
            status,
            created_at: row.created_at,
            finalized_at: row.finalized_at,
            retries,
            payload: Bytes::from(row.payload),
            result: row.result.map(Bytes::from),
        })
    }
}

/// What `task/check` reports, from either live or archived storage.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: Uuid,
    pub kind: String,
    pub priority: u8,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub start_at: Option<DateTime<Utc>>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub payload: String,
    pub result: Option<String>,
    pub archived: bool,
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl From<&Task> for TaskView {
    fn from(task: &Task) -> Self {
        let lifecycle = &task.lifecycle;

        Self {
            id: task.id,
            kind: task.kind.to_string(),
            priority: task.priority,
            status: lifecycle.status(),
            created_at: lifecycle.created_at(),
            status_changed_at: Some(lifecycle.status_changed_at()),
            start_at: lifecycle.start_at(),
            delayed_until: lifecycle.delayed_until(),
            timeout_at: lifecycle.timeout_at(),
            finalized_at: lifecycle.finalized_at(),
            retries: lifecycle.retries(),
            payload: text(&task.payload),
            result: task.result.as_ref().map(text),
            archived: false,
        }
    }
}

impl From<&ArchivedTask> for TaskView {
    fn from(task: &ArchivedTask) -> Self {
        Self {
            id: task.id,
            kind: task.kind.clone(),
            priority: task.priority,
            status: task.status,
            created_at: task.created_at,
            status_changed_at: None,
            start_at: None,
            delayed_until: None,
            timeout_at: None,
            finalized_at: Some(task.finalized_at),
            retries: task.retries,
            payload: text(&task.payload),
            result: task.result.as_ref().map(text),
            archived: true,
        }
    }
}
