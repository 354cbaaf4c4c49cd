//! Messages: units of work consumed from a named queue.
//!
//! Messages share the task lifecycle and add two things:
//!
//! - **Holding.** A message created with `hold` parks in `Prepared` on confirm and only
//!   becomes available once released, typically by the ack of the message it depends on.
//! - **Redirects.** A message can move to another queue. Every move appends a
//!   [`Chapter`] recording where it was, and bumps the generation. Dead-lettering is
//!   a redirect to the queue's `:dl` twin.

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, types::Json};
use uuid::Uuid;

use crate::{
    clock::Clock,
    error::Error,
    event::{Dispatcher, Event},
    lifecycle::{Lifecycle, LifecycleColumns, Refusal, Status},
    queue::QueueName,
    task::DEFAULT_PRIORITY,
};

const ENTITY: &str = "message";

/// Where a message was before a redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub queue: String,
    pub priority: u8,
    pub retries: u32,
    pub generation: u32,
    pub redirected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: Uuid,
    queue: QueueName,
    payload: Bytes,
    priority: u8,
    hold: bool,
    generation: u32,
    history: Vec<Chapter>,
    lifecycle: Lifecycle,
    is_new: bool,
    persisted_chapters: usize,
}

impl Message {
    pub fn new(
        clock: &dyn Clock,
        queue: QueueName,
        payload: Bytes,
        priority: Option<u8>,
        start_at: Option<DateTime<Utc>>,
        hold: bool,
    ) -> Result<Self, Error> {
        Ok(Self {
            id: Uuid::now_v7(),
            queue,
            payload,
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            hold,
            generation: 0,
            history: Vec::new(),
            lifecycle: Lifecycle::new(clock.now(), start_at)?,
            is_new: true,
            persisted_chapters: 0,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn hold(&self) -> bool {
        self.hold
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn history(&self) -> &[Chapter] {
        &self.history
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Chapters appended since the last save.
    pub fn unsaved_chapters(&self) -> &[Chapter] {
        &self.history[self.persisted_chapters..]
    }

    fn refused(&self, refusal: Refusal) -> Error {
        refusal.into_error(ENTITY, self.id)
    }

    fn announce(&self, dispatcher: &mut dyn Dispatcher) {
        dispatcher.dispatch(Event::MessageReady {
            queue: self.queue.to_string(),
        });
    }

    pub fn confirm(&mut self, clock: &dyn Clock, dispatcher: &mut dyn Dispatcher) -> Result<(), Error> {
        let ready = self
            .lifecycle
            .confirm(clock.now(), self.hold)
            .map_err(|r| self.refused(r))?;

        if ready {
            self.announce(dispatcher);
        }

        Ok(())
    }

    pub fn release(&mut self, clock: &dyn Clock, dispatcher: &mut dyn Dispatcher) -> Result<(), Error> {
        let ready = self
            .lifecycle
            .release(clock.now())
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

    pub fn complete(&mut self, clock: &dyn Clock) -> Result<(), Error> {
        self.lifecycle
            .complete(clock.now())
            .map_err(|r| self.refused(r))
    }

    pub fn fail(&mut self, clock: &dyn Clock) -> Result<(), Error> {
        self.lifecycle.fail(clock.now()).map_err(|r| self.refused(r))
    }

    /// Moves the message to `destination`, recording the current placement as a chapter.
    ///
    /// Retries carry over. The message lands ready in the destination queue.
    pub fn redirect(
        &mut self,
        clock: &dyn Clock,
        dispatcher: &mut dyn Dispatcher,
        destination: QueueName,
    ) -> Result<(), Error> {
        self.move_to(
            clock,
            dispatcher,
            destination,
            &[Status::Ready, Status::Processing],
            "redirect",
        )
    }

    /// Moves a claimed message to its queue's dead-letter companion.
    pub fn dead_letter(&mut self, clock: &dyn Clock, dispatcher: &mut dyn Dispatcher) -> Result<(), Error> {
        let destination = self.queue.dead_letter();
        self.move_to(clock, dispatcher, destination, &[Status::Processing], "dead-letter")
    }

    fn move_to(
        &mut self,
        clock: &dyn Clock,
        dispatcher: &mut dyn Dispatcher,
        destination: QueueName,
        from: &[Status],
        action: &'static str,
    ) -> Result<(), Error> {
        let now = clock.now();

        self.lifecycle
            .requeue(now, from, action)
            .map_err(|r| self.refused(r))?;

        self.history.push(Chapter {
            queue: self.queue.to_string(),
            priority: self.priority,
            retries: self.lifecycle.retries(),
            generation: self.generation,
            redirected_at: now,
        });
        self.generation += 1;
        self.queue = destination;

        self.announce(dispatcher);

        Ok(())
    }

    pub(crate) fn mark_saved(&mut self) {
        self.is_new = false;
        self.persisted_chapters = self.history.len();
        self.lifecycle.bump_version();
    }

    pub fn to_row(&self) -> MessageRow {
        MessageRow {
            id: self.id,
            queue: self.queue.to_string(),
            priority: i16::from(self.priority),
            hold: self.hold,
            generation: i32::try_from(self.generation).unwrap_or(i32::MAX),
            payload: self.payload.to_vec(),
            lifecycle: self.lifecycle.to_columns(),
        }
    }

    pub fn chapter_rows(&self) -> Vec<ChapterRow> {
        self.history
            .iter()
            .map(|chapter| ChapterRow::new(self.id, chapter))
            .collect()
    }

    pub fn from_row(row: MessageRow, chapters: Vec<ChapterRow>) -> Result<Self, Error> {
        let id = row.id;
        let corrupted = |message: String| Error::corrupted(ENTITY, id, message);

        let queue = QueueName::parse(&row.queue).map_err(|e| corrupted(e.to_string()))?;
        let priority = u8::try_from(row.priority)
            .map_err(|_| corrupted(format!("priority {} out of range", row.priority)))?;
        let generation = u32::try_from(row.generation)
            .map_err(|_| corrupted(format!("negative generation {}", row.generation)))?;
        let lifecycle = Lifecycle::from_columns(row.lifecycle).map_err(corrupted)?;

        let mut history = chapters
            .into_iter()
            .map(ChapterRow::into_chapter)
            .collect::<Result<Vec<_>, _>>()
            .map_err(corrupted)?;
        history.sort_by_key(|chapter| chapter.generation);

        let contiguous = history
            .iter()
            .enumerate()
            .all(|(i, chapter)| chapter.generation as usize == i);

        if !contiguous || history.len() != generation as usize {
            return Err(corrupted(format!(
                "history of {} chapters does not lead to generation {generation}",
                history.len()
            )));
        }

        Ok(Self {
            id,
            queue,
            payload: Bytes::from(row.payload),
            priority,
            hold: row.hold,
            generation,
            persisted_chapters: history.len(),
            history,
            lifecycle,
            is_new: false,
        })
    }
}

/// A message row joined with its payload. History lives in [`ChapterRow`]s.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct MessageRow {
    pub id: Uuid,
    pub queue: String,
    pub priority: i16,
    pub hold: bool,
    pub generation: i32,
    pub payload: Vec<u8>,
    #[sqlx(flatten)]
    pub lifecycle: LifecycleColumns,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct ChapterRow {
    pub message_id: Uuid,
    pub generation: i32,
    pub queue: String,
    pub priority: i16,
    pub retries: i32,
    pub redirected_at: DateTime<Utc>,
}

impl ChapterRow {
    pub fn new(message_id: Uuid, chapter: &Chapter) -> Self {
        Self {
            message_id,
            generation: i32::try_from(chapter.generation).unwrap_or(i32::MAX),
            queue: chapter.queue.clone(),
            priority: i16::from(chapter.priority),
            retries: i32::try_from(chapter.retries).unwrap_or(i32::MAX),
            redirected_at: chapter.redirected_at,
        }
    }

    fn into_chapter(self) -> Result<Chapter, String> {
        Ok(Chapter {
            generation: u32::try_from(self.generation)
                .map_err(|_| format!("negative chapter generation {}", self.generation))?,
            priority: u8::try_from(self.priority)
                .map_err(|_| format!("chapter priority {} out of range", self.priority))?,
            retries: u32::try_from(self.retries)
                .map_err(|_| format!("negative chapter retries {}", self.retries))?,
            queue: self.queue,
            redirected_at: self.redirected_at,
        })
    }
}

/// Cold-storage copy of a delivered or dropped message.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedMessage {
    pub id: Uuid,
    pub queue: String,
    pub priority: u8,
    pub status: Status,
    pub generation: u32,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub retries: u32,
    pub payload: Bytes,
    pub history: Vec<Chapter>,
}

impl TryFrom<&Message> for ArchivedMessage {
    type Error = Error;

    fn try_from(message: &Message) -> Result<Self, Self::Error> {
        let finalized_at = match message.lifecycle.finalized_at() {
            Some(at) if message.status().is_terminal() => at,
            _ => {
                return Err(Error::IllegalTransition {
                    entity: ENTITY,
                    id: message.id,
                    status: message.status(),
                    action: "archive",
                })
            }
        };

        Ok(Self {
            id: message.id,
            queue: message.queue.to_string(),
            priority: message.priority,
            status: message.status(),
            generation: message.generation,
            created_at: message.lifecycle.created_at(),
            finalized_at,
            retries: message.lifecycle.retries(),
            payload: message.payload.clone(),
            history: message.history.clone(),
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ArchivedMessageRow {
    pub id: Uuid,
    pub queue: String,
    pub priority: i16,
    pub status: String,
    pub generation: i32,
    pub created_at: DateTime<Utc>,
    pub finalized_at: DateTime<Utc>,
    pub retries: i32,
    pub payload: Vec<u8>,
    pub history: Json<Vec<Chapter>>,
}

impl ArchivedMessage {
    pub fn to_row(&self) -> ArchivedMessageRow {
        ArchivedMessageRow {
            id: self.id,
            queue: self.queue.clone(),
            priority: i16::from(self.priority),
            status: self.status.to_string(),
            generation: i32::try_from(self.generation).unwrap_or(i32::MAX),
            created_at: self.created_at,
            finalized_at: self.finalized_at,
            retries: i32::try_from(self.retries).unwrap_or(i32::MAX),
            payload: self.payload.to_vec(),
            history: Json(self.history.clone()),
        }
    }

    pub fn from_row(row: ArchivedMessageRow) -> Result<Self, Error> {
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
        let generation = u32::try_from(row.generation)
            .map_err(|_| Error::corrupted(ENTITY, id, format!("negative generation {}", row.generation)))?;
        let retries = u32::try_from(row.retries)
            .map_err(|_| Error::corrupted(ENTITY, id, format!("negative retries {}", row.retries)))?;

        Ok(Self {
            id,
            queue: row.queue,
            priority,
            status,
            generation,
            created_at: row.created_at,
            finalized_at: row.finalized_at,
            retries,
            payload: Bytes::from(row.payload),
            history: row.history.0,
        })
    }
}

/// What `messages/check` reports for one message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: Uuid,
    pub queue: String,
    pub priority: u8,
    pub status: &'static str,
    pub generation: u32,
    pub history: Vec<Chapter>,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: Option<DateTime<Utc>>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub payload: String,
    pub archived: bool,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let lifecycle = &message.lifecycle;

        Self {
            id: message.id,
            queue: message.queue.to_string(),
            priority: message.priority,
            status: lifecycle.status().message_label(),
            generation: message.generation,
            history: message.history.clone(),
            created_at: lifecycle.created_at(),
            status_changed_at: Some(lifecycle.status_changed_at()),
            delayed_until: lifecycle.delayed_until(),
            timeout_at: lifecycle.timeout_at(),
            finalized_at: lifecycle.finalized_at(),
            retries: lifecycle.retries(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            archived: false,
        }
    }
}

impl From<&ArchivedMessage> for MessageView {
    fn from(message: &ArchivedMessage) -> Self {
        Self {
            id: message.id,
            queue: message.queue.clone(),
            priority: message.priority,
            status: message.status.message_label(),
            generation: message.generation,
            history: message.history.clone(),
            created_at: message.created_at,
            status_changed_at: None,
            delayed_until: None,
            timeout_at: None,
            finalized_at: Some(message.finalized_at),
            retries: message.retries,
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            archived: true,
        }
    }
}

/// A claimed message as handed to a consumer.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub id: Uuid,
    pub queue: String,
    pub payload: String,
    pub priority: u8,
    pub retries: u32,
    pub generation: u32,
    pub timeout_at: Option<DateTime<Utc>>,
}

impl From<&Message> for Delivery {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            queue: message.queue.to_string(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            priority: message.priority,
            retries: message.lifecycle.retries(),
            generation: message.generation,
            timeout_at: message.lifecycle.timeout_at(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::clock::ManualClock;

    fn queue(name: &str) -> QueueName {
        QueueName::parse(name).unwrap()
    }

    fn ready(clock: &ManualClock, name: &str) -> Message {
        let mut message =
            Message::new(clock, queue(name), Bytes::from_static(b"hello"), None, None, false).unwrap();
        message.confirm(clock, &mut Vec::<Event>::new()).unwrap();
        message
    }

    #[test]
    fn test_hold_parks_until_release() {
        let clock = ManualClock::starting_now();
        let mut message =
            Message::new(&clock, queue("orders"), Bytes::new(), None, None, true).unwrap();
        let mut events = Vec::new();

        message.confirm(&clock, &mut events).unwrap();
        assert_eq!(message.status(), Status::Prepared);
        assert!(events.is_empty());

        message.release(&clock, &mut events).unwrap();
        assert_eq!(message.status(), Status::Ready);
        assert_eq!(
            events,
            vec![Event::MessageReady {
                queue: "orders".to_owned()
            }]
        );

        assert!(message.release(&clock, &mut events).is_err());
    }

    #[test]
    fn test_redirect_preserves_lineage() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        let mut events = Vec::new();

        message.redirect(&clock, &mut events, queue("b")).unwrap();

        assert_eq!(message.queue().as_str(), "b");
        assert_eq!(message.generation(), 1);
        assert_eq!(message.status(), Status::Ready);
        assert_eq!(message.history().len(), 1);
        assert_eq!(message.history()[0].queue, "a");
        assert_eq!(message.history()[0].generation, 0);
        assert_eq!(
            events,
            vec![Event::MessageReady {
                queue: "b".to_owned()
            }]
        );
        assert_eq!(message.unsaved_chapters().len(), 1);
    }

    #[test]
    fn test_redirect_from_processing_keeps_retries() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        let mut events = Vec::<Event>::new();

        message.start_processing(&clock, Duration::from_secs(30)).unwrap();
        message.delay(&clock, clock.now()).unwrap();
        message.resume(&clock, &mut events).unwrap();
        message.start_processing(&clock, Duration::from_secs(30)).unwrap();

        message
            .redirect(&clock, &mut events, queue("a").dead_letter())
            .unwrap();

        assert_eq!(message.lifecycle().retries(), 1);
        assert_eq!(message.lifecycle().timeout_at(), None);
        assert_eq!(message.history()[0].retries, 1);
        assert!(message.queue().is_dead_letter());
    }

    #[test]
    fn test_dead_letter_requires_a_claim() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "orders");
        let mut events = Vec::<Event>::new();

        let error = message.dead_letter(&clock, &mut events).unwrap_err();
        assert!(matches!(
            error,
            Error::IllegalTransition {
                status: Status::Ready,
                action: "dead-letter",
                ..
            }
        ));
        assert_eq!(message.queue().as_str(), "orders");
        assert!(events.is_empty());

        message.start_processing(&clock, Duration::from_secs(30)).unwrap();
        message.dead_letter(&clock, &mut events).unwrap();

        assert!(message.queue().is_dead_letter());
        assert_eq!(message.status(), Status::Ready);
        assert_eq!(message.history()[0].queue, "orders");
    }

    #[test]
    fn test_redirect_of_delayed_message_is_illegal() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        message.start_processing(&clock, Duration::from_secs(30)).unwrap();
        message
            .delay(&clock, clock.now() + TimeDelta::minutes(1))
            .unwrap();

        let error = message
            .redirect(&clock, &mut Vec::<Event>::new(), queue("b"))
            .unwrap_err();

        assert!(matches!(
            error,
            Error::IllegalTransition {
                entity: "message",
                status: Status::Delayed,
                action: "redirect",
                ..
            }
        ));
    }

    #[test]
    fn test_row_round_trip_with_history() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        message
            .redirect(&clock, &mut Vec::<Event>::new(), queue("b"))
            .unwrap();
        message.mark_saved();

        let restored = Message::from_row(message.to_row(), message.chapter_rows()).unwrap();

        assert_eq!(restored, message);
        assert!(restored.unsaved_chapters().is_empty());
    }

    #[test]
    fn test_missing_chapter_is_corruption() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        message
            .redirect(&clock, &mut Vec::<Event>::new(), queue("b"))
            .unwrap();

        assert!(matches!(
            Message::from_row(message.to_row(), Vec::new()),
            Err(Error::Corrupted { .. })
        ));
    }

    #[test]
    fn test_archived_view_uses_message_labels() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        message.start_processing(&clock, Duration::from_secs(30)).unwrap();
        message.complete(&clock).unwrap();

        let archived = ArchivedMessage::try_from(&message).unwrap();
        let view = MessageView::from(&archived);

        assert_eq!(view.status, "delivered");
        assert!(view.archived);
        assert_eq!(view.payload, "hello");
    }

    #[test]
    fn test_archived_row_out_of_range_is_corruption() {
        let clock = ManualClock::starting_now();
        let mut message = ready(&clock, "a");
        message.start_processing(&clock, Duration::from_secs(30)).unwrap();
        message.complete(&clock).unwrap();

        let row = ArchivedMessage::try_from(&message).unwrap().to_row();

        let mut priority = row.clone();
        priority.priority = 300;
        assert!(matches!(
            ArchivedMessage::from_row(priority),
            Err(Error::Corrupted { entity: "message", .. })
        ));

        let mut retries = row.clone();
        retries.retries = -1;
        assert!(matches!(
            ArchivedMessage::from_row(retries),
            Err(Error::Corrupted { entity: "message", .. })
        ));

        let mut generation = row;
        generation.generation = -4;
        assert!(matches!(
            ArchivedMessage::from_row(generation),
            Err(Error::Corrupted { entity: "message", .. })
        ));
    }
}
