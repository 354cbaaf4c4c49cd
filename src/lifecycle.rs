//! Status state machine shared by tasks and messages.
//!
//! ```text
//! CREATED --confirm--> READY --start_processing--> PROCESSING --complete--> COMPLETED
//!    |  \                ^                            |  |
//!    |   `--(hold)--> PREPARED --release--'           |  `--fail--> FAILED
//!    `--(start_at in future)--> DELAYED <--delay------'
//!                                 `--resume (due)--> READY
//! ```
//!
//! [`Lifecycle`] only mutates fields. Entities wrap it, attach their identity to
//! refusals, and raise readiness events.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::error::Error;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Persisted but not yet confirmed by the producer
    Created,
    /// Confirmed, held back until another message's ack releases it
    Prepared,
    /// Waiting to be claimed
    Ready,
    /// Claimed by a consumer until `timeout_at`
    Processing,
    /// Waiting for `delayed_until`
    Delayed,
    Completed,
    Failed,
}

impl Status {
    pub const TERMINAL: [Status; 2] = [Status::Completed, Status::Failed];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Label used by the message API.
    pub fn message_label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Ready => "available",
            Self::Processing => "processing",
            Self::Delayed => "delayed",
            Self::Completed => "delivered",
            Self::Failed => "dropped",
        }
    }
}

/// Why a transition was refused. Entities turn this into an [`Error`] carrying their identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    Illegal {
        status: Status,
        action: &'static str,
    },
    NotReady {
        until: DateTime<Utc>,
    },
}

impl Refusal {
    pub fn into_error(self, entity: &'static str, id: Uuid) -> Error {
        match self {
            Self::Illegal { status, action } => Error::IllegalTransition {
                entity,
                id,
                status,
                action,
            },
            Self::NotReady { until } => Error::NotReady { entity, id, until },
        }
    }
}

pub(crate) fn add(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Storage projection of a [`Lifecycle`], flattened into the task and message rows.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct LifecycleColumns {
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub start_at: Option<DateTime<Utc>>,
    pub delayed_until: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub retries: i32,
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lifecycle {
    pub(crate) status: Status,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) status_changed_at: DateTime<Utc>,
    pub(crate) start_at: Option<DateTime<Utc>>,
    pub(crate) delayed_until: Option<DateTime<Utc>>,
    pub(crate) timeout_at: Option<DateTime<Utc>>,
    pub(crate) finalized_at: Option<DateTime<Utc>>,
    pub(crate) retries: u32,
    pub(crate) version: i64,
}

impl Lifecycle {
    pub(crate) fn new(now: DateTime<Utc>, start_at: Option<DateTime<Utc>>) -> Result<Self, Error> {
        if let Some(start_at) = start_at {
            if start_at < now {
                return Err(Error::invalid_parameter(format!(
                    "start_at {start_at} is in the past"
                )));
            }
        }

        Ok(Self {
            status: Status::Created,
            created_at: now,
            status_changed_at: now,
            start_at,
            delayed_until: None,
            timeout_at: None,
            finalized_at: None,
            retries: 0,
            version: 0,
        })
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status_changed_at(&self) -> DateTime<Utc> {
        self.status_changed_at
    }

    pub fn start_at(&self) -> Option<DateTime<Utc>> {
        self.start_at
    }

    pub fn delayed_until(&self) -> Option<DateTime<Utc>> {
        self.delayed_until
    }

    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        self.timeout_at
    }

    pub fn finalized_at(&self) -> Option<DateTime<Utc>> {
        self.finalized_at
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub(crate) fn to_columns(&self) -> LifecycleColumns {
        LifecycleColumns {
            status: self.status.to_string(),
            created_at: self.created_at,
            status_changed_at: self.status_changed_at,
            start_at: self.start_at,
            delayed_until: self.delayed_until,
            timeout_at: self.timeout_at,
            finalized_at: self.finalized_at,
            retries: i32::try_from(self.retries).unwrap_or(i32::MAX),
            version: self.version,
        }
    }

    /// Rebuilds a lifecycle from storage, rejecting rows that break the invariants.
    pub(crate) fn from_columns(columns: LifecycleColumns) -> Result<Self, String> {
        let status = Status::from_str(&columns.status)
            .map_err(|_| format!("unknown status '{}'", columns.status))?;

        let retries = u32::try_from(columns.retries)
            .map_err(|_| format!("negative retry count {}", columns.retries))?;

        let lifecycle = Self {
            status,
            created_at: columns.created_at,
            status_changed_at: columns.status_changed_at,
            start_at: columns.start_at,
            delayed_until: columns.delayed_until,
            timeout_at: columns.timeout_at,
            finalized_at: columns.finalized_at,
            retries,
            version: columns.version,
        };

        lifecycle.check()?;

        Ok(lifecycle)
    }

    /// Called by the store after a successful write.
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Checks the field/status invariants. Used when rebuilding from storage.
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.finalized_at.is_some() != self.status.is_terminal() {
            return Err(format!(
                "finalized_at must be set exactly in terminal statuses (status {})",
                self.status
            ));
        }

        if self.delayed_until.is_some() != (self.status == Status::Delayed) {
            return Err(format!(
                "delayed_until must be set exactly in delayed status (status {})",
                self.status
            ));
        }

        if self.timeout_at.is_some() != (self.status == Status::Processing) {
            return Err(format!(
                "timeout_at must be set exactly in processing status (status {})",
                self.status
            ));
        }

        Ok(())
    }

    fn expect(&self, allowed: &[Status], action: &'static str) -> Result<(), Refusal> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(Refusal::Illegal {
                status: self.status,
                action,
            })
        }
    }

    fn set_status(&mut self, now: DateTime<Utc>, status: Status) {
        self.status = status;
        self.status_changed_at = now;
    }

    /// Moves to READY, or to DELAYED while the start time lies ahead. Returns whether it is ready.
    fn schedule(&mut self, now: DateTime<Utc>) -> bool {
        match self.start_at {
            Some(start_at) if start_at > now => {
                self.delayed_until = Some(start_at);
                self.set_status(now, Status::Delayed);
                false
            }
            _ => {
                self.set_status(now, Status::Ready);
                true
            }
        }
    }

    /// CREATED -> READY | DELAYED | PREPARED (when `hold`). Returns whether it became ready.
    pub(crate) fn confirm(&mut self, now: DateTime<Utc>, hold: bool) -> Result<bool, Refusal> {
        self.expect(&[Status::Created], "confirm")?;

        if hold {
            self.set_status(now, Status::Prepared);
            return Ok(false);
        }

        Ok(self.schedule(now))
    }

    /// PREPARED -> READY | DELAYED. Returns whether it became ready.
    pub(crate) fn release(&mut self, now: DateTime<Utc>) -> Result<bool, Refusal> {
        self.expect(&[Status::Prepared], "release")?;
        Ok(self.schedule(now))
    }

    pub(crate) fn start_processing(
        &mut self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<(), Refusal> {
        self.expect(&[Status::Ready], "start processing")?;
        self.timeout_at = Some(add(now, timeout));
        self.set_status(now, Status::Processing);
        Ok(())
    }

    pub(crate) fn delay(&mut self, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<(), Refusal> {
        self.expect(&[Status::Processing], "delay")?;
        self.timeout_at = None;
        self.retries += 1;
        self.delayed_until = Some(until);
        self.set_status(now, Status::Delayed);
        Ok(())
    }

    pub(crate) fn resume(&mut self, now: DateTime<Utc>) -> Result<(), Refusal> {
        self.expect(&[Status::Delayed], "resume")?;

        if let Some(until) = self.delayed_until {
            if now < until {
                return Err(Refusal::NotReady { until });
            }
        }

        self.delayed_until = None;
        self.set_status(now, Status::Ready);
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<(), Refusal> {
        self.expect(&[Status::Processing], "complete")?;
        self.timeout_at = None;
        self.finalized_at = Some(now);
        self.set_status(now, Status::Completed);
        Ok(())
    }

    pub(crate) fn fail(&mut self, now: DateTime<Utc>) -> Result<(), Refusal> {
        self.expect(&[Status::Processing], "fail")?;
        self.timeout_at = None;
        self.finalized_at = Some(now);
        self.set_status(now, Status::Failed);
        Ok(())
    }

    /// `from` -> READY, dropping any claim. Used when a message changes queue.
    pub(crate) fn requeue(
        &mut self,
        now: DateTime<Utc>,
        from: &[Status],
        action: &'static str,
    ) -> Result<(), Refusal> {
        self.expect(from, action)?;
        self.timeout_at = None;
        self.set_status(now, Status::Ready);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing(now: DateTime<Utc>) -> Lifecycle {
        let mut lifecycle = Lifecycle::new(now, None).unwrap();
        assert!(lifecycle.confirm(now, false).unwrap());
        lifecycle
            .start_processing(now, Duration::from_secs(300))
            .unwrap();
        lifecycle
    }

    #[test]
    fn test_confirm_without_start_time_is_ready() {
        let now = Utc::now();
        let mut lifecycle = Lifecycle::new(now, None).unwrap();

        assert!(lifecycle.confirm(now, false).unwrap());
        assert_eq!(lifecycle.status(), Status::Ready);
        assert!(lifecycle.check().is_ok());
    }

    #[test]
    fn test_confirm_with_future_start_time_is_delayed() {
        let now = Utc::now();
        let start_at = now + TimeDelta::minutes(10);
        let mut lifecycle = Lifecycle::new(now, Some(start_at)).unwrap();

        assert!(!lifecycle.confirm(now, false).unwrap());
        assert_eq!(lifecycle.status(), Status::Delayed);
        assert_eq!(lifecycle.delayed_until(), Some(start_at));
        assert!(lifecycle.check().is_ok());
    }

    #[test]
    fn test_start_time_in_the_past_is_rejected() {
        let now = Utc::now();
        assert!(Lifecycle::new(now, Some(now - TimeDelta::seconds(1))).is_err());
    }

    #[test]
    fn test_confirm_twice_is_illegal() {
        let now = Utc::now();
        let mut lifecycle = Lifecycle::new(now, None).unwrap();
        lifecycle.confirm(now, false).unwrap();

        assert_eq!(
            lifecycle.confirm(now, false),
            Err(Refusal::Illegal {
                status: Status::Ready,
                action: "confirm"
            })
        );
    }

    #[test]
    fn test_hold_then_release() {
        let now = Utc::now();
        let mut lifecycle = Lifecycle::new(now, None).unwrap();

        assert!(!lifecycle.confirm(now, true).unwrap());
        assert_eq!(lifecycle.status(), Status::Prepared);

        assert!(lifecycle.release(now).unwrap());
        assert_eq!(lifecycle.status(), Status::Ready);
    }

    #[test]
    fn test_start_processing_sets_timeout() {
        let now = Utc::now();
        let lifecycle = processing(now);

        assert_eq!(lifecycle.status(), Status::Processing);
        assert_eq!(lifecycle.timeout_at(), Some(now + TimeDelta::minutes(5)));
        assert!(lifecycle.check().is_ok());
    }

    #[test]
    fn test_delay_increments_retries_by_one() {
        let now = Utc::now();
        let mut lifecycle = processing(now);
        let before = lifecycle.retries();

        lifecycle
            .delay(now, now + TimeDelta::minutes(2))
            .unwrap();

        assert_eq!(lifecycle.retries(), before + 1);
        assert_eq!(lifecycle.timeout_at(), None);
        assert_eq!(lifecycle.status(), Status::Delayed);
        assert!(lifecycle.check().is_ok());
    }

    #[test]
    fn test_resume_before_due_is_refused() {
        let now = Utc::now();
        let mut lifecycle = processing(now);
        let until = now + TimeDelta::minutes(2);
        lifecycle.delay(now, until).unwrap();

        assert_eq!(lifecycle.resume(now), Err(Refusal::NotReady { until }));

        lifecycle.resume(until).unwrap();
        assert_eq!(lifecycle.status(), Status::Ready);
        assert_eq!(lifecycle.delayed_until(), None);
    }

    #[test]
    fn test_terminal_transitions_set_finalized_at() {
        let now = Utc::now();

        let mut completed = processing(now);
        completed.complete(now).unwrap();
        assert_eq!(completed.finalized_at(), Some(now));
        assert!(completed.check().is_ok());

        let mut failed = processing(now);
        failed.fail(now).unwrap();
        assert_eq!(failed.status(), Status::Failed);
        assert!(failed.check().is_ok());

        assert!(failed.complete(now).is_err());
    }

    #[test]
    fn test_check_rejects_inconsistent_fields() {
        let now = Utc::now();

        let mut finalized_but_ready = Lifecycle::new(now, None).unwrap();
        finalized_but_ready.confirm(now, false).unwrap();
        finalized_but_ready.finalized_at = Some(now);
        assert!(finalized_but_ready.check().is_err());

        let mut completed_without_timestamp = processing(now);
        completed_without_timestamp.complete(now).unwrap();
        completed_without_timestamp.finalized_at = None;
        assert!(completed_without_timestamp.check().is_err());
    }

    #[test]
    fn test_columns_reject_unknown_status() {
        let now = Utc::now();
        let lifecycle = processing(now);

        let restored = Lifecycle::from_columns(lifecycle.to_columns()).unwrap();
        assert_eq!(restored, lifecycle);

        let mut columns = lifecycle.to_columns();
        columns.status = "sleeping".to_owned();
        assert!(Lifecycle::from_columns(columns).is_err());

        let mut columns = lifecycle.to_columns();
        columns.timeout_at = None;
        assert!(Lifecycle::from_columns(columns).is_err());
    }
}
