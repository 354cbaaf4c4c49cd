//! Nack and backoff decisions.
//!
//! Two strategies share the [`BackoffStrategy`] interface: [`ShapeBackoff`] reads the
//! queue's configured delay table, [`LadderBackoff`] applies fixed retry bands and is
//! used for failures the system observes on the consumer's behalf.

use std::time::Duration;

use crate::queue::{QueueConfig, DEFAULT_BACKOFF_SHAPE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    Delay(Duration),
    Drop,
    DeadLetter,
}

/// Who asked for the item to be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// An explicit nack from a consumer.
    Client,
    /// A processing timeout or an error report.
    System,
}

pub trait BackoffStrategy: Send + Sync {
    fn decide(&self, retries: u32, config: &QueueConfig, redeliver: bool) -> NackAction;
}

fn exhausted(config: &QueueConfig) -> NackAction {
    if config.dead_letter {
        NackAction::DeadLetter
    } else {
        NackAction::Drop
    }
}

/// Looks the delay up in the queue's backoff shape, clamping at the last entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShapeBackoff;

impl BackoffStrategy for ShapeBackoff {
    fn decide(&self, retries: u32, config: &QueueConfig, redeliver: bool) -> NackAction {
        let Some(backoff) = config.backoff.as_ref().filter(|_| redeliver) else {
            return exhausted(config);
        };

        if backoff.max_attempts.is_some_and(|max| retries >= max) {
            return exhausted(config);
        }

        let shape: &[Duration] = if backoff.shape.is_empty() {
            &DEFAULT_BACKOFF_SHAPE
        } else {
            &backoff.shape
        };

        let index = (retries as usize).min(shape.len() - 1);

        NackAction::Delay(shape[index])
    }
}

pub const LADDER_MAX_RETRIES: u32 = 10;

/// Fixed retry bands with a hard ceiling of [`LADDER_MAX_RETRIES`].
#[derive(Debug, Default, Clone, Copy)]
pub struct LadderBackoff;

impl LadderBackoff {
    fn band(retries: u32) -> Duration {
        match retries {
            0..5 => Duration::from_secs(2 * 60),
            5..10 => Duration::from_secs(10 * 60),
            10..50 => Duration::from_secs(30 * 60),
            _ => Duration::from_secs(3 * 60 * 60),
        }
    }
}

impl BackoffStrategy for LadderBackoff {
    fn decide(&self, retries: u32, config: &QueueConfig, _redeliver: bool) -> NackAction {
        if retries >= LADDER_MAX_RETRIES {
            return exhausted(config);
        }

        NackAction::Delay(Self::band(retries))
    }
}

pub fn select(origin: Origin) -> &'static dyn BackoffStrategy {
    match origin {
        Origin::Client => &ShapeBackoff,
        Origin::System => &LadderBackoff,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::BackoffConfig;

    const MINUTE: Duration = Duration::from_secs(60);

    fn shaped() -> QueueConfig {
        QueueConfig::default().with_backoff(BackoffConfig::new(vec![
            MINUTE,
            2 * MINUTE,
            5 * MINUTE,
        ]))
    }

    #[test]
    fn test_shape_is_clamped_to_last_entry() {
        let config = shaped();

        let cases = vec![(0, MINUTE), (1, 2 * MINUTE), (2, 5 * MINUTE), (5, 5 * MINUTE)];

        for (retries, expected) in cases {
            assert_eq!(
                ShapeBackoff.decide(retries, &config, true),
                NackAction::Delay(expected),
                "retries: {retries}"
            );
        }
    }

    #[test]
    fn test_max_attempts_exhausts() {
        let config = QueueConfig::default()
            .with_backoff(BackoffConfig::new(vec![MINUTE, 2 * MINUTE, 5 * MINUTE]).with_max_attempts(3));

        assert_eq!(ShapeBackoff.decide(2, &config, true), NackAction::Delay(5 * MINUTE));
        assert_eq!(ShapeBackoff.decide(3, &config, true), NackAction::Drop);

        let config = config.with_dead_letter(true);
        assert_eq!(ShapeBackoff.decide(3, &config, true), NackAction::DeadLetter);
    }

    #[test]
    fn test_no_redelivery_or_disabled_backoff_exhausts() {
        let config = shaped();
        assert_eq!(ShapeBackoff.decide(0, &config, false), NackAction::Drop);

        let disabled = QueueConfig::default().without_backoff().with_dead_letter(true);
        assert_eq!(ShapeBackoff.decide(0, &disabled, true), NackAction::DeadLetter);
    }

    #[test]
    fn test_default_shape_applies() {
        let config = QueueConfig::default();

        assert_eq!(ShapeBackoff.decide(0, &config, true), NackAction::Delay(MINUTE));
        assert_eq!(
            ShapeBackoff.decide(100, &config, true),
            NackAction::Delay(60 * MINUTE)
        );
    }

    #[test]
    fn test_ladder_bands() {
        let config = QueueConfig::default();

        assert_eq!(LadderBackoff.decide(0, &config, false), NackAction::Delay(2 * MINUTE));
        assert_eq!(LadderBackoff.decide(4, &config, false), NackAction::Delay(2 * MINUTE));
        assert_eq!(LadderBackoff.decide(5, &config, false), NackAction::Delay(10 * MINUTE));
        assert_eq!(LadderBackoff.decide(9, &config, false), NackAction::Delay(10 * MINUTE));
        assert_eq!(LadderBackoff.decide(10, &config, false), NackAction::Drop);
        assert_eq!(
            LadderBackoff.decide(10, &config.with_dead_letter(true), false),
            NackAction::DeadLetter
        );

        assert_eq!(LadderBackoff::band(20), 30 * MINUTE);
        assert_eq!(LadderBackoff::band(50), 180 * MINUTE);
    }

    #[test]
    fn test_select_by_origin() {
        let config = shaped();

        assert_eq!(
            select(Origin::Client).decide(1, &config, true),
            NackAction::Delay(2 * MINUTE)
        );
        assert_eq!(
            select(Origin::System).decide(1, &config, false),
            NackAction::Delay(2 * MINUTE)
        );
        assert_eq!(select(Origin::Client).decide(1, &config, false), NackAction::Drop);
    }
}
