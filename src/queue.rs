//! Queue names and per-queue delivery policy.
//!
//! Queue (and task kind) names are dot-namespaced segments, optionally suffixed
//! with `:dl` to mark a dead-letter queue: `billing.invoices`, `billing.invoices:dl`.

use std::{collections::HashMap, path::Path, time::Duration};

use pom::utf8::{end, is_a, seq, sym, Parser};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::Error,
    utils::{interpolate_env, parse_duration},
};

pub const DEAD_LETTER_SUFFIX: &str = ":dl";

pub const MAX_QUEUE_NAME_LEN: usize = 200;

pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub const MIN_PROCESSING_TIMEOUT: Duration = Duration::from_secs(1);

pub const DEFAULT_BACKOFF_SHAPE: [Duration; 4] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
];

fn segment<'a>() -> Parser<'a, Vec<char>> {
    is_a(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-').repeat(1..)
}

fn queue_name<'a>() -> Parser<'a, (&'a str, bool)> {
    let base = (segment() + (sym('.') * segment()).repeat(0..)).collect();
    let dead_letter = seq(DEAD_LETTER_SUFFIX).opt().map(|suffix| suffix.is_some());

    base + dead_letter - end()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn parse(input: &str) -> Result<Self, Error> {
        if input.len() > MAX_QUEUE_NAME_LEN {
            return Err(Error::invalid_parameter(format!(
                "queue name is longer than {MAX_QUEUE_NAME_LEN} characters"
            )));
        }

        queue_name()
            .parse_str(input)
            .map_err(|e| Error::invalid_parameter(format!("invalid queue name '{input}': {e}")))?;

        Ok(Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dead_letter(&self) -> bool {
        self.0.ends_with(DEAD_LETTER_SUFFIX)
    }

    /// Name without the dead-letter suffix.
    pub fn base(&self) -> &str {
        self.0.strip_suffix(DEAD_LETTER_SUFFIX).unwrap_or(&self.0)
    }

    /// The dead-letter queue paired with this queue.
    pub fn dead_letter(&self) -> QueueName {
        Self(format!("{}{DEAD_LETTER_SUFFIX}", self.base()))
    }
}

impl TryFrom<String> for QueueName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Retry delays indexed by retry count; the last entry repeats.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub shape: Vec<Duration>,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            shape: DEFAULT_BACKOFF_SHAPE.to_vec(),
            max_attempts: None,
        }
    }
}

impl BackoffConfig {
    pub fn new(shape: Vec<Duration>) -> Self {
        Self {
            shape,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// `None` means every nack exhausts immediately.
    pub backoff: Option<BackoffConfig>,
    pub processing_timeout: Duration,
    pub dead_letter: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: Some(BackoffConfig::default()),
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            dead_letter: false,
        }
    }
}

impl QueueConfig {
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn without_backoff(mut self) -> Self {
        self.backoff = None;
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.processing_timeout < MIN_PROCESSING_TIMEOUT {
            return Err(Error::invalid_parameter(
                "processing_timeout must be at least 1s",
            ));
        }

        if let Some(backoff) = &self.backoff {
            if backoff.shape.is_empty() {
                return Err(Error::invalid_parameter("backoff shape must not be empty"));
            }
        }

        Ok(())
    }
}

/// A config value that distinguishes "not mentioned" from "explicitly disabled".
///
/// Missing keys deserialize (with `#[serde(default)]`) to `Unset`, `null` to
/// `Disabled`, anything else to `Value`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Setting<T> {
    #[default]
    Unset,
    Disabled,
    Value(T),
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Setting<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(value) => Setting::Value(value),
            None => Setting::Disabled,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackoffFile {
    shape: Vec<String>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueueConfigFile {
    processing_timeout: Option<String>,
    dead_letter: Option<bool>,
    #[serde(default)]
    backoff: Setting<BackoffFile>,
}

impl QueueConfigFile {
    /// Fills anything this entry leaves unset from `base`.
    fn resolve(self, base: &QueueConfig) -> Result<QueueConfig, Error> {
        let backoff = match self.backoff {
            Setting::Unset => base.backoff.clone(),
            Setting::Disabled => None,
            Setting::Value(file) => Some(BackoffConfig {
                shape: file
                    .shape
                    .iter()
                    .map(|d| parse_duration(d))
                    .collect::<Result<_, _>>()?,
                max_attempts: file.max_attempts,
            }),
        };

        let processing_timeout = match self.processing_timeout {
            Some(timeout) => parse_duration(&timeout)?,
            None => base.processing_timeout,
        };

        let config = QueueConfig {
            backoff,
            processing_timeout,
            dead_letter: self.dead_letter.unwrap_or(base.dead_letter),
        };

        config.validate()?;

        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct QueuesFile {
    #[serde(default)]
    strict: bool,
    default: Option<QueueConfigFile>,
    #[serde(default)]
    queues: HashMap<String, QueueConfigFile>,
}

/// Per-queue policies plus the fallback applied to queues without an entry.
#[derive(Debug, Clone, Default)]
pub struct QueueRegistry {
    default: QueueConfig,
    queues: HashMap<String, QueueConfig>,
    strict: bool,
}

impl QueueRegistry {
    pub fn new(default: QueueConfig) -> Self {
        Self {
            default,
            queues: HashMap::new(),
            strict: false,
        }
    }

    pub fn with_queue(mut self, name: impl Into<String>, config: QueueConfig) -> Self {
        self.queues.insert(name.into(), config);
        self
    }

    /// Unknown queues are rejected instead of falling back to the default policy.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Dead-letter queues without their own entry share the policy of their source queue.
    pub fn get(&self, queue: &QueueName) -> Result<&QueueConfig, Error> {
        let known =
            self.queues.contains_key(queue.as_str()) || self.queues.contains_key(queue.base());

        if self.strict && !known {
            return Err(Error::queue_not_found(queue));
        }

        Ok(self.policy_for(queue))
    }

    /// Like [`QueueRegistry::get`], but never rejects. Used for items already stored,
    /// which keep being processed even if their queue was since removed from a strict file.
    pub fn policy_for(&self, queue: &QueueName) -> &QueueConfig {
        self.queues
            .get(queue.as_str())
            .or_else(|| self.queues.get(queue.base()))
            .unwrap_or(&self.default)
    }

    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let file: QueuesFile = serde_yaml::from_str(text)
            .map_err(|e| Error::invalid_parameter(format!("invalid queues file: {e}")))?;

        let default = match file.default {
            Some(default) => default.resolve(&QueueConfig::default())?,
            None => QueueConfig::default(),
        };

        let mut queues = HashMap::with_capacity(file.queues.len());
        for (name, entry) in file.queues {
            QueueName::parse(&name)?;
            queues.insert(name, entry.resolve(&default)?);
        }

        Ok(Self {
            default,
            queues,
            strict: file.strict,
        })
    }

    /// Reads a YAML policy file, expanding `${VAR}` / `${VAR:-default}` first.
    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let text = interpolate_env(&raw)?;
        Ok(Self::from_yaml(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_queue_name_valid() {
        let cases = vec![
            ("emails", false),
            ("billing.invoices", false),
            ("billing.invoices:dl", true),
            ("a-b_c.d1", false),
        ];

        for (input, dead_letter) in cases {
            let name = QueueName::parse(input)
                .unwrap_or_else(|e| panic!("Failed to parse valid queue name: {input} ({e})"));
            assert_eq!(name.is_dead_letter(), dead_letter, "input: {input}");
        }
    }

    #[test]
    fn test_parse_queue_name_invalid() {
        let invalid_inputs = vec![
            "",
            ".emails",
            "emails.",
            "billing..invoices",
            "emails:dl:dl",
            "emails:other",
            "with space",
        ];

        for input in invalid_inputs {
            assert!(
                QueueName::parse(input).is_err(),
                "Expected error for invalid input: {input}"
            );
        }

        assert!(QueueName::parse(&"a".repeat(MAX_QUEUE_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_dead_letter_name() {
        let queue = QueueName::parse("billing.invoices").unwrap();
        assert_eq!(queue.dead_letter().as_str(), "billing.invoices:dl");
        assert_eq!(queue.dead_letter().dead_letter().as_str(), "billing.invoices:dl");
        assert_eq!(queue.dead_letter().base(), "billing.invoices");
    }

    #[test]
    fn test_registry_from_yaml() {
        let registry = QueueRegistry::from_yaml(
            r#"
default:
  processing_timeout: 2m
queues:
  orders:
    dead_letter: true
    backoff:
      shape: [1m, 2m, 5m]
      max_attempts: 3
  emails:
    backoff: null
"#,
        )
        .unwrap();

        let orders = registry.get(&QueueName::parse("orders").unwrap()).unwrap();
        assert!(orders.dead_letter);
        assert_eq!(orders.processing_timeout, Duration::from_secs(120));
        assert_eq!(
            orders.backoff,
            Some(
                BackoffConfig::new(vec![
                    Duration::from_secs(60),
                    Duration::from_secs(120),
                    Duration::from_secs(300),
                ])
                .with_max_attempts(3)
            )
        );

        let emails = registry.get(&QueueName::parse("emails").unwrap()).unwrap();
        assert_eq!(emails.backoff, None);

        let other = registry.get(&QueueName::parse("other").unwrap()).unwrap();
        assert_eq!(other.backoff, Some(BackoffConfig::default()));
        assert_eq!(other.processing_timeout, Duration::from_secs(120));

        let orders_dl = registry
            .get(&QueueName::parse("orders:dl").unwrap())
            .unwrap();
        assert_eq!(orders_dl, orders);
    }

    #[test]
    fn test_registry_rejects_short_timeout() {
        let result = QueueRegistry::from_yaml(
            r#"
queues:
  fast:
    processing_timeout: 500ms
"#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_strict_registry_rejects_unknown_queue() {
        let registry = QueueRegistry::from_yaml("strict: true\nqueues:\n  known: {}\n").unwrap();

        assert!(registry.get(&QueueName::parse("known").unwrap()).is_ok());
        assert!(matches!(
            registry.get(&QueueName::parse("unknown").unwrap()),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_load_interpolates_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queues.yaml");
        std::fs::write(
            &path,
            "queues:\n  reports:\n    processing_timeout: ${RELAYMQ_TEST_REPORTS_TIMEOUT:-45s}\n",
        )
        .unwrap();

        let registry = QueueRegistry::load(&path).unwrap();
        let reports = registry
            .get(&QueueName::parse("reports").unwrap())
            .unwrap();

        assert_eq!(reports.processing_timeout, Duration::from_secs(45));
    }
}
