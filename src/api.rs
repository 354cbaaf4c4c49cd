use std::time::Duration;

use actix_web::web::{self, JsonConfig, QueryConfig};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub mod message;
pub mod system;
pub mod task;
pub mod work;

/// `{success, result, error}` body shared by most endpoints. Failures add `code`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T> Envelope<T> {
    pub fn success(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn failure(message: String, code: &'static str) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message),
            code: Some(code),
        }
    }
}

/// `{"ok": true}`, returned by the batch message endpoints.
#[derive(Debug, Serialize)]
pub struct Acknowledged {
    ok: bool,
}

impl Acknowledged {
    pub fn new() -> Self {
        Self { ok: true }
    }
}

impl Default for Acknowledged {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct Created {
    pub id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Uuid,
}

/// Opaque payload as sent over JSON.
///
/// A JSON string is stored as its raw text; any other value is stored as its
/// serialized JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePayload(pub Bytes);

impl<'de> Deserialize<'de> for WirePayload {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(text) => Bytes::from(text),
            other => Bytes::from(other.to_string()),
        };

        Ok(Self(bytes))
    }
}

impl From<WirePayload> for Bytes {
    fn from(payload: WirePayload) -> Self {
        payload.0
    }
}

/// Converts the `poll` parameter, given in seconds and capped at `max`.
pub(crate) fn poll_duration(poll: Option<f64>, max: Duration) -> Result<Duration, Error> {
    let Some(secs) = poll else {
        return Ok(Duration::ZERO);
    };

    let poll = Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::invalid_parameter("poll must be a non-negative number of seconds"))?;

    if poll > max {
        return Err(Error::invalid_parameter(format!(
            "poll must not exceed {} seconds",
            max.as_secs_f64()
        )));
    }

    Ok(poll)
}

/// Splits a comma separated query value, dropping empty items.
pub(crate) fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Malformed bodies and query strings are reported with the error envelope.
pub fn json_config() -> JsonConfig {
    JsonConfig::default()
        .content_type_required(false)
        .error_handler(|err, _| Error::invalid_parameter(err.to_string()).into())
}

pub fn query_config() -> QueryConfig {
    QueryConfig::default()
        .error_handler(|err, _| Error::invalid_parameter(err.to_string()).into())
}

/// Registers every route and the extractor configuration on an app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config())
        .app_data(query_config())
        .service(task::service())
        .service(work::service())
        .service(message::service())
        .service(message::batch_service())
        .service(system::health)
        .service(system::openapi_yaml)
        .service(system::openapi_json);
}
