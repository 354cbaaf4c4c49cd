use actix_web::{http::StatusCode, HttpResponse};
use chrono::{DateTime, Utc};
use snafu::Snafu;
use uuid::Uuid;

use crate::{api::Envelope, lifecycle::Status};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Cannot {action} {entity} {id} in status {status}"))]
    IllegalTransition {
        entity: &'static str,
        id: Uuid,
        status: Status,
        action: &'static str,
    },

    #[snafu(display("{entity} {id} is delayed until {until}"))]
    NotReady {
        entity: &'static str,
        id: Uuid,
        until: DateTime<Utc>,
    },

    #[snafu(display("{entity} {id} was modified concurrently (read version {version})"))]
    StaleVersion {
        entity: &'static str,
        id: Uuid,
        version: i64,
    },

    #[snafu(display("Batch size {requested} exceeds the limit of {limit}"))]
    BatchSizeExceeded { requested: usize, limit: usize },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Missing parameter: {message}"))]
    MissingParameter { message: String },

    #[snafu(display("Stored {entity} {id} is inconsistent: {message}"))]
    Corrupted {
        entity: &'static str,
        id: Uuid,
        message: String,
    },

    #[snafu(display("Sweep aborted after {completed} items: {source}"))]
    SweepAborted {
        completed: usize,
        #[snafu(source)]
        source: Box<Error>,
    },

    #[snafu(display("Internal server error"))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::InternalServerError {
            source: Some(e.into()),
        }
    }

    pub fn opaque() -> Self {
        Self::InternalServerError { source: None }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn missing_parameter(message: impl Into<String>) -> Self {
        Self::MissingParameter {
            message: message.into(),
        }
    }

    pub fn task_not_found(id: Uuid) -> Self {
        Self::NotFound {
            resource: format!("task {id}"),
        }
    }

    pub fn message_not_found(id: Uuid) -> Self {
        Self::NotFound {
            resource: format!("message {id}"),
        }
    }

    pub fn queue_not_found(queue: impl AsRef<str>) -> Self {
        Self::NotFound {
            resource: format!("queue {}", queue.as_ref()),
        }
    }

    pub fn corrupted(entity: &'static str, id: Uuid, message: impl Into<String>) -> Self {
        Self::Corrupted {
            entity,
            id,
            message: message.into(),
        }
    }

    /// Stable, machine-readable identifier returned alongside every failed response.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::NotReady { .. } => "not_ready",
            Self::StaleVersion { .. } => "stale_version",
            Self::BatchSizeExceeded { .. } => "batch_size_exceeded",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::MissingParameter { .. } => "missing_parameter",
            Self::SweepAborted { source, .. } => source.code(),
            Self::Corrupted { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::MigrationError { .. } => "internal",
        }
    }

    /// Domain and validation failures are the caller's fault and are never retried.
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } => StatusCode::NOT_FOUND,

            Self::IllegalTransition { .. } | Self::NotReady { .. } | Self::StaleVersion { .. } => {
                StatusCode::CONFLICT
            }

            Self::BatchSizeExceeded { .. }
            | Self::InvalidParameter { .. }
            | Self::MissingParameter { .. } => StatusCode::BAD_REQUEST,

            Self::SweepAborted { source, .. } => source.status_code(),

            Self::Corrupted { .. }
            | Self::InternalServerError { .. }
            | Self::Sqlx { .. }
            | Self::MigrationError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl actix_web::ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        Error::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = Error::status_code(self);

        let message = if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed");
            "Internal server error".to_owned()
        } else {
            self.to_string()
        };

        HttpResponse::build(status).json(Envelope::<()>::failure(message, self.code()))
    }
}
