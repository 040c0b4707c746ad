use std::error;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;

/// Convenient result type for fleetstore operations using [`FleetError`] as the error type.
pub type FleetResult<T> = Result<T, FleetError>;

/// Main error type for fleetstore operations.
///
/// [`FleetError`] carries a classification kind, a static description and an optional
/// dynamic detail. The kind drives the retry decisions of the sync loop, so callers
/// should prefer the `is_*` predicates over matching on kinds directly.
#[derive(Debug, Clone)]
pub struct FleetError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
}

/// Specific categories of errors that can occur while syncing or querying resources.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // Domain errors surfaced to storage callers.
    NotFound,
    AlreadyExists,
    Conflict,

    // Resource version freshness signals.
    Expired,
    TooLargeResourceVersion,

    // Transient transport conditions.
    Throttled,
    ConnectionRefused,
    InternalError,

    // Sync loop lifecycle.
    StopRequested,
    VeryShortWatch,

    // Storage & configuration.
    MethodNotSupported,
    ConfigError,
    ValidationError,
    QueryFailed,

    // IO & serialization.
    IoError,
    SerializationError,
    DeserializationError,

    Unknown,
}

impl FleetError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => kind,
        }
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, ref detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// True when the request's resource version is no longer served by the source.
    pub fn is_expired(&self) -> bool {
        self.kind() == ErrorKind::Expired
    }

    /// True when the requested resource version is newer than anything the source has.
    pub fn is_too_large_resource_version(&self) -> bool {
        self.kind() == ErrorKind::TooLargeResourceVersion
    }

    /// True for HTTP 429 style rejections.
    pub fn is_throttled(&self) -> bool {
        self.kind() == ErrorKind::Throttled
    }

    pub fn is_connection_refused(&self) -> bool {
        self.kind() == ErrorKind::ConnectionRefused
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::InternalError
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }

    pub fn is_stop_requested(&self) -> bool {
        self.kind() == ErrorKind::StopRequested
    }

    /// Classifies the status payload carried by a watch error event.
    ///
    /// The mapping follows the source API conventions: 410 means the resource version
    /// expired, a `ResourceVersionTooLarge` cause means the client asked for the future,
    /// 429 means throttled and 500 is an internal server error.
    pub fn from_status(status: &Status) -> FleetError {
        let message = status.message.clone().unwrap_or_default();

        if let Some(details) = &status.details {
            let too_large = details.causes.iter().flatten().any(|cause| {
                cause.reason.as_deref() == Some("ResourceVersionTooLarge")
                    || cause.message.as_deref() == Some("Too large resource version")
            });
            if too_large {
                return FleetError::from((
                    ErrorKind::TooLargeResourceVersion,
                    "requested resource version is too large",
                    message,
                ));
            }
        }

        match status.reason.as_deref() {
            Some("Expired") | Some("Gone") => {
                return FleetError::from((
                    ErrorKind::Expired,
                    "resource version is expired",
                    message,
                ));
            }
            Some("TooManyRequests") => {
                return FleetError::from((ErrorKind::Throttled, "request was throttled", message));
            }
            _ => {}
        }

        match status.code {
            Some(410) => FleetError::from((ErrorKind::Expired, "resource version is expired", message)),
            Some(429) => FleetError::from((ErrorKind::Throttled, "request was throttled", message)),
            Some(404) => FleetError::from((ErrorKind::NotFound, "resource not found", message)),
            Some(409) => FleetError::from((ErrorKind::Conflict, "conflicting write", message)),
            Some(500) => FleetError::from((ErrorKind::InternalError, "internal server error", message)),
            _ => FleetError::from((ErrorKind::Unknown, "watch stream returned an error status", message)),
        }
    }
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, ref detail) => {
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                desc.fmt(f)?;
                f.write_str(" -> ")?;
                detail.fmt(f)
            }
        }
    }
}

impl error::Error for FleetError {}

impl PartialEq for FleetError {
    fn eq(&self, other: &FleetError) -> bool {
        self.kind() == other.kind()
    }
}

/// Creates a [`FleetError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for FleetError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> FleetError {
        FleetError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

/// Creates a [`FleetError`] from an error kind, static description, and dynamic detail.
impl From<(ErrorKind, &'static str, String)> for FleetError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> FleetError {
        FleetError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail),
        }
    }
}

/// Converts [`sqlx::Error`] to [`FleetError`].
///
/// Unique constraint violations map to [`ErrorKind::AlreadyExists`] and missing rows to
/// [`ErrorKind::NotFound`] so the storage layer can surface them as domain errors.
impl From<sqlx::Error> for FleetError {
    fn from(err: sqlx::Error) -> FleetError {
        let kind = match &err {
            sqlx::Error::RowNotFound => ErrorKind::NotFound,
            sqlx::Error::Database(db) if db.is_unique_violation() => ErrorKind::AlreadyExists,
            sqlx::Error::Io(_) => ErrorKind::IoError,
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => ErrorKind::ConnectionRefused,
            sqlx::Error::Configuration(_) => ErrorKind::ConfigError,
            _ => ErrorKind::QueryFailed,
        };

        FleetError {
            repr: ErrorRepr::WithDescriptionAndDetail(
                kind,
                "database operation failed",
                err.to_string(),
            ),
        }
    }
}

/// Converts [`serde_json::Error`] to [`FleetError`] with the appropriate codec kind.
impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> FleetError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            _ => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };

        FleetError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, err.to_string()),
        }
    }
}
