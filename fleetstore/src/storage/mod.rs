//! The relational projection of cluster resources.
//!
//! Every observed object of a (group, version, resource) lands as one row in the
//! `resources` table, keyed by (group, version, resource, cluster, namespace, name).
//! [`resource_storage::ResourceStorage`] performs the row operations, [`query`]
//! compiles cross-cluster list options into SQL, and [`metrics`] samples the pool.

pub mod metrics;
pub mod query;
pub mod resource_storage;
pub mod schema;

use std::sync::Once;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

use crate::config::StorageConfig;
use crate::error::{ErrorKind, FleetResult};
use crate::fleet_error;

static INSTALL_DRIVERS: Once = Once::new();

/// The SQL engine behind a storage instance.
///
/// JSON path extraction, identifier quoting and a few casts differ between engines, so
/// every query assembly site carries this discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Mysql,
    Postgres,
}

impl Backend {
    /// Derives the backend from a DSN scheme. Anything but SQLite, MySQL or PostgreSQL
    /// is a configuration error.
    pub fn from_dsn(dsn: &str) -> FleetResult<Backend> {
        let scheme = dsn.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Backend::Sqlite),
            "mysql" | "mariadb" => Ok(Backend::Mysql),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            other => Err(fleet_error!(
                ErrorKind::ConfigError,
                "only sqlite, mysql and postgres are supported",
                other
            )),
        }
    }

    /// Quotes a column or table identifier.
    pub(crate) fn quote_ident(&self, ident: &str) -> String {
        match self {
            Backend::Mysql => format!("`{ident}`"),
            Backend::Sqlite | Backend::Postgres => format!("\"{ident}\""),
        }
    }

    /// The projection expression extracting the object's metadata document as text.
    pub(crate) fn metadata_expr(&self) -> &'static str {
        match self {
            Backend::Sqlite | Backend::Mysql => "object->>'$.metadata'",
            Backend::Postgres => "object->>'metadata'",
        }
    }

    /// Expression extracting a JSON field of `column` at `segments` as text.
    ///
    /// Segments must have been validated with [`validate_json_key`].
    pub(crate) fn json_field_expr(&self, column: &str, segments: &[&str]) -> String {
        match self {
            Backend::Sqlite | Backend::Mysql => {
                let path: Vec<String> = segments.iter().map(|s| format!("\"{s}\"")).collect();
                format!("{column}->>'$.{}'", path.join("."))
            }
            Backend::Postgres => {
                format!("{column} #>> '{{{}}}'", segments.join(","))
            }
        }
    }

    /// Cast suffix turning a bound text parameter into the engine's JSON type.
    pub(crate) fn json_param_cast(&self) -> &'static str {
        match self {
            Backend::Postgres => "::jsonb",
            Backend::Sqlite | Backend::Mysql => "",
        }
    }

    /// Cast suffix turning a bound text parameter into the engine's timestamp type.
    pub(crate) fn timestamp_param_cast(&self) -> &'static str {
        match self {
            Backend::Postgres => "::timestamptz",
            Backend::Sqlite | Backend::Mysql => "",
        }
    }

    /// The expression producing the current timestamp at the engine's full precision.
    pub(crate) fn now_expr(&self) -> &'static str {
        match self {
            Backend::Mysql => "CURRENT_TIMESTAMP(6)",
            Backend::Sqlite | Backend::Postgres => "CURRENT_TIMESTAMP",
        }
    }

    /// Renders a timestamp the way the engine parses text timestamps.
    pub(crate) fn format_timestamp(&self, ts: &DateTime<Utc>) -> String {
        match self {
            // MySQL DATETIME does not accept the RFC 3339 `T` separator or offsets.
            Backend::Mysql => ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            Backend::Sqlite | Backend::Postgres => ts.to_rfc3339(),
        }
    }
}

/// Validates a key that will be spliced into a JSON path expression.
///
/// Bound parameters cannot reach into path positions on every engine, so the keys
/// themselves are restricted to label/field charset instead.
pub(crate) fn validate_json_key(key: &str) -> FleetResult<()> {
    if key.is_empty() {
        return Err(fleet_error!(
            ErrorKind::ValidationError,
            "selector key must not be empty"
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
    {
        return Err(fleet_error!(
            ErrorKind::ValidationError,
            "selector key contains unsupported characters",
            key
        ));
    }
    Ok(())
}

/// Opens the connection pool described by `config` and reports the backend in use.
pub async fn connect(config: &StorageConfig) -> FleetResult<(AnyPool, Backend)> {
    let backend = Backend::from_dsn(&config.dsn)?;
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

    let mut options = AnyPoolOptions::new()
        .max_connections(config.max_open_connections)
        .min_connections(config.min_idle_connections);
    if config.conn_max_lifetime_secs > 0 {
        options = options.max_lifetime(Duration::from_secs(config.conn_max_lifetime_secs));
    }

    let pool = options.connect(&config.dsn).await?;
    Ok((pool, backend))
}
