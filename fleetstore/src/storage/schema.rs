use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Event;
use kube::core::DynamicObject;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};

use crate::error::FleetResult;
use crate::resource::ResourceType;
use crate::storage::Backend;

/// The table holding one row per observed object.
pub const RESOURCES_TABLE: &str = "resources";

/// Creates the `resources` table and its indexes when they do not exist yet.
///
/// Statements are idempotent so repeated startup against an existing database is a
/// no-op. Schema evolution beyond this bootstrap is handled outside the library.
pub async fn auto_migrate(pool: &AnyPool, backend: Backend) -> FleetResult<()> {
    for statement in ddl_statements(backend) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

fn ddl_statements(backend: Backend) -> &'static [&'static str] {
    match backend {
        Backend::Sqlite => &[
            r#"CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                "group" TEXT NOT NULL,
                version TEXT NOT NULL,
                resource TEXT NOT NULL,
                kind TEXT NOT NULL,
                cluster TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                owner_uid TEXT NOT NULL DEFAULT '',
                uid TEXT NOT NULL,
                resource_version TEXT NOT NULL,
                object TEXT NOT NULL,
                events TEXT,
                event_resource_versions TEXT,
                created_at TEXT NOT NULL,
                synced_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TEXT
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uni_group_version_resource_cluster_namespace_name
                ON resources ("group", version, resource, cluster, namespace, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_group_version_resource_namespace_name
                ON resources ("group", version, resource, namespace, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_group_version_resource_name
                ON resources ("group", version, resource, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_cluster ON resources (cluster)"#,
        ],
        // MySQL caps composite key length, hence the column prefixes mirrored in every
        // secondary index; it also has no CREATE INDEX IF NOT EXISTS, so the indexes
        // live inside the table definition.
        Backend::Mysql => &[
            r#"CREATE TABLE IF NOT EXISTS resources (
                id BIGINT UNSIGNED AUTO_INCREMENT PRIMARY KEY,
                `group` VARCHAR(63) NOT NULL,
                version VARCHAR(15) NOT NULL,
                resource VARCHAR(63) NOT NULL,
                kind VARCHAR(63) NOT NULL,
                cluster VARCHAR(253) NOT NULL,
                namespace VARCHAR(253) NOT NULL,
                name VARCHAR(253) NOT NULL,
                owner_uid VARCHAR(36) NOT NULL DEFAULT '',
                uid VARCHAR(36) NOT NULL,
                resource_version VARCHAR(30) NOT NULL,
                object JSON NOT NULL,
                events JSON,
                event_resource_versions JSON,
                created_at DATETIME(6) NOT NULL,
                synced_at DATETIME(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6),
                deleted_at DATETIME(6),
                UNIQUE KEY uni_group_version_resource_cluster_namespace_name
                    (`group`, version, resource, cluster(100), namespace(50), name(100)),
                KEY idx_group_version_resource_namespace_name
                    (`group`, version, resource, namespace(50), name(100)),
                KEY idx_group_version_resource_name (`group`, version, resource, name(100)),
                KEY idx_cluster (cluster(100))
            )"#,
        ],
        Backend::Postgres => &[
            r#"CREATE TABLE IF NOT EXISTS resources (
                id BIGSERIAL PRIMARY KEY,
                "group" VARCHAR(63) NOT NULL,
                version VARCHAR(15) NOT NULL,
                resource VARCHAR(63) NOT NULL,
                kind VARCHAR(63) NOT NULL,
                cluster VARCHAR(253) NOT NULL,
                namespace VARCHAR(253) NOT NULL,
                name VARCHAR(253) NOT NULL,
                owner_uid VARCHAR(36) NOT NULL DEFAULT '',
                uid VARCHAR(36) NOT NULL,
                resource_version VARCHAR(30) NOT NULL,
                object JSONB NOT NULL,
                events JSONB,
                event_resource_versions JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                synced_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                deleted_at TIMESTAMPTZ
            )"#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS uni_group_version_resource_cluster_namespace_name
                ON resources ("group", version, resource, cluster, namespace, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_group_version_resource_namespace_name
                ON resources ("group", version, resource, namespace, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_group_version_resource_name
                ON resources ("group", version, resource, name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_cluster ON resources (cluster)"#,
        ],
    }
}

/// Which columns a list reads, decided from the list options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Projection {
    Full,
    FullWithEvents,
    Metadata,
    MetadataWithEvents,
}

impl Projection {
    pub(crate) fn from_options(only_metadata: bool, inject_events: bool) -> Self {
        match (only_metadata, inject_events) {
            (true, true) => Projection::MetadataWithEvents,
            (true, false) => Projection::Metadata,
            (false, true) => Projection::FullWithEvents,
            (false, false) => Projection::Full,
        }
    }

    /// The select list for this projection on the given backend.
    pub(crate) fn columns(&self, backend: Backend) -> String {
        let group = backend.quote_ident("group");
        let metadata = backend.metadata_expr();
        match self {
            Projection::Full => "object".to_string(),
            Projection::FullWithEvents => "object, events".to_string(),
            Projection::Metadata => {
                format!("{group}, version, resource, kind, {metadata} AS metadata")
            }
            Projection::MetadataWithEvents => {
                format!("{group}, version, resource, kind, {metadata} AS metadata, events")
            }
        }
    }

    /// Materializes one fetched row into the matching record variant.
    pub(crate) fn record_from_row(&self, row: &AnyRow) -> FleetResult<ResourceRecord> {
        Ok(match self {
            Projection::Full => ResourceRecord::Full {
                object: row.try_get("object")?,
            },
            Projection::FullWithEvents => ResourceRecord::FullWithEvents {
                object: row.try_get("object")?,
                events: row.try_get("events")?,
            },
            Projection::Metadata => ResourceRecord::Metadata {
                resource_type: resource_type_from_row(row)?,
                metadata: row.try_get("metadata")?,
            },
            Projection::MetadataWithEvents => ResourceRecord::MetadataWithEvents {
                resource_type: resource_type_from_row(row)?,
                metadata: row.try_get("metadata")?,
                events: row.try_get("events")?,
            },
        })
    }
}

fn resource_type_from_row(row: &AnyRow) -> FleetResult<ResourceType> {
    Ok(ResourceType {
        group: row.try_get("group")?,
        version: row.try_get("version")?,
        resource: row.try_get("resource")?,
        kind: row.try_get("kind")?,
    })
}

/// One fetched row, shaped by the projection it was read with.
///
/// Every variant can produce an API object; the `*WithEvents` variants can additionally
/// decode the row's event map.
#[derive(Debug, Clone)]
pub(crate) enum ResourceRecord {
    Full {
        object: String,
    },
    FullWithEvents {
        object: String,
        events: Option<String>,
    },
    Metadata {
        resource_type: ResourceType,
        metadata: String,
    },
    MetadataWithEvents {
        resource_type: ResourceType,
        metadata: String,
        events: Option<String>,
    },
}

impl ResourceRecord {
    /// Rebuilds the API object this row describes.
    ///
    /// Metadata-only rows come back with apiVersion/kind restored from the row columns
    /// and nothing but metadata populated.
    pub(crate) fn to_object(&self) -> FleetResult<DynamicObject> {
        match self {
            ResourceRecord::Full { object } | ResourceRecord::FullWithEvents { object, .. } => {
                Ok(serde_json::from_str(object)?)
            }
            ResourceRecord::Metadata {
                resource_type,
                metadata,
            }
            | ResourceRecord::MetadataWithEvents {
                resource_type,
                metadata,
                ..
            } => {
                let metadata: serde_json::Value = serde_json::from_str(metadata)?;
                let value = serde_json::json!({
                    "apiVersion": resource_type.api_version(),
                    "kind": resource_type.kind,
                    "metadata": metadata,
                });
                Ok(serde_json::from_value(value)?)
            }
        }
    }

    /// Decodes the row's event map. Rows without events yield an empty list.
    pub(crate) fn decode_events(&self) -> FleetResult<Vec<Event>> {
        match self {
            ResourceRecord::FullWithEvents {
                events: Some(raw), ..
            }
            | ResourceRecord::MetadataWithEvents {
                events: Some(raw), ..
            } => decode_event_map(raw),
            _ => Ok(Vec::new()),
        }
    }

}

/// Decodes the stored event map (event UID → encoded event) into a list.
///
/// Map iteration dictates the order, so callers must not rely on any particular one.
pub(crate) fn decode_event_map(raw: &str) -> FleetResult<Vec<Event>> {
    let map: BTreeMap<String, Event> = serde_json::from_str(raw)?;
    Ok(map.into_values().collect())
}
