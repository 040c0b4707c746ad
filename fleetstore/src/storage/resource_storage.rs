use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use serde::de::DeserializeOwned;
use sqlx::{Any, AnyPool, QueryBuilder, Row};
use tracing::{debug, warn};

use crate::error::{ErrorKind, FleetError, FleetResult};
use crate::informer::lister_watcher::WatchStream;
use crate::resource::{
    controller_owner_uid, event_natural_key, ObjectKey, ResourceType, EVENTS_ANNOTATION,
};
use crate::storage::query::{self, ListOptions};
use crate::storage::schema::{decode_event_map, Projection};
use crate::storage::Backend;
use crate::{bail, fleet_error};

/// The result of a cross-cluster list: materialized objects plus paging metadata.
#[derive(Debug, Default)]
pub struct ResourceList {
    pub items: Vec<DynamicObject>,
    /// Set when paging was requested and the page came back full.
    pub continue_token: Option<String>,
    /// Items left after this page; negative when the caller paged past the end.
    pub remaining_item_count: Option<i64>,
}

/// Row operations for one (group, version, resource) across all clusters.
///
/// Instances are cheap to clone and safe to share; every operation is a single
/// statement against the pool, so per-row updates are atomic without explicit
/// transactions.
#[derive(Debug, Clone)]
pub struct ResourceStorage {
    pool: AnyPool,
    backend: Backend,
    resource_type: ResourceType,
}

impl ResourceStorage {
    pub fn new(pool: AnyPool, backend: Backend, resource_type: ResourceType) -> Self {
        Self {
            pool,
            backend,
            resource_type,
        }
    }

    /// The resource coordinate this storage is bound to.
    pub fn storage_resource(&self) -> &ResourceType {
        &self.resource_type
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Inserts the row for a newly observed object.
    pub async fn create(&self, cluster: &str, obj: &DynamicObject) -> FleetResult<()> {
        let kind = obj
            .types
            .as_ref()
            .map(|types| types.kind.as_str())
            .unwrap_or_default();
        if kind.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "kind is required",
                self.resource_type
            );
        }

        let meta = &obj.metadata;
        let name = meta.name.clone().unwrap_or_default();
        let object_json = serde_json::to_string(obj)?;
        let created_at = self.backend.format_timestamp(&creation_timestamp(meta));
        let deleted_at = meta
            .deletion_timestamp
            .as_ref()
            .map(|ts| self.backend.format_timestamp(&ts.0));

        let mut qb = QueryBuilder::<Any>::new("INSERT INTO resources (");
        qb.push(format!(
            "{}, version, resource, kind, cluster, namespace, name, owner_uid, uid, \
             resource_version, object, created_at, deleted_at) VALUES (",
            self.backend.quote_ident("group")
        ));
        {
            let mut separated = qb.separated(", ");
            separated.push_bind(self.resource_type.group.clone());
            separated.push_bind(self.resource_type.version.clone());
            separated.push_bind(self.resource_type.resource.clone());
            separated.push_bind(kind.to_string());
            separated.push_bind(cluster.to_string());
            separated.push_bind(meta.namespace.clone().unwrap_or_default());
            separated.push_bind(name.clone());
            separated.push_bind(controller_owner_uid(meta));
            separated.push_bind(meta.uid.clone().unwrap_or_default());
            separated.push_bind(meta.resource_version.clone().unwrap_or_default());
        }
        qb.push(", ");
        qb.push_bind(object_json);
        qb.push(self.backend.json_param_cast());
        qb.push(", ");
        qb.push_bind(created_at);
        qb.push(self.backend.timestamp_param_cast());
        qb.push(", ");
        qb.push_bind(deleted_at);
        qb.push(self.backend.timestamp_param_cast());
        qb.push(")");

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|err| interpret_resource_db_error(cluster, &name, err))?;
        Ok(())
    }

    /// Overwrites the row of an already observed object.
    ///
    /// Objects sharing a namespace/name over time may carry different UIDs; the row
    /// always reflects the live object.
    pub async fn update(&self, cluster: &str, obj: &DynamicObject) -> FleetResult<()> {
        let meta = &obj.metadata;
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();
        let object_json = serde_json::to_string(obj)?;
        let created_at = self.backend.format_timestamp(&creation_timestamp(meta));
        let deleted_at = meta
            .deletion_timestamp
            .as_ref()
            .map(|ts| self.backend.format_timestamp(&ts.0));

        let mut qb = QueryBuilder::<Any>::new("UPDATE resources SET owner_uid = ");
        qb.push_bind(controller_owner_uid(meta));
        qb.push(", uid = ");
        qb.push_bind(meta.uid.clone().unwrap_or_default());
        qb.push(", resource_version = ");
        qb.push_bind(meta.resource_version.clone().unwrap_or_default());
        qb.push(", object = ");
        qb.push_bind(object_json);
        qb.push(self.backend.json_param_cast());
        qb.push(", created_at = ");
        qb.push_bind(created_at);
        qb.push(self.backend.timestamp_param_cast());
        qb.push(", deleted_at = ");
        qb.push_bind(deleted_at);
        qb.push(self.backend.timestamp_param_cast());
        qb.push(format!(", synced_at = {}", self.backend.now_expr()));
        self.push_key_where(&mut qb, cluster, &namespace, &name);

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|err| interpret_resource_db_error(cluster, &name, err))?;
        Ok(())
    }

    /// Deletes the row of an object. Deleting a missing row is not an error.
    pub async fn delete(&self, cluster: &str, obj: &DynamicObject) -> FleetResult<()> {
        let meta = &obj.metadata;
        let name = meta.name.clone().unwrap_or_default();
        let namespace = meta.namespace.clone().unwrap_or_default();

        let mut qb = QueryBuilder::<Any>::new("DELETE FROM resources");
        self.push_key_where(&mut qb, cluster, &namespace, &name);

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|err| interpret_resource_db_error(cluster, &name, err))?;
        Ok(())
    }

    /// Fetches one object and decodes it into `K`.
    pub async fn get<K: DeserializeOwned>(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> FleetResult<K> {
        let mut qb = QueryBuilder::<Any>::new("SELECT object FROM resources");
        self.push_key_where(&mut qb, cluster, namespace, name);

        let row = qb.build().fetch_optional(&self.pool).await?;
        let row = row.ok_or_else(|| {
            fleet_error!(
                ErrorKind::NotFound,
                "resource not found",
                "{cluster}/{namespace}/{name}"
            )
        })?;
        let object: String = row.try_get("object")?;
        Ok(serde_json::from_str(&object)?)
    }

    /// Lists objects across clusters according to `opts`.
    ///
    /// The projection is chosen from the options: full object or metadata only, with or
    /// without the stored events. Event decode failures are logged and that row's
    /// events are omitted rather than failing the whole list.
    pub async fn list(&self, opts: &ListOptions) -> FleetResult<ResourceList> {
        let projection = Projection::from_options(opts.only_metadata, opts.inject_events);

        let amount = if opts.with_remaining_count {
            let mut count_qb = QueryBuilder::<Any>::new("SELECT COUNT(*) FROM resources");
            query::push_filters(&mut count_qb, self.backend, &self.resource_type, opts)?;
            let row = count_qb.build().fetch_one(&self.pool).await?;
            Some(row.try_get::<i64, _>(0)?)
        } else {
            None
        };

        let mut qb = QueryBuilder::<Any>::new(format!(
            "SELECT {} FROM resources",
            projection.columns(self.backend)
        ));
        query::push_filters(&mut qb, self.backend, &self.resource_type, opts)?;
        let offset = query::push_order_and_paging(&mut qb, opts)?;

        let rows = qb.build().fetch_all(&self.pool).await?;
        debug!(resource = %self.resource_type, rows = rows.len(), "listed resources");

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = projection.record_from_row(row)?;
            let mut obj = record.to_object()?;

            if opts.inject_events {
                match record.decode_events() {
                    Ok(events) if !events.is_empty() => {
                        let payload = serde_json::to_string(&events)?;
                        obj.metadata
                            .annotations
                            .get_or_insert_with(Default::default)
                            .insert(EVENTS_ANNOTATION.to_string(), payload);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            resource = %self.resource_type,
                            error = %err,
                            "failed to decode stored events, omitting them"
                        );
                    }
                }
            }
            items.push(obj);
        }

        let continue_token = if opts.with_continue
            && opts.limit > 0
            && items.len() as i64 == opts.limit
        {
            Some((offset + opts.limit).to_string())
        } else {
            None
        };
        // With an offset past the end the page is empty and the remainder negative,
        // preserving amount = offset + len + remaining.
        let remaining_item_count = amount.map(|amount| amount - offset - items.len() as i64);

        Ok(ResourceList {
            items,
            continue_token,
            remaining_item_count,
        })
    }

    /// Watching the storage is not supported; callers watch the source clusters.
    pub fn watch(&self, _opts: &ListOptions) -> FleetResult<WatchStream> {
        Err(fleet_error!(
            ErrorKind::MethodNotSupported,
            "watch is not supported",
            self.resource_type
        ))
    }

    /// Folds an event into every row of the involved object.
    ///
    /// The row's event map is updated in place keyed by the event's UID, and the seen
    /// event revision is tracked keyed by the event's namespace/name. Both updates are
    /// one statement, so concurrent recorders cannot clobber unrelated keys.
    pub async fn record_event(&self, cluster: &str, event: &Event) -> FleetResult<()> {
        let target_uid = event.involved_object.uid.clone().unwrap_or_default();
        if target_uid.is_empty() {
            bail!(
                ErrorKind::ValidationError,
                "invalid event: involvedObject.uid is empty"
            );
        }

        let event_uid = event.metadata.uid.clone().unwrap_or_default();
        let event_key = event_natural_key(&event.metadata);
        let event_json = serde_json::to_string(event)?;
        let revision_json =
            serde_json::to_string(&event.metadata.resource_version.clone().unwrap_or_default())?;

        let mut qb = QueryBuilder::<Any>::new("UPDATE resources SET events = ");
        self.push_json_map_set(&mut qb, "events", &event_uid, &event_json);
        qb.push(", event_resource_versions = ");
        self.push_json_map_set(&mut qb, "event_resource_versions", &event_key, &revision_json);
        qb.push(" WHERE cluster = ");
        qb.push_bind(cluster.to_string());
        qb.push(" AND uid = ");
        qb.push_bind(target_uid);

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|err| interpret_resource_db_error(cluster, "", err))?;
        Ok(())
    }

    /// Returns the decoded events recorded against one object. A row without events
    /// yields an empty list; a missing row is an error.
    pub async fn get_resource_events(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> FleetResult<Vec<Event>> {
        let mut qb = QueryBuilder::<Any>::new("SELECT events FROM resources");
        self.push_key_where(&mut qb, cluster, namespace, name);

        let row = qb.build().fetch_optional(&self.pool).await?;
        let row = row.ok_or_else(|| {
            fleet_error!(
                ErrorKind::NotFound,
                "resource not found",
                "{cluster}/{namespace}/{name}"
            )
        })?;

        let raw: Option<String> = row.try_get("events")?;
        match raw {
            Some(raw) => decode_event_map(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Builds the minimal object a deletion tombstone reduces to.
    ///
    /// Queued deletes do not need the full final state, only enough metadata to address
    /// the row.
    pub fn convert_deleted_object(&self, key: &ObjectKey) -> DynamicObject {
        DynamicObject {
            types: None,
            metadata: ObjectMeta {
                namespace: (!key.namespace.is_empty()).then(|| key.namespace.clone()),
                name: Some(key.name.clone()),
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    fn push_key_where(
        &self,
        qb: &mut QueryBuilder<'_, Any>,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) {
        qb.push(" WHERE cluster = ");
        qb.push_bind(cluster.to_string());
        qb.push(format!(" AND {} = ", self.backend.quote_ident("group")));
        qb.push_bind(self.resource_type.group.clone());
        qb.push(" AND version = ");
        qb.push_bind(self.resource_type.version.clone());
        qb.push(" AND resource = ");
        qb.push_bind(self.resource_type.resource.clone());
        qb.push(" AND namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND name = ");
        qb.push_bind(name.to_string());
    }

    /// Appends the expression inserting/overwriting one key of a JSON map column,
    /// leaving the other keys untouched. NULL columns start from an empty map.
    fn push_json_map_set(
        &self,
        qb: &mut QueryBuilder<'_, Any>,
        column: &str,
        map_key: &str,
        value_json: &str,
    ) {
        match self.backend {
            Backend::Sqlite => {
                qb.push(format!("json_set(COALESCE({column}, '{{}}'), '$.\"' || "));
                qb.push_bind(map_key.to_string());
                qb.push(" || '\"', json(");
                qb.push_bind(value_json.to_string());
                qb.push("))");
            }
            Backend::Mysql => {
                qb.push(format!(
                    "JSON_SET(COALESCE({column}, '{{}}'), CONCAT('$.\"', "
                ));
                qb.push_bind(map_key.to_string());
                qb.push(", '\"'), CAST(");
                qb.push_bind(value_json.to_string());
                qb.push(" AS JSON))");
            }
            Backend::Postgres => {
                qb.push(format!("jsonb_set(COALESCE({column}, '{{}}'::jsonb), ARRAY["));
                qb.push_bind(map_key.to_string());
                qb.push("], ");
                qb.push_bind(value_json.to_string());
                qb.push("::jsonb, true)");
            }
        }
    }
}

fn creation_timestamp(meta: &ObjectMeta) -> DateTime<Utc> {
    meta.creation_timestamp
        .as_ref()
        .map(|ts| ts.0)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Maps a database error on one resource row to its domain error, attaching the row
/// coordinates where that helps.
fn interpret_resource_db_error(cluster: &str, name: &str, err: sqlx::Error) -> FleetError {
    let base = FleetError::from(err);
    match base.kind() {
        ErrorKind::AlreadyExists => fleet_error!(
            ErrorKind::AlreadyExists,
            "resource already exists",
            "{cluster}/{name}"
        ),
        ErrorKind::NotFound => fleet_error!(
            ErrorKind::NotFound,
            "resource not found",
            "{cluster}/{name}"
        ),
        _ => base,
    }
}
