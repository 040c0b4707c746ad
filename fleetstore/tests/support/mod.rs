#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Event;
use kube::core::DynamicObject;

use fleetstore::config::StorageConfig;
use fleetstore::error::{ErrorKind, FleetError, FleetResult};
use fleetstore::fleet_error;
use fleetstore::informer::lister_watcher::{
    ListParams, ListerWatcher, ObjectList, WatchEvent, WatchParams, WatchStream,
};
use fleetstore::informer::store::{ResourceVersionUpdater, Store, StoreItem};
use fleetstore::resource::{ObjectKey, ResourceType};
use fleetstore::storage::resource_storage::ResourceStorage;
use fleetstore::storage::schema::auto_migrate;
use fleetstore::storage::connect;
use sqlx::AnyPool;

pub fn deployments() -> ResourceType {
    ResourceType::new("apps", "v1", "deployments", "Deployment")
}

/// Opens an in-memory SQLite storage bound to `resource_type`.
///
/// The pool is capped at one connection: every SQLite in-memory connection is its own
/// database, so a larger pool would scatter the rows.
pub async fn sqlite_storage(resource_type: ResourceType) -> (ResourceStorage, AnyPool) {
    let config = StorageConfig {
        dsn: "sqlite::memory:".to_string(),
        max_open_connections: 1,
        min_idle_connections: 0,
        conn_max_lifetime_secs: 0,
    };
    let (pool, backend) = connect(&config).await.unwrap();
    auto_migrate(&pool, backend).await.unwrap();
    (
        ResourceStorage::new(pool.clone(), backend, resource_type),
        pool,
    )
}

pub fn deployment(namespace: &str, name: &str, uid: &str, resource_version: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "namespace": namespace,
            "name": name,
            "uid": uid,
            "resourceVersion": resource_version,
            "creationTimestamp": "2024-01-01T00:00:00Z",
        },
    }))
    .unwrap()
}

pub fn deployment_owned(
    namespace: &str,
    name: &str,
    uid: &str,
    resource_version: &str,
    owner_uid: &str,
) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "namespace": namespace,
            "name": name,
            "uid": uid,
            "resourceVersion": resource_version,
            "creationTimestamp": "2024-01-01T00:00:00Z",
            "ownerReferences": [{
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "name": "owner",
                "uid": owner_uid,
                "controller": true,
            }],
        },
    }))
    .unwrap()
}

/// Builds a dynamic object straight from JSON, for shapes the helpers don't cover.
pub fn object_from(value: serde_json::Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

pub fn event(
    namespace: &str,
    name: &str,
    event_uid: &str,
    target_uid: &str,
    reason: &str,
    resource_version: &str,
) -> Event {
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "namespace": namespace,
            "name": name,
            "uid": event_uid,
            "resourceVersion": resource_version,
        },
        "involvedObject": {"uid": target_uid},
        "reason": reason,
    }))
    .unwrap()
}

pub fn page(items: Vec<DynamicObject>, resource_version: &str, continue_token: Option<&str>) -> ObjectList {
    ObjectList {
        resource_version: resource_version.to_string(),
        continue_token: continue_token.map(String::from),
        remaining_item_count: None,
        items,
    }
}

/// One scripted watch session.
pub enum WatchScript {
    /// The stream yields these items and then closes.
    Events(Vec<FleetResult<WatchEvent>>),
    /// The stream yields these items and then stays open.
    EventsThenPend(Vec<FleetResult<WatchEvent>>),
    /// The watch call itself fails.
    Fail(FleetError),
}

/// A scripted cluster API for driving the reflector.
///
/// List responses and watch sessions are consumed in order; once a script runs out the
/// corresponding call parks forever, which leaves the reflector idle at a predictable
/// point for assertions.
#[derive(Default)]
pub struct FakeClusterApi {
    list_responses: Mutex<VecDeque<FleetResult<ObjectList>>>,
    watch_scripts: Mutex<VecDeque<WatchScript>>,
    pub list_requests: Mutex<Vec<ListParams>>,
    pub watch_requests: Mutex<Vec<WatchParams>>,
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, response: FleetResult<ObjectList>) {
        self.list_responses.lock().unwrap().push_back(response);
    }

    pub fn push_watch(&self, script: WatchScript) {
        self.watch_scripts.lock().unwrap().push_back(script);
    }

    pub fn list_requests(&self) -> Vec<ListParams> {
        self.list_requests.lock().unwrap().clone()
    }

    pub fn watch_requests(&self) -> Vec<WatchParams> {
        self.watch_requests.lock().unwrap().clone()
    }
}

impl ListerWatcher for FakeClusterApi {
    fn list(&self, params: ListParams) -> impl Future<Output = FleetResult<ObjectList>> + Send {
        self.list_requests.lock().unwrap().push(params);
        let response = self.list_responses.lock().unwrap().pop_front();
        async move {
            match response {
                Some(response) => response,
                None => futures::future::pending().await,
            }
        }
    }

    fn watch(&self, params: WatchParams) -> impl Future<Output = FleetResult<WatchStream>> + Send {
        self.watch_requests.lock().unwrap().push(params);
        let script = self.watch_scripts.lock().unwrap().pop_front();
        async move {
            match script {
                Some(WatchScript::Events(events)) => Ok(stream::iter(events).boxed()),
                Some(WatchScript::EventsThenPend(events)) => {
                    Ok(stream::iter(events).chain(stream::pending()).boxed())
                }
                Some(WatchScript::Fail(err)) => Err(err),
                // Out of scripts: hand out an open stream that never yields, so the
                // reflector parks inside its (shutdown-aware) event loop.
                None => Ok(stream::pending().boxed()),
            }
        }
    }
}

/// A store that records everything the reflector does to it.
#[derive(Default)]
pub struct RecordingStore {
    pub objects: Mutex<HashMap<String, DynamicObject>>,
    pub replaces: Mutex<Vec<(Vec<StoreItem>, String)>>,
    pub resyncs: AtomicU64,
    pub resync_error: Mutex<Option<FleetError>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_names(&self) -> HashSet<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn replace_count(&self) -> usize {
        self.replaces.lock().unwrap().len()
    }

    pub fn resync_count(&self) -> u64 {
        self.resyncs.load(Ordering::SeqCst)
    }
}

impl Store for RecordingStore {
    fn add(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        let key = ObjectKey::from_object(&obj).to_string();
        self.objects.lock().unwrap().insert(key, obj);
        async { Ok(()) }
    }

    fn update(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        let key = ObjectKey::from_object(&obj).to_string();
        self.objects.lock().unwrap().insert(key, obj);
        async { Ok(()) }
    }

    fn delete(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        let key = ObjectKey::from_object(&obj).to_string();
        self.objects.lock().unwrap().remove(&key);
        async { Ok(()) }
    }

    fn replace(
        &self,
        items: Vec<StoreItem>,
        resource_version: &str,
    ) -> impl Future<Output = FleetResult<()>> + Send {
        {
            let mut objects = self.objects.lock().unwrap();
            let keys_only = items
                .iter()
                .any(|item| matches!(item, StoreItem::Key(_)));
            if keys_only {
                let keys: HashSet<String> =
                    items.iter().map(|item| item.key().to_string()).collect();
                objects.retain(|key, _| keys.contains(key));
            } else {
                objects.clear();
                for item in &items {
                    if let StoreItem::Object(obj) = item {
                        objects.insert(ObjectKey::from_object(obj).to_string(), (**obj).clone());
                    }
                }
            }
        }
        self.replaces
            .lock()
            .unwrap()
            .push((items, resource_version.to_string()));
        async { Ok(()) }
    }

    fn resync(&self) -> impl Future<Output = FleetResult<()>> + Send {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        let result = match self.resync_error.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        async move { result }
    }
}

/// A recording store that also advertises the resource-version tracking capability.
#[derive(Default)]
pub struct RvTrackingStore {
    pub inner: RecordingStore,
    pub tracked: Mutex<Vec<String>>,
}

impl Store for RvTrackingStore {
    fn add(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        self.inner.add(obj)
    }

    fn update(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        self.inner.update(obj)
    }

    fn delete(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send {
        self.inner.delete(obj)
    }

    fn replace(
        &self,
        items: Vec<StoreItem>,
        resource_version: &str,
    ) -> impl Future<Output = FleetResult<()>> + Send {
        self.inner.replace(items, resource_version)
    }

    fn resync(&self) -> impl Future<Output = FleetResult<()>> + Send {
        self.inner.resync()
    }

    fn resource_version_updater(&self) -> Option<&dyn ResourceVersionUpdater> {
        Some(self)
    }
}

impl ResourceVersionUpdater for RvTrackingStore {
    fn update_resource_version(&self, resource_version: &str) {
        self.tracked
            .lock()
            .unwrap()
            .push(resource_version.to_string());
    }
}

/// An error of the given kind, for scripting failures.
pub fn error_of_kind(kind: ErrorKind) -> FleetError {
    fleet_error!(kind, "scripted failure")
}

/// Polls `cond` until it holds, panicking after a generous virtual-time budget.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition was not reached in time");
}
