use std::future::Future;

use kube::core::DynamicObject;

use crate::error::FleetResult;
use crate::resource::ObjectKey;

/// One element of a store replacement.
///
/// Replacement normally carries full objects, but when the initial list is streamed the
/// objects were already handed to the store one by one and only their keys are replayed.
#[derive(Debug, Clone)]
pub enum StoreItem {
    Object(Box<DynamicObject>),
    Key(ObjectKey),
}

impl StoreItem {
    /// The natural key of this item.
    pub fn key(&self) -> ObjectKey {
        match self {
            StoreItem::Object(obj) => ObjectKey::from_object(obj),
            StoreItem::Key(key) => key.clone(),
        }
    }
}

/// Optional store capability: track the reflector's current resource version even for
/// events that do not mutate state (bookmarks in particular).
pub trait ResourceVersionUpdater: Send + Sync {
    fn update_resource_version(&self, resource_version: &str);
}

/// The destination a reflector syncs into.
///
/// Implementations must be safe for concurrent calls: the reflector serializes its own
/// mutations, but `resync` runs from a side task and may overlap with event handling.
/// `replace` is atomic: observers never see a partially replaced state.
pub trait Store: Send + Sync + 'static {
    fn add(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send;

    fn update(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send;

    /// Removes an object. The payload is the last known state of the object.
    fn delete(&self, obj: DynamicObject) -> impl Future<Output = FleetResult<()>> + Send;

    /// Atomically replaces the store contents with `items`, observed at `resource_version`.
    fn replace(
        &self,
        items: Vec<StoreItem>,
        resource_version: &str,
    ) -> impl Future<Output = FleetResult<()>> + Send;

    /// Re-processes the current contents without involving the network.
    fn resync(&self) -> impl Future<Output = FleetResult<()>> + Send;

    /// Returns the resource-version tracking capability when the store has one.
    fn resource_version_updater(&self) -> Option<&dyn ResourceVersionUpdater> {
        None
    }
}
