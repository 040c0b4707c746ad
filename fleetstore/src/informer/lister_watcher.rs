use std::future::Future;

use futures::stream::BoxStream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::core::DynamicObject;

use crate::error::FleetResult;

/// Options for one page of a list request.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Resource version to list at. Empty asks for a consistent read, `"0"` allows the
    /// source to serve from any cached state.
    pub resource_version: String,
    /// Maximum number of items in the response. Zero or negative disables paging.
    pub limit: i64,
    /// Continuation token from the previous page.
    pub continue_token: Option<String>,
}

/// Options for a watch request.
#[derive(Debug, Clone, Default)]
pub struct WatchParams {
    /// Resource version to start watching from.
    pub resource_version: String,
    /// Server-side timeout for the watch connection, in seconds.
    pub timeout_seconds: Option<i64>,
    /// Whether the source may deliver bookmark events.
    pub allow_watch_bookmarks: bool,
}

/// One page (or one full response) of a list call.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// The resource version the response was served at.
    pub resource_version: String,
    /// Continuation token; present when the source has more items.
    pub continue_token: Option<String>,
    /// Estimated count of items not included in this response.
    pub remaining_item_count: Option<i64>,
    pub items: Vec<DynamicObject>,
}

/// An incremental change delivered on a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// Carries only a resource version; no state change.
    Bookmark(DynamicObject),
    /// The source failed the watch; the payload describes why.
    Error(Status),
}

impl WatchEvent {
    /// The object payload, when the event carries one.
    pub fn object(&self) -> Option<&DynamicObject> {
        match self {
            WatchEvent::Added(obj)
            | WatchEvent::Modified(obj)
            | WatchEvent::Deleted(obj)
            | WatchEvent::Bookmark(obj) => Some(obj),
            WatchEvent::Error(_) => None,
        }
    }
}

/// Stream of watch events. The stream ending means the watch connection closed.
pub type WatchStream = BoxStream<'static, FleetResult<WatchEvent>>;

/// The contract a cluster transport implements for the sync runtime.
///
/// `list` returns a single page; pagination is driven by the caller through
/// [`ListParams::continue_token`]. `watch` opens an event stream positioned at the given
/// resource version.
pub trait ListerWatcher: Send + Sync + 'static {
    fn list(&self, params: ListParams) -> impl Future<Output = FleetResult<ObjectList>> + Send;

    fn watch(&self, params: WatchParams) -> impl Future<Output = FleetResult<WatchStream>> + Send;
}
