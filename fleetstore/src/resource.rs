//! Resource coordinates and object metadata helpers shared by the sync and storage layers.

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{DynamicObject, GroupVersionKind};

/// Annotation key under which decoded events are attached to listed objects.
///
/// Clients that ask for event injection read the JSON-encoded event array from this
/// annotation, regardless of the projection the list was served from.
pub const EVENTS_ANNOTATION: &str = "resources.fleetstore.dev/events";

/// The storage coordinate a resource table row belongs to.
///
/// `group`/`version`/`resource` identify the API surface, `kind` is carried along for
/// rebuilding typed objects from metadata-only projections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(group: &str, version: &str, resource: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
            kind: kind.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &ResourceType::default()
    }

    /// The `apiVersion` string for objects of this resource type.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// A group/resource pair, used to narrow owner lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

/// The in-cluster natural key of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Builds the key of a live object from its metadata.
    pub fn from_object(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Returns the UID of the controlling owner, or an empty string when the object has
/// no controller reference.
pub fn controller_owner_uid(meta: &ObjectMeta) -> String {
    meta.owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller == Some(true))
        .map(|owner| owner.uid.clone())
        .unwrap_or_default()
}

/// Parses the group/version/kind coordinates of a dynamic object.
///
/// Returns [`None`] when the object carries no type information at all; objects with an
/// `apiVersion` but no `kind` (or vice versa) yield a GVK with the missing part empty.
pub fn object_gvk(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", types.api_version.as_str()),
    };
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

/// The resource version of an object, empty when unset.
pub fn object_resource_version(obj: &DynamicObject) -> String {
    obj.metadata.resource_version.clone().unwrap_or_default()
}

/// The `namespace/name` key of an event object, used to track seen event revisions.
pub fn event_natural_key(meta: &ObjectMeta) -> String {
    let namespace = meta.namespace.as_deref().unwrap_or_default();
    let name = meta.name.as_deref().unwrap_or_default();
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}
