//! Mirrors the API object state of many independently managed clusters into a single
//! relational table and serves cross-cluster list/filter/paginate queries over it.
//!
//! The crate has two halves. The [`informer`] module hosts the per-(cluster, kind)
//! synchronizer: a reflector that performs a chunked initial list against the cluster
//! API and then applies watch events to a caller-provided store, surviving expiry,
//! throttling and disconnects. The [`storage`] module projects the observed objects
//! into rows keyed by (group, version, resource, cluster, namespace, name) and compiles
//! high-level list options into parameterized SQL against SQLite, MySQL or PostgreSQL.

pub mod concurrency;
pub mod config;
pub mod error;
pub mod informer;
mod macros;
pub mod resource;
pub mod storage;

pub use error::{ErrorKind, FleetError, FleetResult};
