//! The cluster-facing sync runtime.
//!
//! A [`reflector::Reflector`] keeps an external [`store::Store`] aligned with one
//! resource kind of one cluster: a paginated initial list through [`pager::ListPager`],
//! then an open-ended watch whose events are applied one by one. The cluster API is
//! abstracted behind [`lister_watcher::ListerWatcher`] so the loop can be driven by any
//! transport (or a scripted fake in tests).

pub mod backoff;
pub mod lister_watcher;
pub mod pager;
pub mod reflector;
pub mod store;
