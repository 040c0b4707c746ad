//! Coordination primitives shared by the long-running sync tasks.

pub mod shutdown;
