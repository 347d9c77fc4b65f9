//! End-to-end tests over an in-process coordinator cluster.
//!
//! Each test stands up one or more workflow managers against a shared
//! [`dagq::MemoryCluster`], which gives the full semantics of the real
//! coordination service (versions, ephemerals, watches, session expiry)
//! without external infrastructure.

mod cancel_clean;
mod common;
mod delay_priority;
mod recovery;
