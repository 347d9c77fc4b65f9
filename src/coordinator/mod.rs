//! Abstraction over the strongly-consistent hierarchical store that
//! holds all durable state and carries all cross-process coordination.
//!
//! The contract is deliberately small: versioned nodes, conditional
//! updates, ephemeral and sequential creation, children listing, and
//! child watches. Leader election and per-item queue locks are built on
//! top of ephemeral (sequential) nodes; idempotent state transitions are
//! built on create-exclusive nodes.

pub mod memory;
pub mod paths;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by coordinator operations.
#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    /// The node does not exist.
    #[error("node not found: {path}")]
    NotFound {
        /// Path of the missing node.
        path: String,
    },

    /// A node already exists at the path.
    #[error("node already exists: {path}")]
    AlreadyExists {
        /// Path of the existing node.
        path: String,
    },

    /// A conditional update failed because the node changed.
    #[error("version mismatch at {path}: expected {expected}, actual {actual}")]
    VersionMismatch {
        /// Path of the contended node.
        path: String,
        /// The version the caller expected.
        expected: i64,
        /// The node's actual version.
        actual: i64,
    },

    /// The connection to the coordinator was lost.
    #[error("coordinator connection lost: {0}")]
    ConnectionLoss(String),

    /// The session backing this handle has expired; its ephemeral nodes
    /// are gone and the handle is unusable.
    #[error("coordinator session expired")]
    SessionExpired,
}

/// Result alias for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Durable node.
    Persistent,
    /// Durable node; a zero-padded monotonic counter scoped to the
    /// parent is appended to the requested name.
    PersistentSequential,
    /// Node removed when the creating session expires.
    Ephemeral,
    /// Ephemeral with the sequential naming of `PersistentSequential`.
    EphemeralSequential,
}

impl CreateMode {
    /// Returns true for the sequential modes.
    #[must_use]
    pub const fn is_sequential(self) -> bool {
        matches!(self, Self::PersistentSequential | Self::EphemeralSequential)
    }

    /// Returns true for the ephemeral modes.
    #[must_use]
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, Self::Ephemeral | Self::EphemeralSequential)
    }
}

/// A node's payload together with the version observed at read time, for
/// use in later conditional updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedData {
    /// The node's payload.
    pub data: Vec<u8>,
    /// The node's version. Starts at 0; bumped on every update.
    pub version: i64,
}

/// Client handle to the coordination service. One handle corresponds to
/// one session: ephemeral nodes created through it vanish when the
/// session ends.
///
/// All methods are linearizable. `create` makes missing parents as
/// persistent empty nodes.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Creates a node, returning its actual path (which differs from the
    /// requested path for sequential modes).
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> CoordinatorResult<String>;

    /// Reads a node's payload and version.
    async fn get(&self, path: &str) -> CoordinatorResult<VersionedData>;

    /// Updates a node's payload. When `expected_version` is set the
    /// update only applies if the node is still at that version;
    /// otherwise [`CoordinatorError::VersionMismatch`] is returned.
    /// Returns the node's new version.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i64>,
    ) -> CoordinatorResult<i64>;

    /// Deletes a node.
    async fn delete(&self, path: &str) -> CoordinatorResult<()>;

    /// Returns whether a node exists.
    async fn exists(&self, path: &str) -> CoordinatorResult<bool>;

    /// Lists the names of a node's direct children, sorted ascending.
    /// Returns an empty list when the node does not exist.
    async fn children(&self, path: &str) -> CoordinatorResult<Vec<String>>;

    /// Subscribes to change notifications for the direct children of
    /// `path`: any create, delete, or update directly under it fires the
    /// watch. Notifications are wakeup hints and may be coalesced;
    /// consumers re-list after waking.
    fn watch_children(&self, path: &str) -> broadcast::Receiver<()>;
}
