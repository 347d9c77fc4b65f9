//! Record codec for everything persisted in the coordinator.
//!
//! Records are stored as JSON. The encoding only needs to be stable and
//! self-describing; these helpers centralize the error mapping so
//! serialization failures surface as [`WorkflowError::Serialization`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::WorkflowError;

/// Encodes a record for storage.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WorkflowError> {
    serde_json::to_vec(value).map_err(|e| WorkflowError::Serialization(e.to_string()))
}

/// Decodes a stored record.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WorkflowError> {
    serde_json::from_slice(bytes).map_err(|e| WorkflowError::Serialization(e.to_string()))
}
