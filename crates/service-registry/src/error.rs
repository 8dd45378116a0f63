//! Service registry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The discovery backend failed.
    #[error("Discovery backend error: {0}")]
    Backend(String),

    /// A node record could not be encoded or decoded.
    #[error("Invalid node record: {0}")]
    InvalidRecord(String),
}
