//! Common error types shared across services.

use thiserror::Error;

#[derive(Error, Debug)]
/// Failure taxonomy of the job lifecycle. Consumers route on the variant:
/// `Conflict` means a peer already did the work, `Schema` marks a poison
/// message, and `Transport`/`Storage` are retried via redelivery.
pub enum AppError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid message: {0}")]
    Schema(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("insufficient retrieval capacity: {0}")]
    Capacity(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience alias for results that use [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
