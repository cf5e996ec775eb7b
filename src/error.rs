//! Typed errors at each component boundary, expressed as individual enums
//! per subsystem rather than one crate-wide error, so the Façade's kind ->
//! wire-status mapping (see `facade.rs`) is total and obvious at a glance.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("layer '{name}': invalid git url or ref")]
    InvalidSpec { name: String },
    #[error("layer '{name}': clone failed: {source}")]
    CloneFailed { name: String, source: String },
    #[error("layer '{name}': fetch/update failed: {source}")]
    UpdateFailed { name: String, source: String },
    #[error("layer '{name}': io error: {source}")]
    Io { name: String, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: String, source: std::io::Error },
    #[error("failed to write {path}: {source}")]
    WriteFile { path: String, source: std::io::Error },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("deploy directory {0} does not exist")]
    MissingDeployDir(String),
    #[error("failed to walk deploy directory: {0}")]
    Walk(String),
    #[error("failed to copy artifact {name}: {source}")]
    Copy { name: String, source: std::io::Error },
}

/// Errors surfaced by the Build Runner pipeline. InvalidRequest/NotFound
/// are Façade-level and have no Runner counterpart.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("workspace preparation failed: {0}")]
    WorkspacePrep(#[from] WorkspaceError),
    #[error("layer materialization failed: {0}")]
    LayerFetch(#[from] LayerError),
    #[error("subprocess exited with status {0}")]
    Subprocess(i32),
    #[error("build canceled")]
    Canceled,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("build id not found: {0}")]
    NotFound(String),
    #[error("illegal state transition for build {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: String, to: String },
    #[error("durable store error: {0}")]
    Store(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("build id not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata (de)serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors the RPC Façade returns to clients, before any Registry/Runner
/// state is created.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for FacadeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => Self::NotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for FacadeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => Self::NotFound(id),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<FacadeError> for tonic::Status {
    fn from(e: FacadeError) -> Self {
        match e {
            FacadeError::InvalidRequest(msg) => tonic::Status::invalid_argument(msg),
            FacadeError::NotFound(msg) => tonic::Status::not_found(msg),
            FacadeError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}
