//! Error types for cliquescan-sync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
