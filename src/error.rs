use std::io;

use thiserror::Error;

/// Central error type for the stoker engine.
#[derive(Debug, Error)]
pub enum StokerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Database handshake or query failure.
    #[error("database error: {0}")]
    Db(#[from] postgres::Error),

    /// Task submitted to a pool that has begun shutting down.
    #[error("worker pool is shut down")]
    PoolClosed,

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type StokerResult<T> = Result<T, StokerError>;
