use thiserror::Error;

/// The result type returned by every fallible `pgraft` operation.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds enumerated for the control plane.
#[derive(Error, Debug)]
pub enum Error {
    #[error("core not initialized")]
    NotInitialized,

    #[error("core already initialized")]
    AlreadyInitialized,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("not leader")]
    NotLeader,

    #[error("node {0} not found")]
    NodeNotFound(u32),

    #[error("cluster is full (max {0} nodes)")]
    ClusterFull(usize),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("command queue is full")]
    QueueFull,

    #[error("no eligible failover candidate")]
    NoCandidate,

    #[error("promotion failed: {0}")]
    PromotionFailed(String),

    #[error("basebackup failed: {0}")]
    BasebackupFailed(String),

    #[error("recovery configuration failed: {0}")]
    RecoveryConfigFailed(String),

    #[error("quorum lost")]
    QuorumLost,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::NetworkError(err.to_string())
    }
}
