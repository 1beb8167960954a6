//! Error types for the runtime.

use thiserror::Error;

/// Root error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The addressed process does not exist or is no longer alive.
    #[error("no process")]
    NoProcess,

    /// A name is already registered on the node.
    #[error("name already registered: {0}")]
    AlreadyRegistered(String),

    /// The server terminated before or while handling the request.
    #[error("server terminated")]
    ServerTerminated,

    /// A synchronous call or direct request timed out.
    #[error("timeout")]
    Timeout,

    /// The request shape is not supported by the receiver.
    #[error("unsupported request")]
    UnsupportedRequest,

    /// The transaction is not present in the saga's transaction map.
    #[error("unknown transaction")]
    UnknownTransaction,

    /// The job is not present in the saga's job map.
    #[error("unknown job")]
    UnknownJob,

    /// The transaction has no upstream parent to reply to.
    #[error("no parent saga")]
    NoParentSaga,

    /// The saga was started without a worker behavior.
    #[error("this saga has no worker")]
    NoWorker,

    /// Adding another step would exceed the transaction's hop limit.
    #[error("exceeded hop limit")]
    HopLimitExceeded,

    /// The transaction ran out of lifespan and has been canceled.
    #[error("exceeded lifespan, transaction canceled")]
    LifespanExceeded,

    /// Spawning a process failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The node the process belonged to is gone.
    #[error("node stopped")]
    NodeStopped,
}
