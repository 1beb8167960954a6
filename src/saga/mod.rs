//! The saga coordinator: a multi-hop transactional orchestration behavior.
//!
//! A saga accepts transactions, forwards them across a chain of
//! participating sagas, spawns supervised workers for local work, and
//! aggregates results back along the causal chain. Admission enforces
//! capacity, loop, hop and lifespan gates; cancellations propagate in both
//! directions; an optional two-phase commit retains transaction state until
//! every participant has acknowledged completion.

mod coordinator;
mod protocol;
mod supervisor;
mod types;
mod worker;

pub use coordinator::{set_max_transactions, stats, Saga, SagaContext, SagaDirect, SagaServer};
pub use protocol::{
    JobMessage, NextOptions, SagaMessage, REASON_HOP_LIMIT, REASON_LIFESPAN,
    REASON_LIFESPAN_LOCAL, REASON_LOOP, REASON_STEP_TIMEOUT, REASON_TX_LIMIT,
};
pub use supervisor::{RESTART_INTENSITY, RESTART_PERIOD};
pub use types::{
    JobOptions, SagaJob, SagaOptions, SagaStats, Step, TransactionOptions, WorkerFactory,
    DEFAULT_HOP_LIMIT, DEFAULT_LIFESPAN,
};
pub use worker::{Worker, WorkerProcess};
