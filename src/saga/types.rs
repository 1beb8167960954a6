//! Saga data model: options, transactions, steps and jobs.

use crate::id::{JobId, Pid, Ref, StepId, Target, TransactionId};
use crate::saga::coordinator::SagaDirect;
use crate::saga::worker::Worker;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Default hop limit applied when a transaction is started with 0.
pub const DEFAULT_HOP_LIMIT: u32 = u16::MAX as u32;
/// Default lifespan in seconds applied when a transaction is started with 0.
pub const DEFAULT_LIFESPAN: i64 = 60;

/// Builds a fresh worker behavior for each job.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// Options of a saga process, returned by `init_saga`.
#[derive(Clone, Default)]
pub struct SagaOptions {
    /// Admission capacity; 0 means unlimited.
    pub max_transactions: u32,
    /// Worker behavior spawned under the worker supervisor for each job.
    pub worker: Option<WorkerFactory>,
    /// Handler for direct requests with a user payload; runs inline on the
    /// loop task with no callback lock.
    pub direct: Option<Arc<dyn SagaDirect>>,
}

impl fmt::Debug for SagaOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaOptions")
            .field("max_transactions", &self.max_transactions)
            .field("worker", &self.worker.is_some())
            .field("direct", &self.direct.is_some())
            .finish()
    }
}

/// Options of a single transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionOptions {
    /// Maximum number of hops; 0 applies [`DEFAULT_HOP_LIMIT`].
    pub hop_limit: u32,
    /// Lifespan in seconds; 0 applies [`DEFAULT_LIFESPAN`].
    pub lifespan: i64,
    /// Retain state until every participant has acknowledged commit.
    pub two_phase_commit: bool,
    /// Accepted for forward compatibility; the loop gate always applies.
    pub ignore_loop: bool,
}

impl TransactionOptions {
    pub(crate) fn normalized(mut self) -> Self {
        if self.hop_limit == 0 {
            self.hop_limit = DEFAULT_HOP_LIMIT;
        }
        if self.lifespan <= 0 {
            self.lifespan = DEFAULT_LIFESPAN;
        }
        self
    }
}

/// One downstream dispatch of a transaction.
#[derive(Debug, Clone)]
pub struct Step {
    /// The next participant.
    pub target: Target,
    /// Value delivered to that participant's transaction handler.
    pub value: Value,
    /// Seconds to wait for the final result; 0 disables the timer. On expiry
    /// a synthetic cancel with reason `"step timeout"` fires for this step.
    pub timeout: u64,
}

impl Step {
    /// A step with no timeout.
    pub fn new(target: impl Into<Target>, value: Value) -> Self {
        Step {
            target: target.into(),
            value,
            timeout: 0,
        }
    }

    /// Set the per-step timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }
}

/// Options of a job started with `start_job`.
///
/// The timeout is accepted for API compatibility; bounding a job's lifetime
/// is the worker behavior's concern.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobOptions {
    /// Seconds the job is expected to take.
    pub timeout: u64,
}

/// The worker-visible description of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaJob {
    /// Job id.
    pub id: JobId,
    /// Owning transaction.
    pub transaction: TransactionId,
    /// Opaque job value.
    pub value: Value,
    /// The saga that started the job.
    pub saga: Pid,
    /// Whether the transaction runs under two-phase commit; a committing
    /// worker stays alive until the commit message arrives.
    pub commit: bool,
}

/// Saga-side job record, keyed by worker pid.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub id: JobId,
    pub transaction: TransactionId,
    pub commit: bool,
    pub done: bool,
}

pub(crate) struct StepEntry {
    pub step: Step,
    pub done: bool,
    pub timer: Option<JoinHandle<()>>,
}

impl StepEntry {
    pub fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
pub(crate) struct TxInner {
    pub steps: HashMap<StepId, StepEntry>,
    pub jobs: HashSet<Pid>,
    pub committing: bool,
    pub pending_commits: usize,
}

/// A live transaction on one saga.
pub(crate) struct Transaction {
    pub id: TransactionId,
    pub options: TransactionOptions,
    /// Step id minted by the immediate parent; nil on the originator.
    pub origin: StepId,
    /// Upstream chain, immediate parent first; empty on the originator.
    pub parents: Vec<Pid>,
    /// Unix seconds when the transaction arrived on this saga.
    pub arrival: i64,
    /// Monitor on the immediate parent; None on the originator.
    pub monitor: Option<Ref>,
    pub inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn remaining_lifespan(&self, now: i64) -> i64 {
        self.options.lifespan - (now - self.arrival)
    }

    pub fn is_originator(&self) -> bool {
        self.parents.is_empty()
    }
}

/// Live counters of a saga, exposed through the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStats {
    /// Active transactions.
    pub transactions: usize,
    /// Entries in the saga-wide step index.
    pub steps: usize,
    /// Running jobs.
    pub jobs: usize,
}
