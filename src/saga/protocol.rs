//! The wire protocol between saga participants.
//!
//! Next and cancel travel as info messages; result and interim travel as
//! synchronous calls so that propagation toward the origin exerts
//! backpressure on the sender. The commit exchange is a second round-trip
//! reusing the result routing with its own tags.

use crate::id::{Pid, StepId, TransactionId};
use crate::saga::types::SagaJob;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Admission rejection: the saga is at its transaction capacity.
pub const REASON_TX_LIMIT: &str = "exceed_tx_limit";
/// Admission rejection: the transaction already passed through this saga.
pub const REASON_LOOP: &str = "loop_detected";
/// Admission rejection: one more hop would exceed the hop limit.
pub const REASON_HOP_LIMIT: &str = "exceed_hop_limit";
/// Admission rejection: the transaction arrived with no lifespan left.
pub const REASON_LIFESPAN: &str = "exceed_lifespan";
/// Synthetic cancel fired by an expired per-step timer.
pub const REASON_STEP_TIMEOUT: &str = "step timeout";
/// Cancel reason used when a transaction runs out of lifespan locally.
pub const REASON_LIFESPAN_LOCAL: &str = "exceeded lifespan";

/// A message between two saga participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SagaMessage {
    /// Hand the transaction to the next participant.
    Next {
        /// Sending saga.
        sender: Pid,
        /// Step id minted by the sender (its monitor on the receiver).
        step: StepId,
        /// Transaction id.
        transaction: TransactionId,
        /// Value for the receiver's transaction handler.
        value: Value,
        /// The sender's own upstream chain, oldest last.
        parents: Vec<Pid>,
        /// Transaction options as seen at this hop.
        options: NextOptions,
    },
    /// Final result for a step, flowing toward the origin.
    Result {
        /// Sending saga.
        sender: Pid,
        /// Transaction id.
        transaction: TransactionId,
        /// The receiver's step id for this dispatch.
        step: StepId,
        /// Result payload.
        value: Value,
    },
    /// Interim result for a step; never changes transaction state.
    Interim {
        /// Sending saga.
        sender: Pid,
        /// Transaction id.
        transaction: TransactionId,
        /// The receiver's step id for this dispatch.
        step: StepId,
        /// Interim payload.
        value: Value,
    },
    /// Cancel the transaction; flows in either direction.
    Cancel {
        /// Sending saga.
        sender: Pid,
        /// The step this cancel is about, from the sender's point of view.
        step: StepId,
        /// Transaction id.
        transaction: TransactionId,
        /// Why.
        reason: String,
    },
    /// Two-phase commit: run the commit phase for the transaction.
    Commit {
        /// Sending saga.
        sender: Pid,
        /// Transaction id.
        transaction: TransactionId,
    },
    /// Two-phase commit: the sender committed its whole subtree.
    CommitOk {
        /// Sending saga.
        sender: Pid,
        /// Transaction id.
        transaction: TransactionId,
        /// The receiver's step id for this dispatch.
        step: StepId,
    },
}

/// Transaction options carried by [`SagaMessage::Next`].
///
/// A string-keyed map on the wire; lifespan crosses as remaining seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NextOptions {
    /// Maximum number of hops, already defaulted by the sender.
    #[serde(rename = "HopLimit")]
    pub hop_limit: u32,
    /// Remaining lifespan in seconds at send time.
    #[serde(rename = "Lifespan")]
    pub lifespan: i64,
    /// Whether the transaction runs under two-phase commit.
    #[serde(rename = "TwoPhaseCommit")]
    pub two_phase_commit: bool,
}

/// Job control between a saga and its workers. Local to the node.
#[derive(Debug, Clone)]
pub enum JobMessage {
    /// Start the job (saga to worker, cast).
    Start(SagaJob),
    /// Cancel the job (saga to worker, cast).
    Cancel,
    /// Run the commit phase of the job (saga to worker, cast, 2PC only).
    Commit,
    /// Final job result (worker to saga, call).
    Result {
        /// The reporting worker.
        worker: Pid,
        /// Result payload.
        value: Value,
    },
    /// Interim job result (worker to saga, call).
    Interim {
        /// The reporting worker.
        worker: Pid,
        /// Interim payload.
        value: Value,
    },
}
