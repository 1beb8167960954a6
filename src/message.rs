//! Message shapes exchanged between actors.
//!
//! The mailbox protocol mirrors the classic tagged-tuple convention: a
//! synchronous call envelope, an asynchronous cast envelope, a reply keyed by
//! reference, and everything else as an info message. Payloads are [`Term`]s,
//! a tagged variant set covering every message kind the runtime itself knows
//! about plus an opaque JSON value for user traffic.

use crate::error::Error;
use crate::id::{Pid, Ref};
use crate::saga::{JobMessage, SagaMessage, SagaStats};
use serde_json::Value;
use tokio::sync::oneshot;

/// A message payload.
#[derive(Debug, Clone)]
pub enum Term {
    /// Opaque user payload.
    Value(Value),
    /// Inter-saga protocol message.
    Saga(SagaMessage),
    /// Saga/worker job control message (never crosses the wire).
    Job(JobMessage),
    /// A monitor installed by this process fired.
    Down(Down),
    /// A linked process exited and trap-exit converted the signal.
    Exit(Exit),
}

impl Term {
    /// Shorthand for wrapping a JSON value.
    pub fn value(v: impl Into<Value>) -> Self {
        Term::Value(v.into())
    }
}

/// Delivered when a monitored process terminates.
///
/// `reason` is the exit reason, or `"noproc"` when the target did not exist
/// at the time the monitor was installed.
#[derive(Debug, Clone)]
pub struct Down {
    /// The monitor reference returned when the monitor was installed.
    pub reference: Ref,
    /// The monitored process.
    pub pid: Pid,
    /// Exit reason.
    pub reason: String,
}

/// Delivered to a trap-exit process when a linked peer terminates.
#[derive(Debug, Clone)]
pub struct Exit {
    /// The linked process that exited.
    pub pid: Pid,
    /// Exit reason.
    pub reason: String,
}

/// Reply routing for a synchronous call.
#[derive(Debug, Clone)]
pub enum ReplyTag {
    /// Reply into the caller's mailbox, plexed by reference.
    Ref(Ref),
    /// Reply through the node alias table, bypassing any mailbox.
    Alias(Ref),
}

/// The sender half of a synchronous call.
#[derive(Debug, Clone)]
pub struct CallFrom {
    /// Calling process.
    pub pid: Pid,
    /// How the reply travels back.
    pub reply_to: ReplyTag,
}

/// One mailbox message.
#[derive(Debug)]
pub enum MailboxMessage {
    /// Synchronous request expecting a reply.
    Call {
        /// Who is calling and how to reply.
        from: CallFrom,
        /// Request payload.
        request: Term,
    },
    /// Asynchronous request.
    Cast(Term),
    /// Reply to an outstanding synchronous call issued by this process.
    Reply(Ref, Term),
    /// Anything else.
    Info(Term),
}

/// A mailbox envelope: payload plus transport-level sender.
#[derive(Debug)]
pub struct Envelope {
    /// Transport-level sender pid.
    pub from: Pid,
    /// The message.
    pub message: MailboxMessage,
}

/// A graceful-exit signal delivered on the process exit channel.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    /// Originating process.
    pub from: Pid,
    /// Requested exit reason.
    pub reason: String,
}

/// Control-plane requests handled inline on the process loop, without the
/// callback lock. Reserved for the actor's own runtime layer.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// Update the saga's admission capacity. 0 disables the gate.
    SetMaxTransactions(u32),
    /// Snapshot the saga's live transaction/step/job counts.
    Stats,
    /// Ask a worker supervisor to spawn a fresh worker.
    StartWorker,
}

/// Replies to direct requests.
#[derive(Debug)]
pub enum DirectReply {
    /// Nothing to report.
    None,
    /// Saga counters.
    Stats(SagaStats),
    /// Pid of a freshly spawned worker.
    Worker(Pid),
    /// Reply from a user direct handler.
    Term(Term),
}

/// A direct request travelling on the process direct channel.
#[derive(Debug)]
pub enum DirectRequest {
    /// Runtime control plane, handled inline on the loop task.
    Control(ControlRequest),
    /// User payload, dispatched to the behavior like a call.
    User(Term),
}

/// The envelope on the direct channel: request plus single-shot reply slot.
#[derive(Debug)]
pub struct DirectMessage {
    /// The request.
    pub request: DirectRequest,
    /// Where the answer goes.
    pub reply: oneshot::Sender<Result<DirectReply, Error>>,
}
