//! The saga coordinator: transaction admission, next-hop dispatch, worker
//! jobs, result propagation, completion, and cancellation.
//!
//! A saga is a server behavior wrapping a user [`Saga`] implementation. The
//! coordinator keeps three maps, each behind its own lock: active
//! transactions, the saga-wide step index (step id to owning transaction),
//! and running jobs keyed by worker pid. Lock order is transactions, then
//! steps, then jobs; the per-transaction lock is taken only after the
//! saga-level locks are released, and no lock is held across a user
//! callback.

use crate::error::Error;
use crate::id::{JobId, Pid, StepId, Target, TransactionId};
use crate::message::{CallFrom, ControlRequest, DirectReply, Down, Exit, Term};
use crate::process::{ProcessHandle, ProcessOptions};
use crate::saga::protocol::{
    JobMessage, NextOptions, SagaMessage, REASON_HOP_LIMIT, REASON_LIFESPAN,
    REASON_LIFESPAN_LOCAL, REASON_LOOP, REASON_STEP_TIMEOUT, REASON_TX_LIMIT,
};
use crate::saga::supervisor::WorkerSupervisor;
use crate::saga::types::{
    Job, JobOptions, SagaJob, SagaOptions, SagaStats, Step, StepEntry, Transaction,
    TransactionOptions, TxInner, WorkerFactory,
};
use crate::server::{ControlPlane, Server, Status};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The user contract of a saga.
#[async_trait]
pub trait Saga: Send + 'static {
    /// Invoked once on start; returns the saga options.
    async fn init_saga(&mut self, saga: &SagaContext) -> Result<SagaOptions, Error>;

    /// A transaction was admitted from upstream.
    async fn handle_tx_new(
        &mut self,
        saga: &SagaContext,
        tx: TransactionId,
        value: Value,
    ) -> Status;

    /// A downstream step reported its final result.
    async fn handle_tx_result(
        &mut self,
        saga: &SagaContext,
        tx: TransactionId,
        from: StepId,
        value: Value,
    ) -> Status;

    /// The transaction was canceled.
    async fn handle_tx_cancel(
        &mut self,
        saga: &SagaContext,
        tx: TransactionId,
        reason: &str,
    ) -> Status;

    /// The transaction completed on the saga that originated it.
    async fn handle_tx_done(&mut self, _saga: &SagaContext, _tx: TransactionId) -> Status {
        Status::Ok
    }

    /// A downstream step reported an interim result.
    async fn handle_tx_interim(
        &mut self,
        saga: &SagaContext,
        tx: TransactionId,
        _from: StepId,
        _value: Value,
    ) -> Status {
        warn!(saga = %saga.pid(), %tx, "unhandled interim result");
        Status::Ok
    }

    /// A worker reported its final result.
    async fn handle_job_result(
        &mut self,
        saga: &SagaContext,
        job: JobId,
        _value: Value,
    ) -> Status {
        warn!(saga = %saga.pid(), %job, "unhandled job result");
        Status::Ok
    }

    /// A worker reported an interim result.
    async fn handle_job_interim(
        &mut self,
        saga: &SagaContext,
        job: JobId,
        _value: Value,
    ) -> Status {
        warn!(saga = %saga.pid(), %job, "unhandled job interim");
        Status::Ok
    }

    /// A worker exited before its job was done.
    async fn handle_job_failed(
        &mut self,
        saga: &SagaContext,
        job: JobId,
        reason: &str,
    ) -> Status {
        warn!(saga = %saga.pid(), %job, reason, "job failed");
        Status::Ok
    }

    /// Server passthrough for calls the coordinator does not consume.
    async fn handle_saga_call(
        &mut self,
        saga: &SagaContext,
        _from: CallFrom,
        request: Term,
    ) -> (Option<Term>, Status) {
        warn!(saga = %saga.pid(), ?request, "unhandled call");
        (Some(Term::Value(Value::from("ok"))), Status::Ok)
    }

    /// Server passthrough for casts.
    async fn handle_saga_cast(&mut self, saga: &SagaContext, message: Term) -> Status {
        warn!(saga = %saga.pid(), ?message, "unhandled cast");
        Status::Ok
    }

    /// Server passthrough for info messages.
    async fn handle_saga_info(&mut self, saga: &SagaContext, message: Term) -> Status {
        warn!(saga = %saga.pid(), ?message, "unhandled info");
        Status::Ok
    }

    /// Invoked once when the saga terminates.
    async fn terminate_saga(&mut self, _saga: &SagaContext, _reason: &str) {}
}

/// Handler for direct requests with a user payload, supplied in
/// [`SagaOptions`].
///
/// Direct is the saga's control plane: the handler runs inline on the loop
/// task with no callback lock, so it carries its own synchronization and
/// cannot reach the callback state.
#[async_trait]
pub trait SagaDirect: Send + Sync {
    /// Handle a direct request.
    async fn handle_saga_direct(&self, saga: &SagaContext, request: Term) -> Result<Term, Error>;
}

pub(crate) struct SagaShared {
    max_transactions: AtomicU32,
    worker: Mutex<Option<WorkerFactory>>,
    supervisor: Mutex<Option<ProcessHandle>>,
    direct: Mutex<Option<Arc<dyn SagaDirect>>>,
    txs: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
    steps: Mutex<HashMap<StepId, Arc<Transaction>>>,
    jobs: Mutex<HashMap<Pid, Job>>,
}

impl SagaShared {
    fn new() -> Self {
        SagaShared {
            max_transactions: AtomicU32::new(0),
            worker: Mutex::new(None),
            supervisor: Mutex::new(None),
            direct: Mutex::new(None),
            txs: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

/// The transaction is complete when, without two-phase commit, its steps and
/// jobs have drained; with two-phase commit, when every step and job carries
/// the done flag.
fn tx_complete(shared: &SagaShared, tx: &Transaction) -> bool {
    if !tx.options.two_phase_commit {
        let inner = tx.inner.lock();
        return inner.steps.is_empty() && inner.jobs.is_empty();
    }
    let job_pids: Vec<Pid> = {
        let inner = tx.inner.lock();
        if inner.steps.values().any(|entry| !entry.done) {
            return false;
        }
        inner.jobs.iter().cloned().collect()
    };
    let jobs = shared.jobs.lock();
    job_pids
        .iter()
        .all(|pid| jobs.get(pid).map(|job| job.done).unwrap_or(true))
}

/// The saga handle passed to every user callback.
#[derive(Clone)]
pub struct SagaContext {
    pub(crate) process: ProcessHandle,
    pub(crate) shared: Arc<SagaShared>,
}

impl SagaContext {
    /// The underlying process handle.
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// The saga's pid.
    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    /// Create a transaction originating on this saga.
    pub fn start_transaction(&self, options: TransactionOptions) -> Result<TransactionId, Error> {
        let node = self.process.node()?;
        let id = TransactionId(node.make_ref());
        let tx = Transaction {
            id,
            options: options.normalized(),
            origin: StepId::nil(),
            parents: Vec::new(),
            arrival: Utc::now().timestamp(),
            monitor: None,
            inner: Mutex::new(TxInner::default()),
        };
        self.shared.txs.lock().insert(id, Arc::new(tx));
        Ok(id)
    }

    /// Append a downstream step to a transaction.
    ///
    /// The monitor installed on the target doubles as the step id. The
    /// remaining lifespan is recomputed; under one second left the whole
    /// transaction is canceled.
    pub async fn next(&self, id: TransactionId, step: Step) -> Result<StepId, Error> {
        let tx = self
            .shared
            .txs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTransaction)?;

        {
            let inner = tx.inner.lock();
            if inner.steps.len() as u32 + 1 > tx.options.hop_limit {
                return Err(Error::HopLimitExceeded);
            }
        }

        let now = Utc::now().timestamp();
        let remaining = tx.remaining_lifespan(now);
        if remaining < 1 {
            self.cancel_transaction(id, REASON_LIFESPAN_LOCAL).await?;
            return Err(Error::LifespanExceeded);
        }

        let step_id = StepId(self.process.monitor(&step.target).await);
        let message = SagaMessage::Next {
            sender: self.pid(),
            step: step_id,
            transaction: id,
            value: step.value.clone(),
            parents: tx.parents.clone(),
            options: NextOptions {
                hop_limit: tx.options.hop_limit,
                lifespan: remaining,
                two_phase_commit: tx.options.two_phase_commit,
            },
        };
        if let Err(e) = self.process.send(&step.target, Term::Saga(message)).await {
            self.process.demonitor(step_id.0);
            return Err(e);
        }

        let timer = (step.timeout > 0).then(|| {
            let process = self.process.clone();
            let seconds = step.timeout;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                let cancel = SagaMessage::Cancel {
                    sender: process.pid(),
                    step: step_id,
                    transaction: id,
                    reason: REASON_STEP_TIMEOUT.to_string(),
                };
                let _ = process
                    .send(&Target::Pid(process.pid()), Term::Saga(cancel))
                    .await;
            })
        });

        tx.inner.lock().steps.insert(
            step_id,
            StepEntry {
                step,
                done: false,
                timer,
            },
        );
        self.shared.steps.lock().insert(step_id, tx.clone());

        Ok(step_id)
    }

    /// Start a job on a fresh supervised worker.
    pub async fn start_job(
        &self,
        id: TransactionId,
        _options: JobOptions,
        value: Value,
    ) -> Result<JobId, Error> {
        if self.shared.worker.lock().is_none() {
            return Err(Error::NoWorker);
        }
        let tx = self
            .shared
            .txs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTransaction)?;
        let supervisor = self
            .shared
            .supervisor
            .lock()
            .clone()
            .ok_or(Error::NoWorker)?;

        let reply = supervisor.control(ControlRequest::StartWorker).await?;
        let DirectReply::Worker(worker) = reply else {
            return Err(Error::UnsupportedRequest);
        };
        self.process.link(&worker).await;

        let node = self.process.node()?;
        let job_id = JobId(node.make_ref());
        let job = SagaJob {
            id: job_id,
            transaction: id,
            value,
            saga: self.pid(),
            commit: tx.options.two_phase_commit,
        };
        if let Err(e) = self
            .process
            .cast(&Target::Pid(worker.clone()), Term::Job(JobMessage::Start(job)))
            .await
        {
            self.process.unlink(&worker);
            if let Some(handle) = node.process_by_pid(&worker) {
                handle.kill();
            }
            return Err(e);
        }

        self.shared.jobs.lock().insert(
            worker.clone(),
            Job {
                id: job_id,
                transaction: id,
                commit: tx.options.two_phase_commit,
                done: false,
            },
        );
        tx.inner.lock().jobs.insert(worker);

        Ok(job_id)
    }

    /// Cancel a running job and drop it from both indices. The worker's
    /// cancel callback runs; the failure callback does not.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), Error> {
        let worker = self
            .shared
            .jobs
            .lock()
            .iter()
            .find(|(_, job)| job.id == id)
            .map(|(pid, job)| (pid.clone(), job.transaction))
            .ok_or(Error::UnknownJob)?;
        let (worker, transaction) = worker;

        self.shared.jobs.lock().remove(&worker);
        let tx = self.shared.txs.lock().get(&transaction).cloned();
        if let Some(tx) = &tx {
            tx.inner.lock().jobs.remove(&worker);
        }
        self.process.unlink(&worker);
        let _ = self
            .process
            .cast(&Target::Pid(worker), Term::Job(JobMessage::Cancel))
            .await;
        Ok(())
    }

    /// Send the final result to the immediate parent. Without two-phase
    /// commit a completed transaction is released here.
    pub async fn send_result(&self, id: TransactionId, value: Value) -> Result<(), Error> {
        let tx = self
            .shared
            .txs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTransaction)?;
        let parent = tx.parents.first().cloned().ok_or(Error::NoParentSaga)?;

        let message = SagaMessage::Result {
            sender: self.pid(),
            transaction: id,
            step: tx.origin,
            value,
        };
        self.process
            .call(&Target::Pid(parent), Term::Saga(message))
            .await?;

        if !tx.options.two_phase_commit && tx_complete(&self.shared, &tx) {
            self.shared.txs.lock().remove(&id);
            if let Some(monitor) = tx.monitor {
                self.process.demonitor(monitor);
            }
        }
        Ok(())
    }

    /// Send an interim result to the immediate parent. Never changes
    /// transaction state.
    pub async fn send_interim(&self, id: TransactionId, value: Value) -> Result<(), Error> {
        let tx = self
            .shared
            .txs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTransaction)?;
        let parent = tx.parents.first().cloned().ok_or(Error::NoParentSaga)?;

        let message = SagaMessage::Interim {
            sender: self.pid(),
            transaction: id,
            step: tx.origin,
            value,
        };
        self.process
            .call(&Target::Pid(parent), Term::Saga(message))
            .await?;
        Ok(())
    }

    /// Cancel a transaction. The cancel is posted to the saga itself so the
    /// state mutation happens in-loop; unknown ids are ignored.
    pub async fn cancel_transaction(&self, id: TransactionId, reason: &str) -> Result<(), Error> {
        let origin = match self.shared.txs.lock().get(&id) {
            Some(tx) => tx.origin,
            None => return Ok(()),
        };
        let message = SagaMessage::Cancel {
            sender: self.pid(),
            step: origin,
            transaction: id,
            reason: reason.to_string(),
        };
        self.process
            .send(&Target::Pid(self.pid()), Term::Saga(message))
            .await
    }
}

/// Server behavior wrapping a user [`Saga`].
pub struct SagaServer<B: Saga> {
    user: B,
    shared: Arc<SagaShared>,
}

impl<B: Saga> SagaServer<B> {
    /// Wrap a user saga behavior.
    pub fn new(user: B) -> Self {
        SagaServer {
            user,
            shared: Arc::new(SagaShared::new()),
        }
    }

    fn context(&self, process: &ProcessHandle) -> SagaContext {
        SagaContext {
            process: process.clone(),
            shared: self.shared.clone(),
        }
    }

    async fn send_cancel(
        &self,
        ctx: &SagaContext,
        to: Pid,
        step: StepId,
        transaction: TransactionId,
        reason: &str,
    ) {
        let message = SagaMessage::Cancel {
            sender: ctx.pid(),
            step,
            transaction,
            reason: reason.to_string(),
        };
        if let Err(e) = ctx
            .process
            .send(&Target::Pid(to.clone()), Term::Saga(message))
            .await
        {
            debug!(saga = %ctx.pid(), peer = %to, %transaction, "cancel not delivered: {e}");
        }
    }

    async fn dispatch_saga_message(&mut self, ctx: &SagaContext, message: SagaMessage) -> Status {
        match message {
            SagaMessage::Next {
                sender,
                step,
                transaction,
                value,
                parents,
                options,
            } => {
                self.on_next(ctx, sender, step, transaction, value, parents, options)
                    .await
            }
            SagaMessage::Result {
                transaction,
                step,
                value,
                ..
            } => self.on_result(ctx, transaction, step, value).await,
            SagaMessage::Interim {
                transaction, step, value, ..
            } => self.on_interim(ctx, transaction, step, value).await,
            SagaMessage::Cancel {
                sender,
                step,
                transaction,
                reason,
            } => self.on_cancel(ctx, sender, step, transaction, reason).await,
            SagaMessage::Commit { transaction, .. } => self.on_commit(ctx, transaction).await,
            SagaMessage::CommitOk { transaction, .. } => {
                self.on_commit_ok(ctx, transaction).await
            }
        }
    }

    /// Admission of a transaction arriving from upstream. Gates run in
    /// order; the first failure replies with a cancel and drops the
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    async fn on_next(
        &mut self,
        ctx: &SagaContext,
        sender: Pid,
        step: StepId,
        transaction: TransactionId,
        value: Value,
        parents: Vec<Pid>,
        options: NextOptions,
    ) -> Status {
        let max = self.shared.max_transactions.load(Ordering::Acquire);
        if max > 0 && self.shared.txs.lock().len() + 1 > max as usize {
            self.send_cancel(ctx, sender, step, transaction, REASON_TX_LIMIT)
                .await;
            return Status::Ok;
        }

        if self.shared.txs.lock().contains_key(&transaction) {
            self.send_cancel(ctx, sender, step, transaction, REASON_LOOP)
                .await;
            return Status::Ok;
        }

        if options.hop_limit > 0 && parents.len() as u32 + 1 > options.hop_limit {
            self.send_cancel(ctx, sender, step, transaction, REASON_HOP_LIMIT)
                .await;
            return Status::Ok;
        }

        if options.lifespan <= 0 {
            self.send_cancel(ctx, sender, step, transaction, REASON_LIFESPAN)
                .await;
            return Status::Ok;
        }

        let monitor = ctx.process.monitor(&Target::Pid(sender.clone())).await;
        let mut chain = Vec::with_capacity(parents.len() + 1);
        chain.push(sender);
        chain.extend(parents);
        let tx = Transaction {
            id: transaction,
            options: TransactionOptions {
                hop_limit: options.hop_limit,
                lifespan: options.lifespan,
                two_phase_commit: options.two_phase_commit,
                ignore_loop: false,
            },
            origin: step,
            parents: chain,
            arrival: Utc::now().timestamp(),
            monitor: Some(monitor),
            inner: Mutex::new(TxInner::default()),
        };
        self.shared.txs.lock().insert(transaction, Arc::new(tx));

        self.user.handle_tx_new(ctx, transaction, value).await
    }

    async fn on_result(
        &mut self,
        ctx: &SagaContext,
        transaction: TransactionId,
        step: StepId,
        value: Value,
    ) -> Status {
        let tx = self.shared.steps.lock().remove(&step);
        let Some(tx) = tx else {
            debug!(saga = %ctx.pid(), %step, "ignoring result for unknown step");
            return Status::Ok;
        };
        if tx.id != transaction {
            return Status::StopReason("transaction id mismatch in saga result".to_string());
        }

        {
            let mut inner = tx.inner.lock();
            if tx.options.two_phase_commit {
                if let Some(entry) = inner.steps.get_mut(&step) {
                    entry.done = true;
                    entry.abort_timer();
                }
            } else if let Some(mut entry) = inner.steps.remove(&step) {
                entry.abort_timer();
            }
        }
        ctx.process.demonitor(step.0);

        let status = self.user.handle_tx_result(ctx, tx.id, step, value).await;
        if !matches!(status, Status::Ok | Status::Ignore) {
            return status;
        }
        self.check_tx_done(ctx, &tx).await
    }

    async fn on_interim(
        &mut self,
        ctx: &SagaContext,
        _transaction: TransactionId,
        step: StepId,
        value: Value,
    ) -> Status {
        let tx = self.shared.steps.lock().get(&step).cloned();
        let Some(tx) = tx else {
            debug!(saga = %ctx.pid(), %step, "ignoring interim for unknown step");
            return Status::Ok;
        };
        self.user.handle_tx_interim(ctx, tx.id, step, value).await
    }

    /// Cancellation: the user callback runs first, then the cancel fans out
    /// to the parent and every downstream step except the one it came from,
    /// workers are canceled, and the transaction is dropped. A cancel for an
    /// unknown transaction is silently dropped.
    async fn on_cancel(
        &mut self,
        ctx: &SagaContext,
        sender: Pid,
        step: StepId,
        transaction: TransactionId,
        reason: String,
    ) -> Status {
        let tx = self.shared.txs.lock().remove(&transaction);
        let Some(tx) = tx else {
            debug!(saga = %ctx.pid(), %transaction, "ignoring cancel for unknown transaction");
            return Status::Ok;
        };

        let status = self.user.handle_tx_cancel(ctx, transaction, &reason).await;

        if let Some(monitor) = tx.monitor {
            ctx.process.demonitor(monitor);
        }
        if let Some(parent) = tx.parents.first() {
            if *parent != sender {
                self.send_cancel(ctx, parent.clone(), tx.origin, transaction, &reason)
                    .await;
            }
        }

        // skip the participant the cancel came from; a self-posted cancel
        // (lifespan, step timeout) still fans out to every step
        let from_self = sender == ctx.pid();
        let steps: Vec<(StepId, Target)> = {
            let mut inner = tx.inner.lock();
            inner
                .steps
                .drain()
                .map(|(step_id, mut entry)| {
                    entry.abort_timer();
                    (step_id, entry.step.target.clone())
                })
                .collect()
        };
        for (step_id, target) in steps {
            self.shared.steps.lock().remove(&step_id);
            ctx.process.demonitor(step_id.0);
            if step_id != step || from_self {
                let message = SagaMessage::Cancel {
                    sender: ctx.pid(),
                    step: step_id,
                    transaction,
                    reason: reason.clone(),
                };
                if let Err(e) = ctx.process.send(&target, Term::Saga(message)).await {
                    debug!(saga = %ctx.pid(), %step_id, "cancel not delivered downstream: {e}");
                }
            }
        }

        let workers: Vec<Pid> = {
            let mut inner = tx.inner.lock();
            inner.jobs.drain().collect()
        };
        for worker in workers {
            self.shared.jobs.lock().remove(&worker);
            ctx.process.unlink(&worker);
            let _ = ctx
                .process
                .cast(&Target::Pid(worker), Term::Job(JobMessage::Cancel))
                .await;
        }

        status
    }

    /// Commit request from the parent (2PC).
    async fn on_commit(&mut self, ctx: &SagaContext, transaction: TransactionId) -> Status {
        let tx = self.shared.txs.lock().get(&transaction).cloned();
        let Some(tx) = tx else {
            debug!(saga = %ctx.pid(), %transaction, "ignoring commit for unknown transaction");
            return Status::Ok;
        };
        self.begin_commit(ctx, &tx).await
    }

    /// Commit acknowledgement from a downstream saga (2PC).
    async fn on_commit_ok(&mut self, ctx: &SagaContext, transaction: TransactionId) -> Status {
        let tx = self.shared.txs.lock().get(&transaction).cloned();
        let Some(tx) = tx else {
            return Status::Ok;
        };
        let drained = {
            let mut inner = tx.inner.lock();
            if inner.pending_commits > 0 {
                inner.pending_commits -= 1;
            }
            inner.committing && inner.pending_commits == 0
        };
        if drained {
            self.finish_commit(ctx, &tx).await
        } else {
            Status::Ok
        }
    }

    /// Evaluate the completion predicate and drive what follows from it.
    async fn check_tx_done(&mut self, ctx: &SagaContext, tx: &Arc<Transaction>) -> Status {
        if !tx_complete(&self.shared, tx) {
            return Status::Ok;
        }
        if tx.options.two_phase_commit {
            if tx.is_originator() {
                return self.begin_commit(ctx, tx).await;
            }
            // a non-originator waits for the parent's commit
            return Status::Ok;
        }
        if tx.is_originator() {
            self.shared.txs.lock().remove(&tx.id);
            return self.user.handle_tx_done(ctx, tx.id).await;
        }
        // released by the next successful send_result
        Status::Ok
    }

    /// Start the commit phase: commit local jobs, fan the commit out to
    /// every downstream step, and wait for their acknowledgements. No
    /// transaction state is freed before the last one arrives.
    async fn begin_commit(&mut self, ctx: &SagaContext, tx: &Arc<Transaction>) -> Status {
        let (targets, workers, pending) = {
            let mut inner = tx.inner.lock();
            if inner.committing {
                return Status::Ok;
            }
            inner.committing = true;
            inner.pending_commits = inner.steps.len();
            let targets: Vec<Target> = inner
                .steps
                .values()
                .map(|entry| entry.step.target.clone())
                .collect();
            let workers: Vec<Pid> = inner.jobs.drain().collect();
            (targets, workers, inner.pending_commits)
        };

        for worker in workers {
            self.shared.jobs.lock().remove(&worker);
            ctx.process.unlink(&worker);
            let _ = ctx
                .process
                .cast(&Target::Pid(worker), Term::Job(JobMessage::Commit))
                .await;
        }
        for target in targets {
            let message = SagaMessage::Commit {
                sender: ctx.pid(),
                transaction: tx.id,
            };
            if let Err(e) = ctx.process.send(&target, Term::Saga(message)).await {
                warn!(saga = %ctx.pid(), tx = %tx.id, "commit not delivered: {e}");
            }
        }

        if pending == 0 {
            self.finish_commit(ctx, tx).await
        } else {
            Status::Ok
        }
    }

    /// The whole subtree acknowledged commit: free the transaction, then
    /// either report done (originator) or acknowledge upstream.
    async fn finish_commit(&mut self, ctx: &SagaContext, tx: &Arc<Transaction>) -> Status {
        self.shared.txs.lock().remove(&tx.id);
        if let Some(monitor) = tx.monitor {
            ctx.process.demonitor(monitor);
        }
        match tx.parents.first() {
            None => self.user.handle_tx_done(ctx, tx.id).await,
            Some(parent) => {
                let message = SagaMessage::CommitOk {
                    sender: ctx.pid(),
                    transaction: tx.id,
                    step: tx.origin,
                };
                if let Err(e) = ctx
                    .process
                    .send(&Target::Pid(parent.clone()), Term::Saga(message))
                    .await
                {
                    warn!(saga = %ctx.pid(), tx = %tx.id, "commit ack not delivered: {e}");
                }
                Status::Ok
            }
        }
    }

    async fn on_job_result(&mut self, ctx: &SagaContext, worker: Pid, value: Value) -> Status {
        let job = self.shared.jobs.lock().get(&worker).cloned();
        let Some(job) = job else {
            return Status::Ok;
        };
        let tx = self.shared.txs.lock().get(&job.transaction).cloned();
        let Some(tx) = tx else {
            // canceled underneath the worker, ignore
            self.shared.jobs.lock().remove(&worker);
            return Status::Ok;
        };

        if tx.options.two_phase_commit {
            if let Some(entry) = self.shared.jobs.lock().get_mut(&worker) {
                entry.done = true;
            }
        } else {
            self.shared.jobs.lock().remove(&worker);
            tx.inner.lock().jobs.remove(&worker);
        }

        let status = self.user.handle_job_result(ctx, job.id, value).await;
        if !matches!(status, Status::Ok | Status::Ignore) {
            return status;
        }
        self.check_tx_done(ctx, &tx).await
    }

    async fn on_job_interim(&mut self, ctx: &SagaContext, worker: Pid, value: Value) -> Status {
        let job = self.shared.jobs.lock().get(&worker).cloned();
        match job {
            Some(job) => self.user.handle_job_interim(ctx, job.id, value).await,
            None => Status::Ok,
        }
    }

    /// A linked worker exited. A job that never reported is a failure;
    /// `"normal"` is reported to the user as `"no result"`.
    async fn on_worker_exit(&mut self, ctx: &SagaContext, exit: Exit) -> Status {
        let job = self.shared.jobs.lock().get(&exit.pid).cloned();
        let Some(job) = job else {
            return self.user.handle_saga_info(ctx, Term::Exit(exit)).await;
        };

        self.shared.jobs.lock().remove(&exit.pid);
        let tx = self.shared.txs.lock().get(&job.transaction).cloned();
        if let Some(tx) = &tx {
            tx.inner.lock().jobs.remove(&exit.pid);
        }
        if job.done {
            return Status::Ok;
        }

        let reason = if exit.reason == "normal" {
            "no result"
        } else {
            exit.reason.as_str()
        };
        let status = self.user.handle_job_failed(ctx, job.id, reason).await;
        if !matches!(status, Status::Ok | Status::Ignore) {
            return status;
        }
        match tx {
            Some(tx) => self.check_tx_done(ctx, &tx).await,
            None => Status::Ok,
        }
    }

    /// A monitor fired: a dead downstream step target is surfaced as a
    /// cancel of its transaction; a dead upstream parent cancels with the
    /// down reason; anything else is user traffic.
    async fn on_down(&mut self, ctx: &SagaContext, down: Down) -> Status {
        let step_id = StepId(down.reference);
        let step_tx = self.shared.steps.lock().get(&step_id).map(|tx| tx.id);
        if let Some(transaction) = step_tx {
            return self
                .on_cancel(ctx, down.pid, step_id, transaction, down.reason)
                .await;
        }

        let parent_tx = self
            .shared
            .txs
            .lock()
            .values()
            .find(|tx| tx.monitor == Some(down.reference))
            .map(|tx| (tx.id, tx.origin, tx.parents.first().cloned()));
        if let Some((transaction, origin, parent)) = parent_tx {
            let sender = parent.unwrap_or(down.pid);
            return self
                .on_cancel(ctx, sender, origin, transaction, down.reason)
                .await;
        }

        self.user.handle_saga_info(ctx, Term::Down(down)).await
    }
}

#[async_trait]
impl<B: Saga + Sync> Server for SagaServer<B> {
    async fn init(&mut self, process: &ProcessHandle) -> Result<(), Error> {
        let ctx = self.context(process);
        let options = self.user.init_saga(&ctx).await?;
        self.shared
            .max_transactions
            .store(options.max_transactions, Ordering::Release);
        *self.shared.direct.lock() = options.direct;

        if let Some(factory) = options.worker {
            *self.shared.worker.lock() = Some(factory.clone());
            let node = process.node()?;
            let supervisor = node
                .spawn("", ProcessOptions::default(), WorkerSupervisor::new(factory))
                .await?;
            *self.shared.supervisor.lock() = Some(supervisor);
        }

        // worker exits must surface as messages, not kill the saga
        process.set_trap_exit(true);
        Ok(())
    }

    async fn handle_call(
        &mut self,
        process: &ProcessHandle,
        from: CallFrom,
        request: Term,
    ) -> (Option<Term>, Status) {
        let ctx = self.context(process);
        match request {
            Term::Saga(message) => {
                let status = self.dispatch_saga_message(&ctx, message).await;
                (Some(Term::Value(Value::Null)), status)
            }
            Term::Job(JobMessage::Result { worker, value }) => {
                let status = self.on_job_result(&ctx, worker, value).await;
                (Some(Term::Value(Value::Null)), status)
            }
            Term::Job(JobMessage::Interim { worker, value }) => {
                let status = self.on_job_interim(&ctx, worker, value).await;
                (Some(Term::Value(Value::Null)), status)
            }
            other => self.user.handle_saga_call(&ctx, from, other).await,
        }
    }

    async fn handle_cast(&mut self, process: &ProcessHandle, message: Term) -> Status {
        let ctx = self.context(process);
        self.user.handle_saga_cast(&ctx, message).await
    }

    async fn handle_info(&mut self, process: &ProcessHandle, message: Term) -> Status {
        let ctx = self.context(process);
        match message {
            Term::Saga(message) => self.dispatch_saga_message(&ctx, message).await,
            Term::Down(down) => self.on_down(&ctx, down).await,
            Term::Exit(exit) => self.on_worker_exit(&ctx, exit).await,
            other => self.user.handle_saga_info(&ctx, other).await,
        }
    }

    async fn terminate(&mut self, process: &ProcessHandle, reason: &str) {
        let supervisor = self.shared.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.kill();
        }
        let ctx = self.context(process);
        self.user.terminate_saga(&ctx, reason).await;
    }

    fn control(&self) -> Option<Arc<dyn ControlPlane>> {
        Some(Arc::new(SagaControl {
            shared: self.shared.clone(),
        }))
    }
}

/// Control plane of a saga process, handled inline on the loop task.
struct SagaControl {
    shared: Arc<SagaShared>,
}

#[async_trait]
impl ControlPlane for SagaControl {
    async fn handle_control(
        &self,
        _process: &ProcessHandle,
        request: ControlRequest,
    ) -> Result<DirectReply, Error> {
        match request {
            ControlRequest::SetMaxTransactions(max) => {
                self.shared.max_transactions.store(max, Ordering::Release);
                Ok(DirectReply::None)
            }
            ControlRequest::Stats => Ok(DirectReply::Stats(SagaStats {
                transactions: self.shared.txs.lock().len(),
                steps: self.shared.steps.lock().len(),
                jobs: self.shared.jobs.lock().len(),
            })),
            _ => Err(Error::UnsupportedRequest),
        }
    }

    async fn handle_direct(
        &self,
        process: &ProcessHandle,
        request: Term,
    ) -> Result<Term, Error> {
        let handler = self.shared.direct.lock().clone();
        match handler {
            Some(handler) => {
                let ctx = SagaContext {
                    process: process.clone(),
                    shared: self.shared.clone(),
                };
                handler.handle_saga_direct(&ctx, request).await
            }
            None => Err(Error::UnsupportedRequest),
        }
    }
}

/// Update a running saga's admission capacity. 0 disables the gate.
pub async fn set_max_transactions(saga: &ProcessHandle, max: u32) -> Result<(), Error> {
    saga.control(ControlRequest::SetMaxTransactions(max))
        .await
        .map(|_| ())
}

/// Snapshot a running saga's live transaction, step and job counts.
pub async fn stats(saga: &ProcessHandle) -> Result<SagaStats, Error> {
    match saga.control(ControlRequest::Stats).await? {
        DirectReply::Stats(stats) => Ok(stats),
        _ => Err(Error::UnsupportedRequest),
    }
}
