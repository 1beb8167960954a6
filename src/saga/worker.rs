//! The saga worker behavior.
//!
//! A worker is a short-lived server spawned under the worker supervisor for
//! a single job. It receives the job as a cast, runs the user job handler,
//! and streams interim and final results back to its parent saga as
//! synchronous calls. Without two-phase commit the worker exits normally as
//! soon as the job handler returns; a committing worker stays alive until
//! the commit or cancel message arrives.

use crate::error::Error;
use crate::id::Target;
use crate::message::Term;
use crate::process::ProcessHandle;
use crate::saga::protocol::JobMessage;
use crate::saga::types::SagaJob;
use crate::server::{Server, Status};
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

/// The user contract of a worker.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Run the job. An error terminates the worker with that reason and the
    /// saga sees the job as failed.
    async fn handle_start_job(&mut self, worker: &WorkerProcess, job: SagaJob)
        -> Result<(), Error>;

    /// The job was canceled; clean up before the worker stops.
    async fn handle_cancel_job(&mut self, worker: &WorkerProcess);

    /// Run the commit phase of the job (two-phase commit only).
    async fn handle_commit_job(&mut self, _worker: &WorkerProcess, _job: SagaJob) {}

    /// Any other message delivered to the worker.
    async fn handle_worker_info(&mut self, worker: &WorkerProcess, message: Term) -> Status {
        warn!(worker = %worker.process().pid(), ?message, "unhandled worker info");
        Status::Ok
    }
}

/// The worker handle passed to every worker callback.
pub struct WorkerProcess {
    process: ProcessHandle,
    job: SagaJob,
}

impl WorkerProcess {
    /// The underlying process handle.
    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// The job this worker runs.
    pub fn job(&self) -> &SagaJob {
        &self.job
    }

    /// Report the final result to the parent saga. Synchronous, so a slow
    /// saga exerts backpressure on the worker.
    pub async fn send_result(&self, value: Value) -> Result<(), Error> {
        self.process
            .call(
                &Target::Pid(self.job.saga.clone()),
                Term::Job(JobMessage::Result {
                    worker: self.process.pid(),
                    value,
                }),
            )
            .await
            .map(|_| ())
    }

    /// Report an interim result to the parent saga.
    pub async fn send_interim(&self, value: Value) -> Result<(), Error> {
        self.process
            .call(
                &Target::Pid(self.job.saga.clone()),
                Term::Job(JobMessage::Interim {
                    worker: self.process.pid(),
                    value,
                }),
            )
            .await
            .map(|_| ())
    }
}

/// Server behavior driving a user [`Worker`].
pub(crate) struct WorkerServer {
    user: Box<dyn Worker>,
    job: Option<SagaJob>,
}

impl WorkerServer {
    pub(crate) fn new(user: Box<dyn Worker>) -> Self {
        WorkerServer { user, job: None }
    }
}

#[async_trait]
impl Server for WorkerServer {
    async fn handle_cast(&mut self, process: &ProcessHandle, message: Term) -> Status {
        match message {
            Term::Job(JobMessage::Start(job)) => {
                self.job = Some(job.clone());
                let worker = WorkerProcess {
                    process: process.clone(),
                    job: job.clone(),
                };
                match self.user.handle_start_job(&worker, job.clone()).await {
                    Ok(()) if job.commit => Status::Ok,
                    Ok(()) => Status::Stop,
                    Err(e) => Status::StopReason(e.to_string()),
                }
            }
            Term::Job(JobMessage::Cancel) => {
                if let Some(job) = self.job.clone() {
                    let worker = WorkerProcess {
                        process: process.clone(),
                        job,
                    };
                    self.user.handle_cancel_job(&worker).await;
                }
                Status::StopReason("cancel".to_string())
            }
            Term::Job(JobMessage::Commit) => {
                if let Some(job) = self.job.clone() {
                    let worker = WorkerProcess {
                        process: process.clone(),
                        job: job.clone(),
                    };
                    self.user.handle_commit_job(&worker, job).await;
                }
                Status::Stop
            }
            other => {
                warn!(worker = %process.pid(), ?other, "unexpected cast");
                Status::Ok
            }
        }
    }

    async fn handle_info(&mut self, process: &ProcessHandle, message: Term) -> Status {
        match self.job.clone() {
            Some(job) => {
                let worker = WorkerProcess {
                    process: process.clone(),
                    job,
                };
                self.user.handle_worker_info(&worker, message).await
            }
            None => Status::Ok,
        }
    }
}
