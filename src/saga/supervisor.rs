//! The worker supervisor.
//!
//! A one-for-one-dynamic supervisor with the temporary restart policy:
//! children are spawned on demand through the control plane and are never
//! restarted. Abnormal exits still count against the restart intensity
//! window; more than [`RESTART_INTENSITY`] of them within
//! [`RESTART_PERIOD`] seconds shut the supervisor down.

use crate::error::Error;
use crate::id::{Pid, Ref, Target};
use crate::message::{ControlRequest, DirectReply, Down, Term};
use crate::process::{ProcessHandle, ProcessOptions};
use crate::saga::types::WorkerFactory;
use crate::saga::worker::WorkerServer;
use crate::server::{ControlPlane, Server, Status};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Abnormal exits tolerated within one period.
pub const RESTART_INTENSITY: usize = 5;
/// Length of the intensity window in seconds.
pub const RESTART_PERIOD: i64 = 5;

#[derive(Default)]
struct SupervisorShared {
    children: Mutex<HashMap<Pid, Ref>>,
    exits: Mutex<VecDeque<i64>>,
}

/// Server behavior of the worker supervisor.
pub(crate) struct WorkerSupervisor {
    factory: WorkerFactory,
    shared: Arc<SupervisorShared>,
}

impl WorkerSupervisor {
    pub(crate) fn new(factory: WorkerFactory) -> Self {
        WorkerSupervisor {
            factory,
            shared: Arc::new(SupervisorShared::default()),
        }
    }
}

#[async_trait]
impl Server for WorkerSupervisor {
    async fn handle_info(&mut self, process: &ProcessHandle, message: Term) -> Status {
        match message {
            Term::Down(Down { pid, reason, .. }) => {
                if self.shared.children.lock().remove(&pid).is_none() {
                    return Status::Ok;
                }
                debug!(supervisor = %process.pid(), child = %pid, %reason, "worker exited");
                // temporary policy: never restart
                if reason != "normal" && reason != "cancel" {
                    let now = Utc::now().timestamp();
                    let mut exits = self.shared.exits.lock();
                    exits.push_back(now);
                    while exits
                        .front()
                        .is_some_and(|t| now - *t > RESTART_PERIOD)
                    {
                        exits.pop_front();
                    }
                    if exits.len() > RESTART_INTENSITY {
                        warn!(
                            supervisor = %process.pid(),
                            "restart intensity exceeded, shutting down"
                        );
                        return Status::StopReason("shutdown".to_string());
                    }
                }
                Status::Ok
            }
            _ => Status::Ok,
        }
    }

    async fn terminate(&mut self, process: &ProcessHandle, _reason: &str) {
        let children: Vec<Pid> = self.shared.children.lock().drain().map(|(pid, _)| pid).collect();
        if children.is_empty() {
            return;
        }
        let Ok(node) = process.node() else { return };
        for pid in children {
            if let Some(child) = node.process_by_pid(&pid) {
                child.kill();
            }
        }
    }

    fn control(&self) -> Option<Arc<dyn ControlPlane>> {
        Some(Arc::new(SupervisorControl {
            factory: self.factory.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct SupervisorControl {
    factory: WorkerFactory,
    shared: Arc<SupervisorShared>,
}

#[async_trait]
impl ControlPlane for SupervisorControl {
    async fn handle_control(
        &self,
        process: &ProcessHandle,
        request: ControlRequest,
    ) -> Result<DirectReply, Error> {
        match request {
            ControlRequest::StartWorker => {
                let node = process.node()?;
                let worker = node
                    .spawn(
                        "",
                        ProcessOptions::default(),
                        WorkerServer::new((self.factory)()),
                    )
                    .await?;
                let monitor = process.monitor(&Target::Pid(worker.pid())).await;
                self.shared.children.lock().insert(worker.pid(), monitor);
                Ok(DirectReply::Worker(worker.pid()))
            }
            _ => Err(Error::UnsupportedRequest),
        }
    }
}
