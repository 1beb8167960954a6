//! The generic request/response server behavior and its event loop.
//!
//! The loop multiplexes four input sources: the mailbox (one message per
//! iteration), the direct-request channel, the graceful-exit channel, and
//! the kill flag. Call, cast and info callbacks each run on their own task,
//! serialized by a per-process mutex around the behavior state, so a
//! callback may itself issue a synchronous call while the loop keeps
//! draining the mailbox (the reply is plexed on the loop task, which never
//! takes the behavior lock). Direct requests are handled inline on the loop
//! task, with no callback lock and no task — direct is reserved for the
//! actor's own control plane, so the handler is a `Sync` object installed
//! at spawn rather than a borrow of the callback-locked behavior state.

use crate::error::Error;
use crate::message::{
    CallFrom, ControlRequest, DirectMessage, DirectReply, DirectRequest, Envelope, ExitSignal,
    MailboxMessage, ReplyTag, Term,
};
use crate::process::ProcessHandle;
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, warn};

const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Continue; for a call, reply with the returned payload.
    Ok,
    /// Continue without replying.
    Ignore,
    /// Stop with reason `"normal"`.
    Stop,
    /// Stop with a custom reason.
    StopReason(String),
}

/// The direct-request plane of a server process.
///
/// Every direct request — runtime control variants and user payloads alike
/// — is handled inline on the loop task without the callback lock, so
/// implementations must carry their own synchronization and cannot reach
/// the callback-locked behavior state.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Handle a control request.
    async fn handle_control(
        &self,
        process: &ProcessHandle,
        request: ControlRequest,
    ) -> Result<DirectReply, Error>;

    /// Handle a direct request with a user payload.
    async fn handle_direct(
        &self,
        _process: &ProcessHandle,
        _request: Term,
    ) -> Result<Term, Error> {
        Err(Error::UnsupportedRequest)
    }
}

/// The server behavior: user callbacks driven by the event loop.
#[async_trait]
pub trait Server: Send + 'static {
    /// Invoked once before the loop starts. An error aborts the spawn.
    async fn init(&mut self, _process: &ProcessHandle) -> Result<(), Error> {
        Ok(())
    }

    /// Invoked on a synchronous call.
    async fn handle_call(
        &mut self,
        process: &ProcessHandle,
        _from: CallFrom,
        request: Term,
    ) -> (Option<Term>, Status) {
        warn!(pid = %process.pid(), ?request, "unhandled call");
        (Some(Term::Value(Value::from("ok"))), Status::Ok)
    }

    /// Invoked on an asynchronous cast.
    async fn handle_cast(&mut self, process: &ProcessHandle, message: Term) -> Status {
        warn!(pid = %process.pid(), ?message, "unhandled cast");
        Status::Ok
    }

    /// Invoked on any other message.
    async fn handle_info(&mut self, process: &ProcessHandle, message: Term) -> Status {
        warn!(pid = %process.pid(), ?message, "unhandled info");
        Status::Ok
    }

    /// Invoked once when the process terminates.
    async fn terminate(&mut self, _process: &ProcessHandle, _reason: &str) {}

    /// The direct-request plane of this behavior, if it has one.
    fn control(&self) -> Option<Arc<dyn ControlPlane>> {
        None
    }
}

pub(crate) struct ServerChannels {
    pub mailbox: mpsc::Receiver<Envelope>,
    pub direct: mpsc::Receiver<DirectMessage>,
    pub exit: mpsc::Receiver<ExitSignal>,
    pub kill: watch::Receiver<bool>,
}

/// Drive a server process until termination; returns the reason.
pub(crate) async fn run_server<S: Server>(
    process: ProcessHandle,
    behavior: Arc<Mutex<S>>,
    control: Option<Arc<dyn ControlPlane>>,
    mut ch: ServerChannels,
) -> String {
    let (stop_tx, mut stop_rx) = mpsc::channel::<String>(2);

    loop {
        tokio::select! {
            signal = ch.exit.recv() => {
                let Some(signal) = signal else {
                    return finish(&process, &behavior, "kill".to_string()).await;
                };
                if process.trap_exit() {
                    let exit = crate::message::Exit { pid: signal.from, reason: signal.reason };
                    dispatch_info(&behavior, &process, Term::Exit(exit), &stop_tx);
                } else {
                    return finish(&process, &behavior, signal.reason).await;
                }
            }

            Some(reason) = stop_rx.recv() => {
                return finish(&process, &behavior, reason).await;
            }

            envelope = ch.mailbox.recv() => {
                let Some(envelope) = envelope else {
                    return finish(&process, &behavior, "kill".to_string()).await;
                };
                match envelope.message {
                    MailboxMessage::Reply(reference, payload) => {
                        process.put_reply(reference, payload);
                    }
                    MailboxMessage::Call { from, request } => {
                        dispatch_call(&behavior, &process, from, request, &stop_tx);
                    }
                    MailboxMessage::Cast(message) => {
                        dispatch_cast(&behavior, &process, message, &stop_tx);
                    }
                    MailboxMessage::Info(message) => {
                        dispatch_info(&behavior, &process, message, &stop_tx);
                    }
                }
            }

            _ = ch.kill.changed() => {
                return finish(&process, &behavior, "kill".to_string()).await;
            }

            direct = ch.direct.recv() => {
                let Some(direct) = direct else {
                    return finish(&process, &behavior, "kill".to_string()).await;
                };
                // direct runs right here on the loop task: no callback
                // lock, no task
                match direct.request {
                    DirectRequest::Control(request) => {
                        let result = match &control {
                            Some(plane) => plane.handle_control(&process, request).await,
                            None => Err(Error::UnsupportedRequest),
                        };
                        let _ = direct.reply.send(result);
                    }
                    DirectRequest::User(request) => {
                        let result = match &control {
                            Some(plane) => plane.handle_direct(&process, request).await,
                            None => Err(Error::UnsupportedRequest),
                        };
                        let _ = direct.reply.send(result.map(DirectReply::Term));
                    }
                }
            }
        }
    }
}

async fn finish<S: Server>(
    process: &ProcessHandle,
    behavior: &Arc<Mutex<S>>,
    reason: String,
) -> String {
    let terminate = async {
        let mut guard = behavior.lock().await;
        guard.terminate(process, &reason).await;
    };
    if tokio::time::timeout(TERMINATE_TIMEOUT, terminate).await.is_err() {
        warn!(pid = %process.pid(), "terminate skipped, a callback is still running");
    }
    reason
}

fn dispatch_call<S: Server>(
    behavior: &Arc<Mutex<S>>,
    process: &ProcessHandle,
    from: CallFrom,
    request: Term,
    stop_tx: &mpsc::Sender<String>,
) {
    let behavior = behavior.clone();
    let process = process.clone();
    let stop_tx = stop_tx.clone();
    tokio::spawn(async move {
        let reply_to = from.clone();
        let callback = async {
            let mut guard = behavior.lock().await;
            guard.handle_call(&process, from, request).await
        };
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok((reply, status)) => match status {
                Status::Ok => {
                    let payload = reply.unwrap_or(Term::Value(Value::Null));
                    send_reply(&process, &reply_to, payload).await;
                }
                Status::Ignore => {}
                Status::Stop => {
                    if let Some(payload) = reply {
                        send_reply(&process, &reply_to, payload).await;
                    }
                    let _ = stop_tx.send("normal".to_string()).await;
                }
                Status::StopReason(reason) => {
                    if let Some(payload) = reply {
                        send_reply(&process, &reply_to, payload).await;
                    }
                    let _ = stop_tx.send(reason).await;
                }
            },
            Err(panic) => {
                error!(
                    pid = %process.pid(),
                    name = process.name().unwrap_or(""),
                    "call callback panicked: {}",
                    panic_message(&panic)
                );
                let _ = stop_tx.send("panic".to_string()).await;
            }
        }
    });
}

fn dispatch_cast<S: Server>(
    behavior: &Arc<Mutex<S>>,
    process: &ProcessHandle,
    message: Term,
    stop_tx: &mpsc::Sender<String>,
) {
    let behavior = behavior.clone();
    let process = process.clone();
    let stop_tx = stop_tx.clone();
    tokio::spawn(async move {
        let callback = async {
            let mut guard = behavior.lock().await;
            guard.handle_cast(&process, message).await
        };
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(status) => forward_status(status, &stop_tx).await,
            Err(panic) => {
                error!(
                    pid = %process.pid(),
                    name = process.name().unwrap_or(""),
                    "cast callback panicked: {}",
                    panic_message(&panic)
                );
                let _ = stop_tx.send("panic".to_string()).await;
            }
        }
    });
}

fn dispatch_info<S: Server>(
    behavior: &Arc<Mutex<S>>,
    process: &ProcessHandle,
    message: Term,
    stop_tx: &mpsc::Sender<String>,
) {
    let behavior = behavior.clone();
    let process = process.clone();
    let stop_tx = stop_tx.clone();
    tokio::spawn(async move {
        let callback = async {
            let mut guard = behavior.lock().await;
            guard.handle_info(&process, message).await
        };
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(status) => forward_status(status, &stop_tx).await,
            Err(panic) => {
                error!(
                    pid = %process.pid(),
                    name = process.name().unwrap_or(""),
                    "info callback panicked: {}",
                    panic_message(&panic)
                );
                let _ = stop_tx.send("panic".to_string()).await;
            }
        }
    });
}

async fn forward_status(status: Status, stop_tx: &mpsc::Sender<String>) {
    match status {
        Status::Ok | Status::Ignore => {}
        Status::Stop => {
            let _ = stop_tx.send("normal".to_string()).await;
        }
        Status::StopReason(reason) => {
            let _ = stop_tx.send(reason).await;
        }
    }
}

async fn send_reply(process: &ProcessHandle, from: &CallFrom, payload: Term) {
    let Ok(node) = process.node() else { return };
    match &from.reply_to {
        ReplyTag::Ref(reference) => {
            if let Some(caller) = node.process_by_pid(&from.pid) {
                let _ = caller
                    .deliver(Envelope {
                        from: process.pid(),
                        message: MailboxMessage::Reply(*reference, payload),
                    })
                    .await;
            }
        }
        ReplyTag::Alias(reference) => {
            node.reply_alias(*reference, payload);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
