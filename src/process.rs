//! The process abstraction.
//!
//! A process owns a mailbox, a direct-request channel, a graceful-exit
//! channel, a kill flag (the cancellation root), links and monitors held in
//! the node tables, an environment map, and the behavior state driven by the
//! server loop. [`ProcessHandle`] is the cheaply clonable face of all of it.

use crate::error::Error;
use crate::id::{Pid, Ref, Target};
use crate::message::{
    CallFrom, ControlRequest, DirectMessage, DirectReply, DirectRequest, Envelope, ExitSignal,
    MailboxMessage, ReplyTag, Term,
};
use crate::node::{Node, NodeInner};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

/// Default timeout for synchronous calls and direct requests.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for spawning a process.
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Mailbox capacity.
    pub mailbox_size: usize,
    /// Initial environment variables.
    pub env: HashMap<String, Value>,
    /// Whether link-exit signals are converted to info messages.
    pub trap_exit: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        ProcessOptions {
            mailbox_size: 256,
            env: HashMap::new(),
            trap_exit: false,
        }
    }
}

pub(crate) struct ProcessInner {
    pid: Pid,
    name: Option<String>,
    node: Weak<NodeInner>,
    mailbox: mpsc::Sender<Envelope>,
    direct: mpsc::Sender<DirectMessage>,
    exit: mpsc::Sender<ExitSignal>,
    kill: watch::Sender<bool>,
    reply_slots: Mutex<HashMap<Ref, oneshot::Sender<Term>>>,
    env: Mutex<HashMap<String, Value>>,
    trap_exit: AtomicBool,
    alive: AtomicBool,
}

/// A handle to a running process.
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<ProcessInner>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.inner.pid)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl ProcessHandle {
    pub(crate) fn new(
        pid: Pid,
        name: Option<String>,
        node: Weak<NodeInner>,
        mailbox: mpsc::Sender<Envelope>,
        direct: mpsc::Sender<DirectMessage>,
        exit: mpsc::Sender<ExitSignal>,
        kill: watch::Sender<bool>,
        options: &ProcessOptions,
    ) -> Self {
        ProcessHandle {
            inner: Arc::new(ProcessInner {
                pid,
                name,
                node,
                mailbox,
                direct,
                exit,
                kill,
                reply_slots: Mutex::new(HashMap::new()),
                env: Mutex::new(options.env.clone()),
                trap_exit: AtomicBool::new(options.trap_exit),
                alive: AtomicBool::new(true),
            }),
        }
    }

    /// The process identifier.
    pub fn pid(&self) -> Pid {
        self.inner.pid.clone()
    }

    /// The registered name, if the process was spawned with one.
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The owning node.
    pub fn node(&self) -> Result<Node, Error> {
        self.inner
            .node
            .upgrade()
            .map(Node::from_inner)
            .ok_or(Error::NodeStopped)
    }

    /// Whether the process is still alive.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.inner.alive.store(false, Ordering::Release);
    }

    /// Whether link-exit signals are trapped into info messages.
    pub fn trap_exit(&self) -> bool {
        self.inner.trap_exit.load(Ordering::Acquire)
    }

    /// Enable or disable trap-exit.
    pub fn set_trap_exit(&self, trap: bool) {
        self.inner.trap_exit.store(trap, Ordering::Release);
    }

    /// Read an environment variable.
    pub fn env(&self, name: &str) -> Option<Value> {
        self.inner.env.lock().get(name).cloned()
    }

    /// Set an environment variable; `None` removes it.
    pub fn set_env(&self, name: &str, value: Option<Value>) {
        let mut env = self.inner.env.lock();
        match value {
            Some(v) => {
                env.insert(name.to_string(), v);
            }
            None => {
                env.remove(name);
            }
        }
    }

    /// Snapshot of the environment map.
    pub fn list_env(&self) -> HashMap<String, Value> {
        self.inner.env.lock().clone()
    }

    /// Send an info message.
    pub async fn send(&self, to: &Target, message: Term) -> Result<(), Error> {
        let node = self.node()?;
        let target = node.resolve(to)?;
        target
            .deliver(Envelope {
                from: self.pid(),
                message: MailboxMessage::Info(message),
            })
            .await
    }

    /// Send an asynchronous request.
    pub async fn cast(&self, to: &Target, message: Term) -> Result<(), Error> {
        let node = self.node()?;
        let target = node.resolve(to)?;
        target
            .deliver(Envelope {
                from: self.pid(),
                message: MailboxMessage::Cast(message),
            })
            .await
    }

    /// Make a synchronous call with the default timeout.
    ///
    /// Must only be used from inside a callback of this process: the reply
    /// arrives in this process's mailbox and is plexed by its own loop.
    pub async fn call(&self, to: &Target, request: Term) -> Result<Term, Error> {
        self.call_timeout(to, request, DEFAULT_CALL_TIMEOUT).await
    }

    /// Make a synchronous call with an explicit timeout.
    pub async fn call_timeout(
        &self,
        to: &Target,
        request: Term,
        timeout: Duration,
    ) -> Result<Term, Error> {
        let node = self.node()?;
        let target = node.resolve(to)?;
        let reference = node.make_ref();
        let (tx, rx) = oneshot::channel();
        self.inner.reply_slots.lock().insert(reference, tx);

        let envelope = Envelope {
            from: self.pid(),
            message: MailboxMessage::Call {
                from: CallFrom {
                    pid: self.pid(),
                    reply_to: ReplyTag::Ref(reference),
                },
                request,
            },
        };
        if target.deliver(envelope).await.is_err() {
            self.inner.reply_slots.lock().remove(&reference);
            return Err(Error::NoProcess);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ServerTerminated),
            Err(_) => {
                self.inner.reply_slots.lock().remove(&reference);
                Err(Error::Timeout)
            }
        }
    }

    /// Make a direct request with a user payload.
    pub async fn direct(&self, request: Term) -> Result<Term, Error> {
        match self
            .direct_request(DirectRequest::User(request), DEFAULT_CALL_TIMEOUT)
            .await?
        {
            DirectReply::Term(t) => Ok(t),
            _ => Err(Error::UnsupportedRequest),
        }
    }

    /// Make a control-plane direct request.
    pub async fn control(&self, request: ControlRequest) -> Result<DirectReply, Error> {
        self.direct_request(DirectRequest::Control(request), DEFAULT_CALL_TIMEOUT)
            .await
    }

    async fn direct_request(
        &self,
        request: DirectRequest,
        timeout: Duration,
    ) -> Result<DirectReply, Error> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .direct
            .send(DirectMessage { request, reply: tx })
            .await
            .map_err(|_| Error::ServerTerminated)?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ServerTerminated),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Request a graceful stop of this process.
    ///
    /// A trap-exit process receives the signal as an info message instead of
    /// terminating; use [`ProcessHandle::kill`] to stop unconditionally.
    pub async fn exit(&self, reason: &str) {
        let _ = self
            .inner
            .exit
            .send(ExitSignal {
                from: self.pid(),
                reason: reason.to_string(),
            })
            .await;
    }

    /// Stop the process unconditionally with reason `"kill"`.
    pub fn kill(&self) {
        self.inner.kill.send_replace(true);
    }

    /// Link this process to a peer; the peer's exit is delivered as an exit
    /// signal (or, with trap-exit, an info message).
    pub async fn link(&self, peer: &Pid) {
        if let Ok(node) = self.node() {
            node.link(self.pid(), peer.clone()).await;
        }
    }

    /// Remove the link with a peer.
    pub fn unlink(&self, peer: &Pid) {
        if let Ok(node) = self.node() {
            node.unlink(&self.pid(), peer);
        }
    }

    /// Install a monitor on a target; a `Down` info message is delivered when
    /// the target exits, or immediately with reason `"noproc"` when the
    /// target does not exist.
    pub async fn monitor(&self, target: &Target) -> Ref {
        match self.node() {
            Ok(node) => node.monitor(self.pid(), target).await,
            Err(_) => Ref::nil(),
        }
    }

    /// Remove a monitor; returns false when the reference is unknown.
    pub fn demonitor(&self, reference: Ref) -> bool {
        match self.node() {
            Ok(node) => node.demonitor(reference),
            Err(_) => false,
        }
    }

    pub(crate) async fn deliver(&self, envelope: Envelope) -> Result<(), Error> {
        self.inner
            .mailbox
            .send(envelope)
            .await
            .map_err(|_| Error::NoProcess)
    }

    pub(crate) async fn deliver_exit(&self, signal: ExitSignal) {
        let _ = self.inner.exit.send(signal).await;
    }

    /// Hand an incoming reply to the outstanding call that minted `reference`.
    pub(crate) fn put_reply(&self, reference: Ref, payload: Term) {
        if let Some(slot) = self.inner.reply_slots.lock().remove(&reference) {
            let _ = slot.send(payload);
        } else {
            tracing::debug!(pid = %self.pid(), %reference, "dropping reply with no outstanding call");
        }
    }
}
