//! The in-memory node registrar.
//!
//! The node owns the process tables: pid and name registries, the alias table
//! for out-of-actor synchronous calls, and the link and monitor tables. It
//! mints pids and references, spawns server processes, and turns process
//! termination into monitor and link notifications. Cluster transport is out
//! of scope; a remote target resolves only when it names this node.

use crate::error::Error;
use crate::id::{Pid, Ref, Target};
use crate::message::{
    CallFrom, Down, Envelope, ExitSignal, MailboxMessage, ReplyTag, Term,
};
use crate::process::{ProcessHandle, ProcessOptions, DEFAULT_CALL_TIMEOUT};
use crate::server::{run_server, Server, ServerChannels};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

struct MonitorEntry {
    watcher: Pid,
    target: Pid,
}

#[derive(Default)]
struct MonitorTable {
    by_ref: HashMap<Ref, MonitorEntry>,
    by_target: HashMap<Pid, Vec<Ref>>,
    by_watcher: HashMap<Pid, HashSet<Ref>>,
}

pub(crate) struct NodeInner {
    name: String,
    creation: u32,
    next_id: AtomicU64,
    procs: DashMap<Pid, ProcessHandle>,
    names: DashMap<String, Pid>,
    aliases: DashMap<Ref, oneshot::Sender<Term>>,
    monitors: Mutex<MonitorTable>,
    links: Mutex<HashMap<Pid, HashSet<Pid>>>,
}

/// A running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node with the given name.
    pub fn start(name: &str) -> Self {
        Node {
            inner: Arc::new(NodeInner {
                name: name.to_string(),
                creation: chrono::Utc::now().timestamp() as u32,
                next_id: AtomicU64::new(1),
                procs: DashMap::new(),
                names: DashMap::new(),
                aliases: DashMap::new(),
                monitors: Mutex::new(MonitorTable::default()),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Node { inner }
    }

    /// The node name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mint a fresh node-unique reference.
    pub fn make_ref(&self) -> Ref {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        Ref {
            creation: self.inner.creation,
            id: [(n >> 32) as u32, n as u32, 0],
        }
    }

    fn mint_pid(&self) -> Pid {
        Pid {
            node: self.inner.name.clone(),
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            serial: 0,
            creation: self.inner.creation,
        }
    }

    /// Look up a process by pid.
    pub fn process_by_pid(&self, pid: &Pid) -> Option<ProcessHandle> {
        self.inner.procs.get(pid).map(|h| h.clone())
    }

    /// Look up a process by registered name.
    pub fn process_by_name(&self, name: &str) -> Option<ProcessHandle> {
        let pid = self.inner.names.get(name)?.clone();
        self.process_by_pid(&pid)
    }

    /// Resolve a target to a live process handle.
    pub fn resolve(&self, target: &Target) -> Result<ProcessHandle, Error> {
        match target {
            Target::Pid(pid) => self.process_by_pid(pid).ok_or(Error::NoProcess),
            Target::Name(name) => self.process_by_name(name).ok_or(Error::NoProcess),
            Target::Remote { name, node } => {
                if node == &self.inner.name {
                    self.process_by_name(name).ok_or(Error::NoProcess)
                } else {
                    Err(Error::NoProcess)
                }
            }
        }
    }

    /// Spawn a server process.
    ///
    /// Runs the behavior's `init` before returning; an init error aborts the
    /// spawn. An empty name leaves the process unregistered.
    pub async fn spawn<S: Server>(
        &self,
        name: &str,
        options: ProcessOptions,
        behavior: S,
    ) -> Result<ProcessHandle, Error> {
        if !name.is_empty() && self.inner.names.contains_key(name) {
            return Err(Error::AlreadyRegistered(name.to_string()));
        }

        let pid = self.mint_pid();
        let (mailbox_tx, mailbox_rx) = mpsc::channel(options.mailbox_size.max(1));
        let (direct_tx, direct_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = mpsc::channel(8);
        let (kill_tx, kill_rx) = watch::channel(false);

        let handle = ProcessHandle::new(
            pid.clone(),
            (!name.is_empty()).then(|| name.to_string()),
            Arc::downgrade(&self.inner),
            mailbox_tx,
            direct_tx,
            exit_tx,
            kill_tx,
            &options,
        );

        self.inner.procs.insert(pid.clone(), handle.clone());
        if !name.is_empty() {
            self.inner.names.insert(name.to_string(), pid.clone());
        }

        let control = behavior.control();
        let behavior = Arc::new(tokio::sync::Mutex::new(behavior));
        {
            let mut guard = behavior.lock().await;
            if let Err(e) = guard.init(&handle).await {
                drop(guard);
                self.unregister(&handle);
                return Err(e);
            }
        }

        let channels = ServerChannels {
            mailbox: mailbox_rx,
            direct: direct_rx,
            exit: exit_rx,
            kill: kill_rx,
        };
        let node = self.clone();
        let driver_handle = handle.clone();
        tokio::spawn(async move {
            let reason = run_server(driver_handle.clone(), behavior, control, channels).await;
            debug!(pid = %driver_handle.pid(), %reason, "process terminated");
            node.handle_exit(&driver_handle, &reason).await;
        });

        Ok(handle)
    }

    fn unregister(&self, handle: &ProcessHandle) {
        handle.mark_dead();
        self.inner.procs.remove(&handle.pid());
        if let Some(name) = handle.name() {
            self.inner
                .names
                .remove_if(name, |_, pid| *pid == handle.pid());
        }
    }

    /// Tear down a terminated process: fire monitors, signal links, drop
    /// registrations.
    pub(crate) async fn handle_exit(&self, handle: &ProcessHandle, reason: &str) {
        let pid = handle.pid();
        self.unregister(handle);

        let fired: Vec<(Ref, Pid)> = {
            let mut table = self.inner.monitors.lock();
            let refs = table.by_target.remove(&pid).unwrap_or_default();
            let fired: Vec<(Ref, Pid)> = refs
                .into_iter()
                .filter_map(|r| table.by_ref.remove(&r).map(|e| (r, e.watcher)))
                .collect();
            for (r, watcher) in &fired {
                if let Some(owned) = table.by_watcher.get_mut(watcher) {
                    owned.remove(r);
                }
            }
            if let Some(owned) = table.by_watcher.remove(&pid) {
                for r in owned {
                    if let Some(entry) = table.by_ref.remove(&r) {
                        if let Some(refs) = table.by_target.get_mut(&entry.target) {
                            refs.retain(|x| *x != r);
                        }
                    }
                }
            }
            fired
        };
        for (reference, watcher) in fired {
            if let Some(target) = self.process_by_pid(&watcher) {
                let down = Down {
                    reference,
                    pid: pid.clone(),
                    reason: reason.to_string(),
                };
                let _ = target
                    .deliver(Envelope {
                        from: pid.clone(),
                        message: MailboxMessage::Info(Term::Down(down)),
                    })
                    .await;
            }
        }

        let peers: Vec<Pid> = {
            let mut links = self.inner.links.lock();
            let peers: Vec<Pid> = links.remove(&pid).map(|s| s.into_iter().collect()).unwrap_or_default();
            for peer in &peers {
                if let Some(set) = links.get_mut(peer) {
                    set.remove(&pid);
                    if set.is_empty() {
                        links.remove(peer);
                    }
                }
            }
            peers
        };
        for peer in peers {
            if let Some(target) = self.process_by_pid(&peer) {
                target
                    .deliver_exit(ExitSignal {
                        from: pid.clone(),
                        reason: reason.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Install a monitor from `watcher` on `target`.
    pub(crate) async fn monitor(&self, watcher: Pid, target: &Target) -> Ref {
        let reference = self.make_ref();
        match self.resolve(target) {
            Ok(handle) => {
                let mut table = self.inner.monitors.lock();
                table.by_ref.insert(
                    reference,
                    MonitorEntry {
                        watcher: watcher.clone(),
                        target: handle.pid(),
                    },
                );
                table
                    .by_target
                    .entry(handle.pid())
                    .or_default()
                    .push(reference);
                table.by_watcher.entry(watcher).or_default().insert(reference);
            }
            Err(_) => {
                let pid = match target {
                    Target::Pid(p) => p.clone(),
                    _ => Pid {
                        node: self.inner.name.clone(),
                        ..Default::default()
                    },
                };
                if let Some(w) = self.process_by_pid(&watcher) {
                    let down = Down {
                        reference,
                        pid: pid.clone(),
                        reason: "noproc".to_string(),
                    };
                    let _ = w
                        .deliver(Envelope {
                            from: pid,
                            message: MailboxMessage::Info(Term::Down(down)),
                        })
                        .await;
                }
            }
        }
        reference
    }

    /// Remove a monitor. Returns false when the reference is unknown.
    pub(crate) fn demonitor(&self, reference: Ref) -> bool {
        let mut table = self.inner.monitors.lock();
        match table.by_ref.remove(&reference) {
            Some(entry) => {
                if let Some(refs) = table.by_target.get_mut(&entry.target) {
                    refs.retain(|r| *r != reference);
                }
                if let Some(refs) = table.by_watcher.get_mut(&entry.watcher) {
                    refs.remove(&reference);
                }
                true
            }
            None => false,
        }
    }

    /// Create a symmetric link between two processes. Linking to a dead
    /// process delivers an immediate `"noproc"` exit signal.
    pub(crate) async fn link(&self, a: Pid, b: Pid) {
        if self.process_by_pid(&b).is_none() {
            if let Some(handle) = self.process_by_pid(&a) {
                handle
                    .deliver_exit(ExitSignal {
                        from: b,
                        reason: "noproc".to_string(),
                    })
                    .await;
            }
            return;
        }
        let mut links = self.inner.links.lock();
        links.entry(a.clone()).or_default().insert(b.clone());
        links.entry(b).or_default().insert(a);
    }

    /// Remove the link between two processes.
    pub(crate) fn unlink(&self, a: &Pid, b: &Pid) {
        let mut links = self.inner.links.lock();
        if let Some(set) = links.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = links.get_mut(b) {
            set.remove(a);
        }
    }

    /// Send an info message from outside any process.
    pub async fn send(&self, to: &Target, message: Term) -> Result<(), Error> {
        let target = self.resolve(to)?;
        target
            .deliver(Envelope {
                from: self.system_pid(),
                message: MailboxMessage::Info(message),
            })
            .await
    }

    /// Send an asynchronous request from outside any process.
    pub async fn cast(&self, to: &Target, message: Term) -> Result<(), Error> {
        let target = self.resolve(to)?;
        target
            .deliver(Envelope {
                from: self.system_pid(),
                message: MailboxMessage::Cast(message),
            })
            .await
    }

    /// Make a synchronous call from outside any process, with the default
    /// timeout.
    ///
    /// The reply travels through the node alias table, so the caller does not
    /// need a mailbox.
    pub async fn call(&self, to: &Target, request: Term) -> Result<Term, Error> {
        self.call_timeout(to, request, DEFAULT_CALL_TIMEOUT).await
    }

    /// Make an out-of-actor synchronous call with an explicit timeout.
    pub async fn call_timeout(
        &self,
        to: &Target,
        request: Term,
        timeout: Duration,
    ) -> Result<Term, Error> {
        let target = self.resolve(to)?;
        let reference = self.make_ref();
        let (tx, rx) = oneshot::channel();
        self.inner.aliases.insert(reference, tx);

        let from = self.mint_pid();
        let envelope = Envelope {
            from: from.clone(),
            message: MailboxMessage::Call {
                from: CallFrom {
                    pid: from,
                    reply_to: ReplyTag::Alias(reference),
                },
                request,
            },
        };
        if target.deliver(envelope).await.is_err() {
            self.inner.aliases.remove(&reference);
            return Err(Error::NoProcess);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::ServerTerminated),
            Err(_) => {
                self.inner.aliases.remove(&reference);
                Err(Error::Timeout)
            }
        }
    }

    /// Route a reply through the alias table.
    pub(crate) fn reply_alias(&self, reference: Ref, payload: Term) {
        if let Some((_, slot)) = self.inner.aliases.remove(&reference) {
            let _ = slot.send(payload);
        } else {
            debug!(%reference, "dropping alias reply with no waiting caller");
        }
    }

    fn system_pid(&self) -> Pid {
        Pid {
            node: self.inner.name.clone(),
            id: 0,
            serial: 0,
            creation: self.inner.creation,
        }
    }

    /// Kill every process on the node.
    pub fn stop(&self) {
        for entry in self.inner.procs.iter() {
            entry.value().kill();
        }
    }
}
