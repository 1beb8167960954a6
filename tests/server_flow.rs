//! Integration tests for the node, process, and server loop layers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use trellis::{
    CallFrom, ControlPlane, ControlRequest, DirectReply, Error, Node, Pid, ProcessHandle,
    ProcessOptions, Server, Status, Target, Term,
};

fn start_node(name: &str) -> Node {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
    Node::start(name)
}

async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    for _ in 0..100 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting until {what}");
}

struct Echo {
    count: u32,
}

#[async_trait]
impl Server for Echo {
    async fn handle_call(
        &mut self,
        process: &ProcessHandle,
        _from: CallFrom,
        request: Term,
    ) -> (Option<Term>, Status) {
        let Term::Value(value) = request else {
            return (None, Status::Ok);
        };
        if value == json!("count") {
            return (Some(Term::value(self.count)), Status::Ok);
        }
        if value == json!("stop") {
            return (Some(Term::value("stopping")), Status::Stop);
        }
        if value == json!("silence") {
            return (None, Status::Ignore);
        }
        if let Some(to) = value.get("relay_to").and_then(Value::as_str) {
            let to = to.to_string();
            let payload = value["payload"].clone();
            let reply = process.call(&Target::Name(to), Term::Value(payload)).await;
            return match reply {
                Ok(reply) => (Some(reply), Status::Ok),
                Err(e) => (Some(Term::value(e.to_string())), Status::Ok),
            };
        }
        (Some(Term::Value(value)), Status::Ok)
    }

    async fn handle_cast(&mut self, _process: &ProcessHandle, message: Term) -> Status {
        if let Term::Value(value) = &message {
            if value.as_str() == Some("panic") {
                panic!("boom");
            }
        }
        self.count += 1;
        Status::Ok
    }

    fn control(&self) -> Option<Arc<dyn ControlPlane>> {
        Some(Arc::new(EchoControl))
    }
}

/// The direct plane of [`Echo`]; runs inline on the loop task, unlocked.
struct EchoControl;

#[async_trait]
impl ControlPlane for EchoControl {
    async fn handle_control(
        &self,
        _process: &ProcessHandle,
        _request: ControlRequest,
    ) -> Result<DirectReply, Error> {
        Err(Error::UnsupportedRequest)
    }

    async fn handle_direct(
        &self,
        _process: &ProcessHandle,
        request: Term,
    ) -> Result<Term, Error> {
        if let Term::Value(value) = &request {
            if value.as_str() == Some("ping") {
                return Ok(Term::value("pong"));
            }
        }
        Err(Error::UnsupportedRequest)
    }
}

/// Monitors a named process and reports what it sees.
struct Watcher {
    target: Target,
    events: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl Server for Watcher {
    async fn init(&mut self, process: &ProcessHandle) -> Result<(), Error> {
        process.monitor(&self.target).await;
        Ok(())
    }

    async fn handle_info(&mut self, _process: &ProcessHandle, message: Term) -> Status {
        match message {
            Term::Down(down) => {
                let _ = self.events.send(("down".into(), down.reason));
            }
            Term::Exit(exit) => {
                let _ = self.events.send(("exit".into(), exit.reason));
            }
            _ => {}
        }
        Status::Ok
    }
}

/// Links to a peer and traps its exit.
struct Linker {
    peer: Pid,
    events: mpsc::UnboundedSender<(String, String)>,
}

#[async_trait]
impl Server for Linker {
    async fn init(&mut self, process: &ProcessHandle) -> Result<(), Error> {
        process.link(&self.peer).await;
        Ok(())
    }

    async fn handle_info(&mut self, _process: &ProcessHandle, message: Term) -> Status {
        if let Term::Exit(exit) = message {
            let _ = self.events.send(("exit".into(), exit.reason));
        }
        Status::Ok
    }
}

#[tokio::test]
async fn call_echoes_through_the_alias_path() -> anyhow::Result<()> {
    let node = start_node("srv01@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await?;

    let reply = node
        .call(&Target::Pid(echo.pid()), Term::value(json!({"a": 1})))
        .await?;
    match reply {
        Term::Value(v) => assert_eq!(v, json!({"a": 1})),
        other => panic!("unexpected reply: {other:?}"),
    }
    node.stop();
    Ok(())
}

#[tokio::test]
async fn casts_mutate_state_observed_by_calls() {
    let node = start_node("srv02@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    let target = Target::Pid(echo.pid());

    let caster = node
        .spawn("caster", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    for _ in 0..3 {
        caster.cast(&target, Term::value("bump")).await.unwrap();
    }

    // casts are asynchronous; poll until the state catches up
    let mut last = json!(null);
    for _ in 0..100 {
        let reply = node.call(&target, Term::value("count")).await.unwrap();
        if let Term::Value(v) = reply {
            last = v;
            if last == json!(3) {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(last, json!(3));
    node.stop();
}

#[tokio::test]
async fn a_callback_can_call_another_server() {
    let node = start_node("srv03@localhost");
    node.spawn("left", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    node.spawn("right", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    // left's call callback blocks on a call to right; left's loop must keep
    // draining its mailbox so the reply can be plexed through
    let reply = node
        .call(
            &Target::Name("left".into()),
            Term::value(json!({"relay_to": "right", "payload": "hello"})),
        )
        .await
        .unwrap();
    match reply {
        Term::Value(v) => assert_eq!(v, json!("hello")),
        other => panic!("unexpected reply: {other:?}"),
    }
    node.stop();
}

#[tokio::test]
async fn stop_status_terminates_with_normal_reason() {
    let node = start_node("srv04@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    node.spawn(
        "watcher",
        ProcessOptions::default(),
        Watcher {
            target: Target::Pid(echo.pid()),
            events: tx,
        },
    )
    .await
    .unwrap();

    let reply = node
        .call(&Target::Pid(echo.pid()), Term::value("stop"))
        .await
        .unwrap();
    match reply {
        Term::Value(v) => assert_eq!(v, json!("stopping")),
        other => panic!("unexpected reply: {other:?}"),
    }

    assert_eq!(next_event(&mut rx).await, ("down".into(), "normal".into()));
    wait_until("echo is gone", || !echo.is_alive()).await;
    node.stop();
}

#[tokio::test]
async fn a_panicking_callback_becomes_a_panic_exit() {
    let node = start_node("srv05@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    node.spawn(
        "watcher",
        ProcessOptions::default(),
        Watcher {
            target: Target::Pid(echo.pid()),
            events: tx,
        },
    )
    .await
    .unwrap();

    let caster = node
        .spawn("caster", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    caster
        .cast(&Target::Pid(echo.pid()), Term::value("panic"))
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, ("down".into(), "panic".into()));
    node.stop();
}

#[tokio::test]
async fn kill_terminates_with_kill_reason() {
    let node = start_node("srv06@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    node.spawn(
        "watcher",
        ProcessOptions::default(),
        Watcher {
            target: Target::Pid(echo.pid()),
            events: tx,
        },
    )
    .await
    .unwrap();

    echo.kill();
    assert_eq!(next_event(&mut rx).await, ("down".into(), "kill".into()));
    node.stop();
}

#[tokio::test]
async fn monitoring_a_missing_process_fires_noproc() {
    let node = start_node("srv07@localhost");
    let (tx, mut rx) = mpsc::unbounded_channel();
    node.spawn(
        "watcher",
        ProcessOptions::default(),
        Watcher {
            target: Target::Name("nobody".into()),
            events: tx,
        },
    )
    .await
    .unwrap();

    assert_eq!(next_event(&mut rx).await, ("down".into(), "noproc".into()));
    node.stop();
}

#[tokio::test]
async fn trap_exit_converts_link_signals_to_info() {
    let node = start_node("srv08@localhost");
    let peer = node
        .spawn("peer", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ProcessOptions {
        trap_exit: true,
        ..Default::default()
    };
    let linker = node
        .spawn(
            "linker",
            options,
            Linker {
                peer: peer.pid(),
                events: tx,
            },
        )
        .await
        .unwrap();

    peer.kill();
    assert_eq!(next_event(&mut rx).await, ("exit".into(), "kill".into()));
    assert!(linker.is_alive());
    node.stop();
}

#[tokio::test]
async fn without_trap_exit_a_link_death_propagates() {
    let node = start_node("srv09@localhost");
    let peer = node
        .spawn("peer", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let linker = node
        .spawn(
            "linker",
            ProcessOptions::default(),
            Linker {
                peer: peer.pid(),
                events: tx,
            },
        )
        .await
        .unwrap();

    peer.kill();
    wait_until("linker dies with its peer", || !linker.is_alive()).await;
    node.stop();
}

#[tokio::test]
async fn ignore_leaves_the_caller_waiting() {
    let node = start_node("srv10@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let result = node
        .call_timeout(
            &Target::Pid(echo.pid()),
            Term::value("silence"),
            Duration::from_millis(300),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(echo.is_alive());
    node.stop();
}

#[tokio::test]
async fn direct_requests_reach_the_control_plane() {
    let node = start_node("srv11@localhost");
    let echo = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();

    let reply = echo.direct(Term::value("ping")).await.unwrap();
    match reply {
        Term::Value(v) => assert_eq!(v, json!("pong")),
        other => panic!("unexpected reply: {other:?}"),
    }

    let unsupported = echo.direct(Term::value("nonsense")).await;
    assert!(matches!(unsupported, Err(Error::UnsupportedRequest)));
    node.stop();
}

#[tokio::test]
async fn duplicate_names_are_rejected() {
    let node = start_node("srv12@localhost");
    node.spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    let result = node
        .spawn("echo", ProcessOptions::default(), Echo { count: 0 })
        .await;
    assert!(matches!(result, Err(Error::AlreadyRegistered(_))));
    node.stop();
}

/// No two callback bodies may run concurrently on the same process.
struct SerialProbe {
    busy: Arc<AtomicBool>,
    overlaps: Arc<AtomicU32>,
    seen: Arc<AtomicU32>,
}

#[async_trait]
impl Server for SerialProbe {
    async fn handle_cast(&mut self, _process: &ProcessHandle, _message: Term) -> Status {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.busy.store(false, Ordering::SeqCst);
        self.seen.fetch_add(1, Ordering::SeqCst);
        Status::Ok
    }
}

#[tokio::test]
async fn callbacks_are_serialized_per_process() {
    let node = start_node("srv13@localhost");
    let overlaps = Arc::new(AtomicU32::new(0));
    let seen = Arc::new(AtomicU32::new(0));
    let probe = node
        .spawn(
            "probe",
            ProcessOptions::default(),
            SerialProbe {
                busy: Arc::new(AtomicBool::new(false)),
                overlaps: overlaps.clone(),
                seen: seen.clone(),
            },
        )
        .await
        .unwrap();

    let caster = node
        .spawn("caster", ProcessOptions::default(), Echo { count: 0 })
        .await
        .unwrap();
    for _ in 0..5 {
        caster
            .cast(&Target::Pid(probe.pid()), Term::value("tick"))
            .await
            .unwrap();
    }

    wait_until("all casts processed", || seen.load(Ordering::SeqCst) == 5).await;
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    node.stop();
}

#[tokio::test]
async fn environment_map_is_readable_and_writable() -> anyhow::Result<()> {
    let node = start_node("srv14@localhost");
    let mut env = std::collections::HashMap::new();
    env.insert("region".to_string(), json!("eu-1"));
    let echo = node
        .spawn(
            "echo",
            ProcessOptions {
                env,
                ..Default::default()
            },
            Echo { count: 0 },
        )
        .await?;

    assert_eq!(echo.env("region"), Some(json!("eu-1")));
    echo.set_env("zone", Some(json!("a")));
    assert_eq!(echo.env("zone"), Some(json!("a")));
    echo.set_env("zone", None);
    assert_eq!(echo.env("zone"), None);
    node.stop();
    Ok(())
}
