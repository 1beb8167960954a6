//! Trellis
//!
//! An actor runtime modeled on the classic behavioral pattern catalog: a
//! generic request/response server behavior, a supervised worker pool, and a
//! distributed multi-hop saga transaction coordinator built on top of them.
//!
//! # Architecture
//!
//! - A [`Node`](node::Node) registers processes, mints references, and owns
//!   the link and monitor tables.
//! - A process is a mailbox-consuming task driving a [`Server`](server::Server)
//!   behavior. Call, cast and info callbacks run on their own tasks,
//!   serialized by a per-process mutex, so a callback may issue a
//!   synchronous call while the loop keeps draining the mailbox.
//! - A [`Saga`](saga::Saga) is a server coordinating transactions across a
//!   chain of participants, with hop, lifespan, loop and capacity gates,
//!   supervised worker jobs, and optional two-phase commit.
//!
//! # Example
//!
//! ```rust,no_run
//! use trellis::{Node, ProcessOptions, SagaServer};
//! # use trellis::{Saga, SagaContext, SagaOptions, Status, TransactionId, Error};
//! # use async_trait::async_trait;
//! # use serde_json::{json, Value};
//! # struct Relay;
//! # #[async_trait]
//! # impl Saga for Relay {
//! #     async fn init_saga(&mut self, _: &SagaContext) -> Result<SagaOptions, Error> {
//! #         Ok(SagaOptions::default())
//! #     }
//! #     async fn handle_tx_new(&mut self, saga: &SagaContext, tx: TransactionId, v: Value) -> Status {
//! #         let _ = saga.send_result(tx, v).await;
//! #         Status::Ok
//! #     }
//! #     async fn handle_tx_result(&mut self, _: &SagaContext, _: TransactionId, _: trellis::StepId, _: Value) -> Status { Status::Ok }
//! #     async fn handle_tx_cancel(&mut self, _: &SagaContext, _: TransactionId, _: &str) -> Status { Status::Ok }
//! # }
//!
//! # async fn demo() -> Result<(), Error> {
//! let node = Node::start("demo@localhost");
//! let _saga = node
//!     .spawn("relay", ProcessOptions::default(), SagaServer::new(Relay))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod id;
pub mod message;
pub mod node;
pub mod process;
pub mod saga;
pub mod server;

pub use error::Error;
pub use id::{JobId, Pid, Ref, StepId, Target, TransactionId};
pub use message::{CallFrom, ControlRequest, DirectReply, Down, Exit, ReplyTag, Term};
pub use node::Node;
pub use process::{ProcessHandle, ProcessOptions};
pub use saga::{
    JobMessage, JobOptions, NextOptions, Saga, SagaContext, SagaDirect, SagaJob, SagaMessage,
    SagaOptions, SagaServer, SagaStats, Step, TransactionOptions, Worker, WorkerFactory,
    WorkerProcess,
};
pub use server::{ControlPlane, Server, Status};
