//! Strongly-typed identifiers for processes, references, and saga entities.
//!
//! Every identifier is minted by a [`Node`](crate::node::Node) and is opaque
//! to user code, ensuring type safety and clear semantics across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque reference minted by a node.
///
/// A reference carries the node creation stamp plus three 32-bit id words.
/// References identify synchronous calls, monitors, transactions, steps and
/// jobs; equality and hashing are the only operations user code needs.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Ref {
    /// Creation stamp of the minting node.
    pub creation: u32,
    /// Node-unique id words.
    pub id: [u32; 3],
}

impl Ref {
    /// The nil reference (all zeros).
    pub fn nil() -> Self {
        Ref::default()
    }

    /// Whether this is the nil reference.
    pub fn is_nil(&self) -> bool {
        *self == Ref::default()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#Ref<{}.{}.{}.{}>",
            self.creation, self.id[0], self.id[1], self.id[2]
        )
    }
}

/// A process identifier.
///
/// Wire layout: owning node name plus id/serial/creation words.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pid {
    /// Name of the node the process lives on.
    pub node: String,
    /// Node-unique process id.
    pub id: u64,
    /// Serial counter, bumped when the id space wraps.
    pub serial: u32,
    /// Creation stamp of the owning node.
    pub creation: u32,
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}.{}>", self.node, self.id, self.serial)
    }
}

/// Identifier of a saga transaction.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TransactionId(pub Ref);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.0;
        write!(f, "TX#{}.{}.{}", r.id[0], r.id[1], r.id[2])
    }
}

/// Identifier of a saga step (a downstream dispatch).
///
/// A step id is the monitor reference installed on the step target, so a
/// `DOWN` for the target resolves directly to the step.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct StepId(pub Ref);

impl StepId {
    /// The nil step id, used as the origin of a locally started transaction.
    pub fn nil() -> Self {
        StepId(Ref::nil())
    }

    /// Whether this is the nil step id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.0;
        write!(f, "Step#{}.{}.{}", r.id[0], r.id[1], r.id[2])
    }
}

/// Identifier of a saga job (local work performed by a worker).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct JobId(pub Ref);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.0;
        write!(f, "Job#{}.{}.{}", r.id[0], r.id[1], r.id[2])
    }
}

/// Where a message can be addressed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// A process identifier.
    Pid(Pid),
    /// A locally registered name.
    Name(String),
    /// A registered name on another node.
    Remote {
        /// Registered name on the remote node.
        name: String,
        /// Remote node name.
        node: String,
    },
}

impl From<Pid> for Target {
    fn from(pid: Pid) -> Self {
        Target::Pid(pid)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Target::Name(name.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Pid(pid) => write!(f, "{}", pid),
            Target::Name(name) => write!(f, "{}", name),
            Target::Remote { name, node } => write!(f, "{}@{}", name, node),
        }
    }
}
