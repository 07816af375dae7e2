//! Addressable units the suite probes, configures or executes commands on

use std::fmt;

/// An addressable unit: a CPU core, a node, or a pod.
///
/// Targets are enumerated once per scenario and never mutated afterwards.
/// Identity is the index or name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    /// A logical CPU core by index
    Cpu(u32),
    /// A cluster node by name
    Node(String),
    /// A pod by namespace and name
    Pod {
        /// Namespace of the pod
        namespace: String,
        /// Name of the pod
        name: String,
    },
}

impl Target {
    /// Create a node target
    pub fn node(name: impl Into<String>) -> Self {
        Self::Node(name.into())
    }

    /// Create a pod target
    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Pod {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// CPU index, if this is a CPU target
    pub fn cpu_index(&self) -> Option<u32> {
        match self {
            Self::Cpu(index) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu(index) => write!(f, "cpu{index}"),
            Self::Node(name) => write!(f, "node/{name}"),
            Self::Pod { namespace, name } => write!(f, "pod/{namespace}/{name}"),
        }
    }
}

impl From<u32> for Target {
    fn from(index: u32) -> Self {
        Self::Cpu(index)
    }
}
