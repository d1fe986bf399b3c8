//! Configuration datastores.
//!
//! # Overview
//!
//! The server keeps three configuration trees: `running` (what the kernel
//! currently reflects), `candidate` (staged edits awaiting commit) and
//! `startup` (what is loaded at boot). All of them live behind a single
//! [`DatastoreManager`] that owns the lock table and the commit pipeline.
//!
//! # Key Components
//!
//! - [`DatastoreManager`]: locks, reads, edits, copies, validation, commit.
//! - [`edit`]: the edit-config tree merge algorithm.
//! - [`filter`]: subtree and XPath retrieval filters.
//! - [`delta`]: lowering of configuration trees to kernel operations.
//! - [`startup`]: persisted startup configuration.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): sessions that drive these operations.
//! - [`adapter`](crate::adapter): the kernel and schema collaborators.
pub mod datastore;
pub mod delta;
pub mod edit;
pub mod filter;
pub mod startup;

use std::{fmt, str::FromStr};

pub use datastore::DatastoreManager;
pub use error::DatastoreError;

use crate::tree::Node;

/// The three configuration datastores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatastoreId {
    Running,
    Candidate,
    Startup,
}

impl DatastoreId {
    pub const ALL: [DatastoreId; 3] = [
        DatastoreId::Running,
        DatastoreId::Candidate,
        DatastoreId::Startup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatastoreId::Running => "running",
            DatastoreId::Candidate => "candidate",
            DatastoreId::Startup => "startup",
        }
    }

    /// Read a `<target>` or `<source>` parameter: `<source><running/></source>`.
    pub fn from_node(node: &Node) -> Option<Self> {
        match node.children.as_slice() {
            [only] if only.is_empty() => only.name.parse().ok(),
            _ => None,
        }
    }

    pub fn to_node(&self, parameter: &str) -> Node {
        Node::new(parameter).with_child(Node::new(self.as_str()))
    }
}

/// Where copy-config and validate take their configuration from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Datastore(DatastoreId),
    /// An inline `<config>` element.
    Inline(Node),
}

impl ConfigSource {
    pub fn from_node(node: &Node) -> Option<Self> {
        if let Some(config) = node.child("config") {
            return Some(ConfigSource::Inline(config.clone()));
        }
        DatastoreId::from_node(node).map(ConfigSource::Datastore)
    }

    pub fn to_node(&self, parameter: &str) -> Node {
        match self {
            ConfigSource::Datastore(id) => id.to_node(parameter),
            ConfigSource::Inline(config) => {
                let mut config = config.clone();
                config.name = "config".to_string();
                Node::new(parameter).with_child(config)
            }
        }
    }
}

impl FromStr for DatastoreId {
    type Err = DatastoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| DatastoreError::UnknownDatastore(s.to_string()))
    }
}

impl fmt::Display for DatastoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub mod error {
    use std::io;

    use thiserror::Error;

    use crate::adapter::{KernelError, SchemaError};

    use super::{DatastoreId, edit::EditError, filter::FilterError};

    #[derive(Debug, Error)]
    pub enum DatastoreError {
        #[error("unknown datastore '{0}'")]
        UnknownDatastore(String),

        #[error("{datastore} is locked by session {holder}")]
        LockDenied { datastore: DatastoreId, holder: u32 },

        #[error("{0} is not locked by this session")]
        NotLockHolder(DatastoreId),

        #[error("candidate has uncommitted changes")]
        CandidateDirty,

        #[error("{0}")]
        NotSupported(String),

        #[error("{0}")]
        InvalidValue(String),

        #[error(transparent)]
        Edit(#[from] EditError),

        #[error(transparent)]
        Filter(#[from] FilterError),

        #[error("validation failed: {0}")]
        Validation(SchemaError),

        #[error("commit validation failed: {0}")]
        CommitValidation(SchemaError),

        #[error("kernel: {0}")]
        Kernel(#[from] KernelError),

        #[error("commit rejected ({error}) and revert failed: {revert}")]
        RollbackFailed {
            error: KernelError,
            revert: KernelError,
        },

        #[error("running configuration is inconsistent with the kernel after a failed revert")]
        Inconsistent,

        #[error("startup configuration: {0}")]
        Startup(SchemaError),

        #[error("startup file: {0}")]
        Io(#[from] io::Error),
    }
}
