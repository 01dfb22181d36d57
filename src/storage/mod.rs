//! Coordination-service facade
//!
//! Every component talks to the shared tree through [`CoordinationClient`].
//! The contract is the usual one of session-based coordination services:
//! - ephemeral nodes belong to the creating session and vanish when it ends
//! - transactions apply all operations or none
//! - every mutation is published on a change feed ([`Watch`])
//!
//! [`MemoryTree`] is the in-process implementation used by tests and the
//! simulator.

pub mod memory;
pub mod path;

pub use memory::{MemorySession, MemoryTree};
pub use path::JobNodePath;

use crate::common::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Updated => write!(f, "updated"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// One mutation of the tree. For removals `data` is the node's last value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub data: Bytes,
}

impl ChangeEvent {
    pub fn data_str(&self) -> &str {
        std::str::from_utf8(&self.data).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
}

/// Transaction operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    /// Abort unless the node exists.
    Check { path: String },
    /// Create; abort if the node exists.
    Create {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    /// Create or overwrite.
    Put {
        path: String,
        data: Bytes,
        mode: CreateMode,
    },
    /// Delete the node and its subtree; abort if missing.
    Delete { path: String },
}

impl TxnOp {
    pub fn check(path: impl Into<String>) -> Self {
        TxnOp::Check { path: path.into() }
    }

    pub fn create_ephemeral(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Create {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Ephemeral,
        }
    }

    pub fn put(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Put {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Persistent,
        }
    }

    pub fn put_ephemeral(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        TxnOp::Put {
            path: path.into(),
            data: data.into(),
            mode: CreateMode::Ephemeral,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        TxnOp::Delete { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            TxnOp::Check { path }
            | TxnOp::Create { path, .. }
            | TxnOp::Put { path, .. }
            | TxnOp::Delete { path } => path,
        }
    }
}

/// Change feed filtered to one subtree.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Watch {
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next event under the prefix.
    ///
    /// `Lagged(n)` means `n` events were dropped because the consumer fell
    /// behind the bounded channel.
    pub async fn recv(&mut self) -> std::result::Result<ChangeEvent, broadcast::error::RecvError> {
        loop {
            let event = self.rx.recv().await?;
            if is_under(&event.path, &self.prefix) {
                return Ok(event);
            }
        }
    }

    /// Next already-published event under the prefix, without waiting.
    /// Lagged and closed channels both read as "nothing".
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if is_under(&event.path, &self.prefix) => return Some(event),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// `path` equals `prefix` or lies below it.
pub fn is_under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Coordination client bound to one session.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Session owning the ephemeral nodes this client creates.
    fn session_id(&self) -> u64;

    /// Create or overwrite a persistent node, creating parents as needed.
    async fn create_persistent(&self, path: &str, data: Bytes) -> Result<()>;

    /// Create or overwrite a node owned by this session.
    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<()>;

    /// Exclusive ephemeral create. `Ok(false)` if the node already exists.
    async fn try_create_ephemeral(&self, path: &str, data: Bytes) -> Result<bool>;

    /// Remove a node and its subtree. Missing nodes are not an error.
    async fn remove(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>>;

    /// Direct children names, sorted. Empty when the node is missing.
    async fn get_children(&self, path: &str) -> Result<Vec<String>>;

    /// Apply every operation or none.
    async fn execute_transaction(&self, ops: Vec<TxnOp>) -> Result<()>;

    /// Subscribe to mutations under `prefix`.
    fn watch(&self, prefix: &str) -> Watch;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_under() {
        assert!(is_under("/ns/job/config", "/ns/job"));
        assert!(is_under("/ns/job", "/ns/job"));
        assert!(!is_under("/ns/job2/config", "/ns/job"));
        assert!(is_under("/ns/job/a", "/ns/job/"));
    }

    #[test]
    fn test_txn_op_path() {
        assert_eq!(TxnOp::check("/a").path(), "/a");
        assert_eq!(TxnOp::put("/b", "x").path(), "/b");
        assert_eq!(TxnOp::delete("/c").path(), "/c");
    }
}
