//! Job-scoped access to the coordination tree
//!
//! Every service addresses nodes relative to the job root; this wrapper
//! turns them into absolute paths and folds the common "if missing" /
//! "if present" patterns into single calls.

use crate::common::Result;
use crate::storage::path::SHARDING;
use crate::storage::{CoordinationClient, JobNodePath, TxnOp, Watch};
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone)]
pub struct JobNodeStorage {
    client: Arc<dyn CoordinationClient>,
    path: JobNodePath,
}

impl JobNodeStorage {
    pub fn new(client: Arc<dyn CoordinationClient>, path: JobNodePath) -> Self {
        Self { client, path }
    }

    pub fn path(&self) -> &JobNodePath {
        &self.path
    }

    pub fn full(&self, relative: &str) -> String {
        self.path.full(relative)
    }

    pub async fn is_node_existed(&self, relative: &str) -> Result<bool> {
        self.client.exists(&self.full(relative)).await
    }

    /// Node data as UTF-8, `None` when the node is missing.
    pub async fn get_node_data(&self, relative: &str) -> Result<Option<String>> {
        Ok(self
            .client
            .get_data(&self.full(relative))
            .await?
            .map(|data| String::from_utf8_lossy(&data).into_owned()))
    }

    /// Create an empty persistent node unless it already exists.
    pub async fn create_if_needed(&self, relative: &str) -> Result<()> {
        let full = self.full(relative);
        if !self.client.exists(&full).await? {
            self.client.create_persistent(&full, Bytes::new()).await?;
        }
        Ok(())
    }

    pub async fn replace(&self, relative: &str, data: impl Into<Bytes>) -> Result<()> {
        self.client
            .create_persistent(&self.full(relative), data.into())
            .await
    }

    pub async fn fill_ephemeral(&self, relative: &str, data: impl Into<Bytes>) -> Result<()> {
        self.client
            .create_ephemeral(&self.full(relative), data.into())
            .await
    }

    /// Exclusive ephemeral create; `false` when somebody holds the node.
    pub async fn try_fill_ephemeral(&self, relative: &str, data: impl Into<Bytes>) -> Result<bool> {
        self.client
            .try_create_ephemeral(&self.full(relative), data.into())
            .await
    }

    pub async fn remove_if_existed(&self, relative: &str) -> Result<()> {
        self.client.remove(&self.full(relative)).await
    }

    pub async fn get_children(&self, relative: &str) -> Result<Vec<String>> {
        self.client.get_children(&self.full(relative)).await
    }

    /// Numeric children of `sharding`, ascending.
    pub async fn get_item_children(&self) -> Result<Vec<u32>> {
        let mut items: Vec<u32> = self
            .get_children(SHARDING)
            .await?
            .iter()
            .filter_map(|child| child.parse().ok())
            .collect();
        items.sort_unstable();
        Ok(items)
    }

    /// Run a transaction built from relative-path operations.
    ///
    /// An empty batch is a no-op and never reaches the coordination service.
    pub async fn execute_in_transaction(&self, ops: Vec<TxnOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let ops = ops
            .into_iter()
            .map(|op| match op {
                TxnOp::Check { path } => TxnOp::Check {
                    path: self.full(&path),
                },
                TxnOp::Create { path, data, mode } => TxnOp::Create {
                    path: self.full(&path),
                    data,
                    mode,
                },
                TxnOp::Put { path, data, mode } => TxnOp::Put {
                    path: self.full(&path),
                    data,
                    mode,
                },
                TxnOp::Delete { path } => TxnOp::Delete {
                    path: self.full(&path),
                },
            })
            .collect();
        self.client.execute_transaction(ops).await
    }

    pub fn watch(&self) -> Watch {
        self.client.watch(self.path.root())
    }
}
