//! Execution tracking
//!
//! Per-item markers under `sharding/{item}`:
//! - `running`: ephemeral, data is the owning instance id. Its removal by
//!   session expiry is the crash signal failover reacts to.
//! - `completed`: persistent, written before `running` goes away.
//! - `misfire`: persistent, a tick skipped while items were still running.
//! - `disabled`: persistent, set by operators to exclude an item.
//!
//! With monitor execution off only the in-process running flag is kept.

use super::config::ConfigService;
use super::context::ShardingContexts;
use super::JobContext;
use crate::common::Result;
use crate::leader::LeaderGate;
use crate::storage::path::{
    item_path, EXECUTION_CLEANING, EXECUTION_NECESSARY, ITEM_COMPLETED, ITEM_DISABLED,
    ITEM_LAST_BEGIN, ITEM_LAST_COMPLETE, ITEM_MISFIRE, ITEM_RUNNING, SHARDING,
};
use crate::storage::TxnOp;
use std::sync::Arc;

pub struct ExecutionService {
    ctx: Arc<JobContext>,
    config: ConfigService,
    leader: Arc<dyn LeaderGate>,
}

impl ExecutionService {
    pub fn new(ctx: Arc<JobContext>, leader: Arc<dyn LeaderGate>) -> Self {
        let config = ConfigService::new(ctx.clone());
        Self {
            ctx,
            config,
            leader,
        }
    }

    /// Mark the items of `contexts` as running on this instance.
    pub async fn register_job_begin(&self, contexts: &ShardingContexts) -> Result<()> {
        self.ctx.registry.set_job_running(&self.ctx.job_name, true);
        if contexts.is_empty() || !self.config.load().await?.monitor_execution {
            return Ok(());
        }

        let local = self.ctx.instance()?.instance_id;
        let now = chrono::Utc::now().timestamp_millis().to_string();
        let mut ops = Vec::new();
        for item in contexts.items() {
            if self.is_completed(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_COMPLETED)));
            }
            ops.push(TxnOp::create_ephemeral(
                item_path(item, ITEM_RUNNING),
                local.clone(),
            ));
            ops.push(TxnOp::put(item_path(item, ITEM_LAST_BEGIN), now.clone()));
        }

        if let Err(e) = self.ctx.storage.execute_in_transaction(ops).await {
            self.ctx.registry.set_job_running(&self.ctx.job_name, false);
            return Err(e);
        }
        tracing::debug!(job = %self.ctx.job_name, items = ?contexts.items(), "Job begin registered");
        Ok(())
    }

    /// Mark the items of `contexts` completed and drop their running markers.
    pub async fn register_job_completed(&self, contexts: &ShardingContexts) -> Result<()> {
        self.ctx.registry.set_job_running(&self.ctx.job_name, false);
        if contexts.is_empty() || !self.config.load().await?.monitor_execution {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis().to_string();
        let mut ops = Vec::new();
        for item in contexts.items() {
            // `completed` lands before `running` disappears, in the same commit.
            ops.push(TxnOp::put(item_path(item, ITEM_COMPLETED), ""));
            if self.is_running(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_RUNNING)));
            }
            ops.push(TxnOp::put(item_path(item, ITEM_LAST_COMPLETE), now.clone()));
        }
        self.ctx.storage.execute_in_transaction(ops).await?;
        tracing::debug!(job = %self.ctx.job_name, items = ?contexts.items(), "Job completion registered");
        Ok(())
    }

    /// Drop running markers without recording completion.
    pub async fn clear_running_info(&self, items: &[u32]) -> Result<()> {
        let mut ops = Vec::new();
        for &item in items {
            if self.is_running(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_RUNNING)));
            }
        }
        self.ctx.storage.execute_in_transaction(ops).await
    }

    pub async fn is_running(&self, item: u32) -> Result<bool> {
        self.ctx
            .storage
            .is_node_existed(&item_path(item, ITEM_RUNNING))
            .await
    }

    pub async fn is_completed(&self, item: u32) -> Result<bool> {
        self.ctx
            .storage
            .is_node_existed(&item_path(item, ITEM_COMPLETED))
            .await
    }

    /// True iff monitoring is on and any of `items` has a live running marker.
    pub async fn has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.config.load().await?.monitor_execution {
            return Ok(false);
        }
        for &item in items {
            if self.is_running(item).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Same as [`has_running_items`](Self::has_running_items) over every item subtree.
    pub async fn has_running_items_all(&self) -> Result<bool> {
        let items = self.ctx.storage.get_item_children().await?;
        self.has_running_items(&items).await
    }

    /// If any of `items` is still running, mark all of them misfired.
    pub async fn misfire_if_has_running_items(&self, items: &[u32]) -> Result<bool> {
        if !self.has_running_items(items).await? {
            return Ok(false);
        }
        self.set_misfire(items).await?;
        Ok(true)
    }

    pub async fn set_misfire(&self, items: &[u32]) -> Result<()> {
        let ops = items
            .iter()
            .map(|item| TxnOp::put(item_path(*item, ITEM_MISFIRE), ""))
            .collect();
        self.ctx.storage.execute_in_transaction(ops).await?;
        tracing::info!(job = %self.ctx.job_name, items = ?items, "Items misfired");
        Ok(())
    }

    pub async fn get_misfired_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        self.items_with(items, ITEM_MISFIRE).await
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        let ops = self
            .items_with(items, ITEM_MISFIRE)
            .await?
            .into_iter()
            .map(|item| TxnOp::delete(item_path(item, ITEM_MISFIRE)))
            .collect();
        self.ctx.storage.execute_in_transaction(ops).await
    }

    pub async fn get_disabled_items(&self, items: &[u32]) -> Result<Vec<u32>> {
        self.items_with(items, ITEM_DISABLED).await
    }

    /// Operator switch for `sharding/{item}/disabled`.
    pub async fn set_item_disabled(&self, item: u32, disabled: bool) -> Result<()> {
        let path = item_path(item, ITEM_DISABLED);
        if disabled {
            self.ctx.storage.create_if_needed(&path).await
        } else {
            self.ctx.storage.remove_if_existed(&path).await
        }
    }

    pub async fn set_need_fix_execution_info(&self) -> Result<()> {
        self.ctx.storage.create_if_needed(EXECUTION_NECESSARY).await
    }

    pub async fn is_need_fix_execution_info(&self) -> Result<bool> {
        self.ctx.storage.is_node_existed(EXECUTION_NECESSARY).await
    }

    /// Leader: clear every `completed` marker and reconcile item subtrees
    /// with the configured count, under the `cleaning` guard. Everybody else
    /// waits for the guard to go away.
    pub async fn clean_previous_execution_info(&self) -> Result<()> {
        if self.leader.is_leader_until_block().await? {
            let local = self.ctx.instance()?.instance_id;
            if self
                .ctx
                .storage
                .try_fill_ephemeral(EXECUTION_CLEANING, local)
                .await?
            {
                let result = self.reconcile_items().await;
                if let Err(e) = self.ctx.storage.remove_if_existed(EXECUTION_CLEANING).await {
                    tracing::warn!(job = %self.ctx.job_name, error = %e, "Failed to release cleaning guard");
                }
                result?;
            }
        }

        let storage = &self.ctx.storage;
        self.ctx
            .wait_until("execution cleaning", || async move {
                Ok(!storage.is_node_existed(EXECUTION_CLEANING).await?)
            })
            .await
    }

    async fn reconcile_items(&self) -> Result<()> {
        let total = self.config.load().await?.sharding_total_count;
        let existing = self.ctx.storage.get_item_children().await?;

        let mut ops = Vec::new();
        for &item in &existing {
            if item >= total {
                ops.push(TxnOp::delete(format!("{}/{}", SHARDING, item)));
            } else if self.is_completed(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_COMPLETED)));
            }
        }
        let created: Vec<u32> = (0..total)
            .filter(|item| existing.binary_search(item).is_err())
            .collect();
        for &item in &created {
            ops.push(TxnOp::put(format!("{}/{}", SHARDING, item), ""));
        }
        if self.is_need_fix_execution_info().await? {
            ops.push(TxnOp::delete(EXECUTION_NECESSARY));
        }

        self.ctx.storage.execute_in_transaction(ops).await?;
        tracing::info!(
            job = %self.ctx.job_name,
            total,
            created = ?created,
            removed = existing.iter().filter(|i| **i >= total).count(),
            "Previous execution info cleaned"
        );
        Ok(())
    }

    async fn items_with(&self, items: &[u32], leaf: &str) -> Result<Vec<u32>> {
        let mut found = Vec::new();
        for &item in items {
            if self.ctx.storage.is_node_existed(&item_path(item, leaf)).await? {
                found.push(item);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::JobConfig;
    use crate::job::instance::InstanceService;
    use crate::job::server::ServerService;
    use crate::job::testing::{node, put_config, Node, JOB};
    use crate::leader::LeaderService;
    use crate::storage::MemoryTree;
    use std::collections::BTreeMap;

    fn contexts(items: &[u32]) -> ShardingContexts {
        ShardingContexts::for_items(JOB, 3, "", items, &BTreeMap::new())
    }

    fn execution(node: &Node) -> ExecutionService {
        ExecutionService::new(
            node.ctx.clone(),
            Arc::new(LeaderService::new(node.ctx.clone())),
        )
    }

    #[tokio::test]
    async fn test_begin_and_complete() {
        let tree = MemoryTree::new(256);
        let a = node(&tree, "10.0.0.1", "a");
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        let execution = execution(&a);

        execution.register_job_begin(&contexts(&[0, 1])).await.unwrap();
        assert!(a.ctx.registry.is_job_running(JOB));
        assert!(execution.is_running(0).await.unwrap());
        assert_eq!(
            a.ctx
                .storage
                .get_node_data(&item_path(0, ITEM_RUNNING))
                .await
                .unwrap()
                .as_deref(),
            Some("10.0.0.1@-@a")
        );
        assert!(a
            .ctx
            .storage
            .is_node_existed(&item_path(1, ITEM_LAST_BEGIN))
            .await
            .unwrap());

        execution
            .register_job_completed(&contexts(&[0, 1]))
            .await
            .unwrap();
        assert!(!a.ctx.registry.is_job_running(JOB));
        assert!(!execution.has_running_items(&[0, 1]).await.unwrap());
        assert!(execution.is_completed(0).await.unwrap());
        assert!(execution.is_completed(1).await.unwrap());

        // Next tick clears the stale completed marker.
        execution.register_job_begin(&contexts(&[0])).await.unwrap();
        assert!(!execution.is_completed(0).await.unwrap());
        assert!(execution.is_completed(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_begin_still_flags_running() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        let execution = execution(&a);

        execution.register_job_begin(&contexts(&[])).await.unwrap();
        assert!(a.ctx.registry.is_job_running(JOB));
        assert!(!execution.has_running_items_all().await.unwrap());
        execution.register_job_completed(&contexts(&[])).await.unwrap();
        assert!(!a.ctx.registry.is_job_running(JOB));
    }

    #[tokio::test]
    async fn test_monitor_execution_off_skips_markers() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        put_config(&a.ctx, &JobConfig::new(JOB, 3).with_monitor_execution(false)).await;
        let execution = execution(&a);

        execution.register_job_begin(&contexts(&[0])).await.unwrap();
        assert!(a.ctx.registry.is_job_running(JOB));
        assert!(!execution.is_running(0).await.unwrap());
        assert!(!execution.has_running_items(&[0]).await.unwrap());
        execution.register_job_completed(&contexts(&[0])).await.unwrap();
        assert!(!execution.is_completed(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_has_running_items() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        let execution = execution(&a);

        assert!(!execution.has_running_items_all().await.unwrap());
        execution.register_job_begin(&contexts(&[1])).await.unwrap();
        assert!(execution.has_running_items(&[0, 1]).await.unwrap());
        assert!(!execution.has_running_items(&[0, 2]).await.unwrap());
        assert!(execution.has_running_items_all().await.unwrap());

        execution.clear_running_info(&[0, 1]).await.unwrap();
        assert!(!execution.has_running_items_all().await.unwrap());
        assert!(!execution.is_completed(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_misfire_marks_every_input_item() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        let execution = execution(&a);

        assert!(!execution
            .misfire_if_has_running_items(&[0, 1, 2])
            .await
            .unwrap());
        assert!(execution
            .get_misfired_items(&[0, 1, 2])
            .await
            .unwrap()
            .is_empty());

        execution.register_job_begin(&contexts(&[1])).await.unwrap();
        assert!(execution
            .misfire_if_has_running_items(&[0, 1, 2])
            .await
            .unwrap());
        assert_eq!(
            execution.get_misfired_items(&[0, 1, 2]).await.unwrap(),
            vec![0, 1, 2]
        );

        execution.clear_misfire(&[0, 2]).await.unwrap();
        assert_eq!(
            execution.get_misfired_items(&[0, 1, 2]).await.unwrap(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_disabled_items() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let execution = execution(&a);
        execution.set_item_disabled(2, true).await.unwrap();
        assert_eq!(
            execution.get_disabled_items(&[0, 1, 2]).await.unwrap(),
            vec![2]
        );
        execution.set_item_disabled(2, false).await.unwrap();
        assert!(execution
            .get_disabled_items(&[0, 1, 2])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_begin_conflict_resets_running_flag() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;

        execution(&a)
            .register_job_begin(&contexts(&[0]))
            .await
            .unwrap();
        let result = execution(&b).register_job_begin(&contexts(&[0])).await;
        assert!(result.is_err());
        assert!(!b.ctx.registry.is_job_running(JOB));
    }

    #[tokio::test]
    async fn test_clean_reconciles_item_count() {
        let tree = MemoryTree::new(256);
        let a = node(&tree, "10.0.0.1", "a");
        ServerService::new(a.ctx.clone())
            .persist_online(true)
            .await
            .unwrap();
        InstanceService::new(a.ctx.clone())
            .persist_online()
            .await
            .unwrap();
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        let execution = execution(&a);

        execution.clean_previous_execution_info().await.unwrap();
        assert_eq!(a.ctx.storage.get_item_children().await.unwrap(), vec![0, 1, 2]);

        execution
            .register_job_begin(&contexts(&[0, 1, 2]))
            .await
            .unwrap();
        execution
            .register_job_completed(&contexts(&[0, 1, 2]))
            .await
            .unwrap();
        execution.set_misfire(&[1]).await.unwrap();

        put_config(&a.ctx, &JobConfig::new(JOB, 5)).await;
        execution.set_need_fix_execution_info().await.unwrap();
        execution.clean_previous_execution_info().await.unwrap();

        assert_eq!(
            a.ctx.storage.get_item_children().await.unwrap(),
            vec![0, 1, 2, 3, 4]
        );
        for item in 0..3 {
            assert!(!execution.is_completed(item).await.unwrap());
            assert!(a
                .ctx
                .storage
                .is_node_existed(&item_path(item, ITEM_LAST_COMPLETE))
                .await
                .unwrap());
        }
        // Untouched apart from completed.
        assert_eq!(execution.get_misfired_items(&[1]).await.unwrap(), vec![1]);
        assert!(!execution.is_need_fix_execution_info().await.unwrap());
        assert!(!a.ctx.storage.is_node_existed(EXECUTION_CLEANING).await.unwrap());

        put_config(&a.ctx, &JobConfig::new(JOB, 2)).await;
        execution.clean_previous_execution_info().await.unwrap();
        assert_eq!(a.ctx.storage.get_item_children().await.unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_non_leader_waits_for_cleaning() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        for n in [&a, &b] {
            ServerService::new(n.ctx.clone())
                .persist_online(true)
                .await
                .unwrap();
            InstanceService::new(n.ctx.clone())
                .persist_online()
                .await
                .unwrap();
        }
        put_config(&a.ctx, &JobConfig::new(JOB, 3)).await;
        LeaderService::new(a.ctx.clone()).elect_leader().await.unwrap();

        // Leader holds the guard.
        a.ctx
            .storage
            .fill_ephemeral(EXECUTION_CLEANING, "10.0.0.1@-@a")
            .await
            .unwrap();
        let waiter = {
            let exec = execution(&b);
            tokio::spawn(async move { exec.clean_previous_execution_info().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        a.ctx
            .storage
            .remove_if_existed(EXECUTION_CLEANING)
            .await
            .unwrap();
        waiter.await.unwrap().unwrap();
    }
}
