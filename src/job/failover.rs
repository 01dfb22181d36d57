//! Failover coordinator
//!
//! A crashed item is queued under `leader/failover/items/{item}`. Any idle
//! instance may drain the queue while holding the failover latch: for each
//! item it writes an ephemeral claim at `sharding/{item}/failover` and asks
//! the trigger layer for an immediate run. The claim lives until the rerun
//! reports completion, or until the claimant's own session dies, which
//! queues the item again.

use super::config::ConfigService;
use super::execution::ExecutionService;
use super::sharding::ShardingService;
use super::JobContext;
use crate::common::Result;
use crate::leader::LeaderGate;
use crate::storage::path::{
    failover_item_path, item_path, FAILOVER_ITEMS, FAILOVER_LATCH, ITEM_FAILOVER,
    ITEM_LAST_BEGIN, ITEM_LAST_COMPLETE,
};
use crate::storage::TxnOp;
use std::sync::Arc;

pub struct FailoverService {
    ctx: Arc<JobContext>,
    config: ConfigService,
    leader: Arc<dyn LeaderGate>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
}

impl FailoverService {
    pub fn new(
        ctx: Arc<JobContext>,
        leader: Arc<dyn LeaderGate>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
    ) -> Self {
        Self {
            config: ConfigService::new(ctx.clone()),
            ctx,
            leader,
            sharding,
            execution,
        }
    }

    /// Queue `item` unless somebody already holds a claim on it.
    pub async fn set_crashed_failover_flag(&self, item: u32) -> Result<()> {
        if self.is_claimed(item).await? {
            return Ok(());
        }
        self.ctx
            .storage
            .create_if_needed(&failover_item_path(item))
            .await
    }

    pub async fn get_pending_items(&self) -> Result<Vec<u32>> {
        Ok(self
            .ctx
            .storage
            .get_children(FAILOVER_ITEMS)
            .await?
            .iter()
            .filter_map(|child| child.parse().ok())
            .collect())
    }

    /// Crash signal for `item`. Returns the items this instance claimed as a
    /// consequence.
    pub async fn on_item_crashed(&self, item: u32) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() {
            return Ok(Vec::new());
        }
        let config = self.config.load().await?;
        if item >= config.sharding_total_count || !config.is_failover_active() {
            return Ok(Vec::new());
        }
        // Finished, or already running again: the removal raced with a
        // normal completion and is not a crash.
        if self.execution.is_completed(item).await? || self.execution.is_running(item).await? {
            tracing::debug!(job = %self.ctx.job_name, item, "Ignoring stale crash signal");
            return Ok(Vec::new());
        }

        tracing::warn!(job = %self.ctx.job_name, item, "Item crashed, queueing for failover");
        self.set_crashed_failover_flag(item).await?;
        self.failover_if_necessary().await
    }

    /// Queue the unfinished items of a departed instance: assigned to it,
    /// begun after their last completion, and not completed since.
    pub async fn crash_scan(&self, instance_id: &str) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() || !self.config.load().await?.is_failover_active() {
            return Ok(Vec::new());
        }

        let mut queued = Vec::new();
        for (item, owner) in self.sharding.get_assignment().await? {
            if owner != instance_id
                || self.execution.is_completed(item).await?
                || self.execution.is_running(item).await?
                || self.is_claimed(item).await?
            {
                continue;
            }
            // Millisecond stamps: a begin in the same millisecond as the
            // previous completion still counts as unfinished.
            let Some(begin) = self.timestamp(item, ITEM_LAST_BEGIN).await? else {
                continue;
            };
            let complete = self
                .timestamp(item, ITEM_LAST_COMPLETE)
                .await?
                .unwrap_or(i64::MIN);
            if begin >= complete {
                self.set_crashed_failover_flag(item).await?;
                queued.push(item);
            }
        }
        if !queued.is_empty() {
            tracing::warn!(
                job = %self.ctx.job_name,
                instance_id = %instance_id,
                items = ?queued,
                "Instance left with unfinished items"
            );
        }
        self.failover_if_necessary().await
    }

    /// Claim and trigger queued items while this instance is idle. At most one
    /// instance drains the queue at a time; the others skip.
    pub async fn failover_if_necessary(&self) -> Result<Vec<u32>> {
        if !self.need_failover().await? {
            return Ok(Vec::new());
        }

        let mut claimed = Vec::new();
        let claimed_ref = &mut claimed;
        self.leader
            .execute_under_leadership(
                FAILOVER_LATCH,
                Box::pin(async move {
                    let local = self.ctx.instance()?.instance_id;
                    let trigger = self.ctx.trigger()?;
                    while !self.ctx.is_shutdown()
                        && !self.ctx.registry.is_job_running(&self.ctx.job_name)
                    {
                        let Some(item) = self.get_pending_items().await?.first().copied() else {
                            break;
                        };
                        if self.is_claimed(item).await? {
                            self.ctx
                                .storage
                                .remove_if_existed(&failover_item_path(item))
                                .await?;
                            continue;
                        }
                        self.ctx
                            .storage
                            .execute_in_transaction(vec![
                                TxnOp::create_ephemeral(
                                    item_path(item, ITEM_FAILOVER),
                                    local.clone(),
                                ),
                                TxnOp::delete(failover_item_path(item)),
                            ])
                            .await?;
                        tracing::info!(job = %self.ctx.job_name, item, instance_id = %local, "Failover claimed");
                        claimed_ref.push(item);
                        trigger.trigger_job(&local)?;
                    }
                    Ok::<_, crate::Error>(())
                }),
            )
            .await?;
        Ok(claimed)
    }

    async fn need_failover(&self) -> Result<bool> {
        Ok(self.config.load().await?.is_failover_active()
            && !self.get_pending_items().await?.is_empty()
            && !self.ctx.registry.is_job_running(&self.ctx.job_name))
    }

    /// Rerun finished: drop the claims on `items`.
    pub async fn update_failover_complete(&self, items: &[u32]) -> Result<()> {
        let mut ops = Vec::new();
        for &item in items {
            if self.is_claimed(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_FAILOVER)));
            }
        }
        self.ctx.storage.execute_in_transaction(ops).await
    }

    /// Items `instance_id` currently holds claims on.
    pub async fn get_failover_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        let mut items = Vec::new();
        for item in self.ctx.storage.get_item_children().await? {
            let owner = self
                .ctx
                .storage
                .get_node_data(&item_path(item, ITEM_FAILOVER))
                .await?;
            if owner.as_deref() == Some(instance_id) {
                items.push(item);
            }
        }
        Ok(items)
    }

    pub async fn get_local_failover_items(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() {
            return Ok(Vec::new());
        }
        let local = self.ctx.instance()?.instance_id;
        self.get_failover_items(&local).await
    }

    /// Local items currently claimed by someone under failover.
    pub async fn get_local_take_off_items(&self) -> Result<Vec<u32>> {
        let mut items = Vec::new();
        for item in self.sharding.get_local_sharding_items().await? {
            if self.is_claimed(item).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    /// Purge the queue and every claim, in one commit.
    pub async fn remove_failover_info(&self) -> Result<()> {
        let mut ops = Vec::new();
        if self.ctx.storage.is_node_existed(FAILOVER_ITEMS).await? {
            ops.push(TxnOp::delete(FAILOVER_ITEMS));
        }
        for item in self.ctx.storage.get_item_children().await? {
            if self.is_claimed(item).await? {
                ops.push(TxnOp::delete(item_path(item, ITEM_FAILOVER)));
            }
        }
        if !ops.is_empty() {
            tracing::info!(job = %self.ctx.job_name, "Failover info removed");
        }
        self.ctx.storage.execute_in_transaction(ops).await
    }

    async fn is_claimed(&self, item: u32) -> Result<bool> {
        self.ctx
            .storage
            .is_node_existed(&item_path(item, ITEM_FAILOVER))
            .await
    }

    async fn timestamp(&self, item: u32, leaf: &str) -> Result<Option<i64>> {
        Ok(self
            .ctx
            .storage
            .get_node_data(&item_path(item, leaf))
            .await?
            .and_then(|raw| raw.parse().ok()))
    }
}
