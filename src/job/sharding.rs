//! Sharding engine
//!
//! ```text
//!   Stable ──set_resharding_flag──► NeedsReshard ──leader──► Processing ──commit──► Stable
//! ```
//!
//! The leader recomputes the whole assignment and commits it, together with
//! the removal of both flags, in a single transaction. Followers wait for the
//! flags to clear and then read the new assignment.

use super::config::ConfigService;
use super::execution::ExecutionService;
use super::instance::InstanceService;
use super::server::ServerService;
use super::strategy::{invert, strategy_for};
use super::JobContext;
use crate::common::Result;
use crate::leader::LeaderGate;
use crate::storage::path::{
    item_path, ITEM_INSTANCE, SHARDING, SHARDING_NECESSARY, SHARDING_PROCESSING,
};
use crate::storage::TxnOp;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a call to [`ShardingService::sharding_if_necessary`] ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingOutcome {
    /// No flag set; nothing touched.
    NotNeeded,
    /// No live instance; assignment cleared, flag kept for whoever comes back.
    NoInstances,
    /// Another instance resharded; we waited for it.
    Followed,
    /// This instance committed a new assignment.
    Resharded { instances: usize, items: u32 },
}

pub struct ShardingService {
    ctx: Arc<JobContext>,
    config: ConfigService,
    leader: Arc<dyn LeaderGate>,
    instances: InstanceService,
    servers: ServerService,
    execution: Arc<ExecutionService>,
}

impl ShardingService {
    pub fn new(
        ctx: Arc<JobContext>,
        leader: Arc<dyn LeaderGate>,
        execution: Arc<ExecutionService>,
    ) -> Self {
        Self {
            config: ConfigService::new(ctx.clone()),
            instances: InstanceService::new(ctx.clone()),
            servers: ServerService::new(ctx.clone()),
            ctx,
            leader,
            execution,
        }
    }

    pub async fn set_resharding_flag(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        self.ctx.storage.create_if_needed(SHARDING_NECESSARY).await
    }

    pub async fn is_need_sharding(&self) -> Result<bool> {
        self.ctx.storage.is_node_existed(SHARDING_NECESSARY).await
    }

    pub async fn sharding_if_necessary(&self) -> Result<ShardingOutcome> {
        let available = self.instances.get_available_job_instances().await?;
        if available.is_empty() {
            self.clear_assignment().await?;
            return Ok(ShardingOutcome::NoInstances);
        }
        if !self.is_need_sharding().await? {
            return Ok(ShardingOutcome::NotNeeded);
        }

        if !self.leader.is_leader_until_block().await? {
            if !self.wait_for_leader_sharding().await? {
                return Ok(ShardingOutcome::Followed);
            }
            // Elected while waiting: the flag is ours to clear now.
            if !self.is_need_sharding().await? {
                return Ok(ShardingOutcome::Followed);
            }
        }

        let config = self.config.load().await?;
        if config.monitor_execution {
            let execution = &self.execution;
            self.ctx
                .wait_until("running items before resharding", || async move {
                    Ok(!execution.has_running_items_all().await?)
                })
                .await?;
        }

        let local = self.ctx.instance()?.instance_id;
        self.ctx
            .storage
            .fill_ephemeral(SHARDING_PROCESSING, local)
            .await?;
        let committed = self
            .commit_assignment(
                config.sharding_total_count,
                config.job_sharding_strategy_type.as_deref(),
            )
            .await;
        match committed {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // `necessary` stays; the next attempt starts over.
                if let Err(release) = self.ctx.storage.remove_if_existed(SHARDING_PROCESSING).await {
                    tracing::warn!(job = %self.ctx.job_name, error = %release, "Failed to release processing guard");
                }
                Err(e)
            }
        }
    }

    /// Follower wait; returns true if this instance became leader meanwhile.
    async fn wait_for_leader_sharding(&self) -> Result<bool> {
        let storage = &self.ctx.storage;
        let leader = &self.leader;
        let elected = AtomicBool::new(false);
        let elected_ref = &elected;
        self.ctx
            .wait_until("leader sharding", || async move {
                if leader.is_leader().await? {
                    elected_ref.store(true, Ordering::SeqCst);
                    return Ok(true);
                }
                Ok(!storage.is_node_existed(SHARDING_NECESSARY).await?
                    && !storage.is_node_existed(SHARDING_PROCESSING).await?)
            })
            .await?;
        Ok(elected.load(Ordering::SeqCst))
    }

    async fn commit_assignment(
        &self,
        total: u32,
        strategy: Option<&str>,
    ) -> Result<ShardingOutcome> {
        let strategy = strategy_for(strategy)?;
        // Re-read: the fleet may have moved while we waited.
        let instances = self.instances.get_available_job_instances().await?;
        let assignment = strategy.sharding(&instances, total, &self.ctx.job_name);

        let owners = invert(&assignment);
        let mut ops = Vec::new();
        for item in self.ctx.storage.get_item_children().await? {
            if item >= total {
                ops.push(TxnOp::delete(format!("{}/{}", SHARDING, item)));
            } else if !owners.contains_key(&item)
                && self
                    .ctx
                    .storage
                    .is_node_existed(&item_path(item, ITEM_INSTANCE))
                    .await?
            {
                ops.push(TxnOp::delete(item_path(item, ITEM_INSTANCE)));
            }
        }
        for (instance, items) in &assignment {
            for &item in items {
                ops.push(TxnOp::put(item_path(item, ITEM_INSTANCE), instance.clone()));
            }
        }
        ops.push(TxnOp::delete(SHARDING_NECESSARY));
        ops.push(TxnOp::delete(SHARDING_PROCESSING));
        self.ctx.storage.execute_in_transaction(ops).await?;

        tracing::info!(
            job = %self.ctx.job_name,
            strategy = strategy.name(),
            instances = instances.len(),
            total,
            "Resharding committed"
        );
        for (instance, items) in &assignment {
            tracing::debug!(job = %self.ctx.job_name, instance_id = %instance, items = ?items, "Assigned");
        }
        Ok(ShardingOutcome::Resharded {
            instances: instances.len(),
            items: total,
        })
    }

    /// Remove every `sharding/{i}/instance` in one commit.
    async fn clear_assignment(&self) -> Result<()> {
        let mut ops = Vec::new();
        for item in self.ctx.storage.get_item_children().await? {
            let path = item_path(item, ITEM_INSTANCE);
            if self.ctx.storage.is_node_existed(&path).await? {
                ops.push(TxnOp::delete(path));
            }
        }
        if !ops.is_empty() {
            tracing::info!(job = %self.ctx.job_name, "No available instance, assignment cleared");
        }
        self.ctx.storage.execute_in_transaction(ops).await
    }

    /// Item → owner for every assigned item.
    pub async fn get_assignment(&self) -> Result<BTreeMap<u32, String>> {
        let mut assignment = BTreeMap::new();
        for item in self.ctx.storage.get_item_children().await? {
            if let Some(owner) = self
                .ctx
                .storage
                .get_node_data(&item_path(item, ITEM_INSTANCE))
                .await?
            {
                assignment.insert(item, owner);
            }
        }
        Ok(assignment)
    }

    pub async fn get_sharding_items(&self, instance_id: &str) -> Result<Vec<u32>> {
        if !self.instances.is_instance_online(instance_id).await? {
            return Ok(Vec::new());
        }
        Ok(self
            .get_assignment()
            .await?
            .into_iter()
            .filter(|(_, owner)| owner == instance_id)
            .map(|(item, _)| item)
            .collect())
    }

    /// Items assigned to this instance; none while shut down or disabled.
    pub async fn get_local_sharding_items(&self) -> Result<Vec<u32>> {
        if self.ctx.is_shutdown() || !self.servers.is_local_server_available().await? {
            return Ok(Vec::new());
        }
        let local = self.ctx.instance()?.instance_id;
        self.get_sharding_items(&local).await
    }

    pub async fn has_sharding_info(&self) -> Result<bool> {
        Ok(!self.get_assignment().await?.is_empty())
    }

    /// Some item is still assigned to an instance that went away.
    pub async fn has_sharding_info_in_offline_instances(&self) -> Result<bool> {
        for owner in self.get_assignment().await?.values() {
            if !self.instances.is_instance_online(owner).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
