//! Job facade
//!
//! The narrow surface the execution layer talks to once per tick: which items
//! to run, misfire bookkeeping, begin/complete registration and listeners.

use super::config::ConfigService;
use super::context::ShardingContexts;
use super::execution::ExecutionService;
use super::failover::FailoverService;
use super::sharding::ShardingService;
use super::JobContext;
use crate::common::{JobConfig, Result};
use std::sync::Arc;

/// Hooks bracketing every executed tick.
pub trait JobListener: Send + Sync {
    fn before_job_executed(&self, _contexts: &ShardingContexts) {}

    fn after_job_executed(&self, _contexts: &ShardingContexts) {}
}

pub struct JobFacade {
    ctx: Arc<JobContext>,
    config: ConfigService,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
    failover: Arc<FailoverService>,
    listeners: Vec<Arc<dyn JobListener>>,
}

impl JobFacade {
    pub fn new(
        ctx: Arc<JobContext>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
        failover: Arc<FailoverService>,
        listeners: Vec<Arc<dyn JobListener>>,
    ) -> Self {
        Self {
            config: ConfigService::new(ctx.clone()),
            ctx,
            sharding,
            execution,
            failover,
            listeners,
        }
    }

    pub async fn load_config(&self) -> Result<JobConfig> {
        self.config.load().await
    }

    /// Items to run this tick.
    ///
    /// Failover claims held by this instance take precedence; otherwise the
    /// assignment (resharded first if flagged) minus items taken off by
    /// another instance's claim and items disabled by an operator.
    pub async fn get_sharding_contexts(&self) -> Result<ShardingContexts> {
        let config = self.config.load().await?;
        if config.is_failover_active() {
            let claimed = self.failover.get_local_failover_items().await?;
            if !claimed.is_empty() {
                return Ok(self.contexts_for(&config, &claimed)?.failover());
            }
        }

        if self.execution.is_need_fix_execution_info().await? {
            self.execution.clean_previous_execution_info().await?;
        }
        self.sharding.sharding_if_necessary().await?;

        // The count may have moved while resharding.
        let config = self.config.load().await?;
        let mut items = self.sharding.get_local_sharding_items().await?;
        if config.is_failover_active() {
            let taken = self.failover.get_local_take_off_items().await?;
            items.retain(|item| !taken.contains(item));
        }
        let disabled = self.execution.get_disabled_items(&items).await?;
        items.retain(|item| !disabled.contains(item));
        self.contexts_for(&config, &items)
    }

    fn contexts_for(&self, config: &JobConfig, items: &[u32]) -> Result<ShardingContexts> {
        Ok(ShardingContexts::for_items(
            self.ctx.job_name.clone(),
            config.sharding_total_count,
            config.job_parameter.clone(),
            items,
            &config.item_parameters()?,
        ))
    }

    /// Record a misfire if the previous tick still runs any of `items`.
    pub async fn misfire_if_running(&self, items: &[u32]) -> Result<bool> {
        self.execution.misfire_if_has_running_items(items).await
    }

    /// A skipped tick is owed and misfire makeup is enabled.
    pub async fn is_execute_misfired(&self, items: &[u32]) -> Result<bool> {
        Ok(self.config.load().await?.misfire
            && !self.execution.get_misfired_items(items).await?.is_empty())
    }

    pub async fn clear_misfire(&self, items: &[u32]) -> Result<()> {
        self.execution.clear_misfire(items).await
    }

    pub async fn register_job_begin(&self, contexts: &ShardingContexts) -> Result<()> {
        self.execution.register_job_begin(contexts).await
    }

    pub async fn register_job_completed(&self, contexts: &ShardingContexts) -> Result<()> {
        self.execution.register_job_completed(contexts).await?;
        if contexts.is_failover {
            self.failover
                .update_failover_complete(&contexts.items())
                .await?;
        }
        Ok(())
    }

    pub async fn failover_if_necessary(&self) -> Result<Vec<u32>> {
        self.failover.failover_if_necessary().await
    }

    pub fn before_job_executed(&self, contexts: &ShardingContexts) {
        for listener in &self.listeners {
            listener.before_job_executed(contexts);
        }
    }

    pub fn after_job_executed(&self, contexts: &ShardingContexts) {
        for listener in &self.listeners {
            listener.after_job_executed(contexts);
        }
    }
}
