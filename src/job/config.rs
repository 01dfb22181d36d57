//! Job configuration node

use super::JobContext;
use crate::common::{Error, JobConfig, Result};
use crate::storage::path::CONFIG;
use std::sync::Arc;

#[derive(Clone)]
pub struct ConfigService {
    ctx: Arc<JobContext>,
}

impl ConfigService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Read the current snapshot. Callers re-read at every decision point.
    pub async fn load(&self) -> Result<JobConfig> {
        let raw = self
            .ctx
            .storage
            .get_node_data(CONFIG)
            .await?
            .ok_or_else(|| Error::ConfigNotFound(self.ctx.job_name.clone()))?;
        let config: JobConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Store `config` unless one exists and `overwrite` is off; returns what is in force.
    pub async fn persist(&self, config: &JobConfig) -> Result<JobConfig> {
        config.validate()?;
        if config.job_name != self.ctx.job_name {
            return Err(Error::InvalidConfig(format!(
                "config for '{}' registered under job '{}'",
                config.job_name, self.ctx.job_name
            )));
        }

        if !config.overwrite && self.ctx.storage.is_node_existed(CONFIG).await? {
            let stored = self.load().await?;
            tracing::debug!(job = %self.ctx.job_name, "Keeping stored job config");
            return Ok(stored);
        }

        self.ctx
            .storage
            .replace(CONFIG, serde_json::to_vec(config)?)
            .await?;
        tracing::info!(
            job = %self.ctx.job_name,
            sharding_total_count = config.sharding_total_count,
            failover = config.failover,
            monitor_execution = config.monitor_execution,
            "Job config persisted"
        );
        Ok(config.clone())
    }
}
