//! Change handlers wired up for every job
//!
//! | handler | watches | reaction |
//! |---|---|---|
//! | sharding total count | `config` | count drift → reshard + fix execution info |
//! | failover settings | `config` | failover off → purge queue and claims |
//! | servers changed | `instances/*`, `servers/*` | reshard (unless static) |
//! | job crashed | `sharding/*/running`, `sharding/*/failover`, `instances/*` | queue for failover |
//! | leader election | `leader/election/instance`, `servers/{local}` | re-elect / step down |

use super::ChangeHandler;
use crate::common::{JobConfig, Result};
use crate::job::config::ConfigService;
use crate::job::execution::ExecutionService;
use crate::job::failover::FailoverService;
use crate::job::instance::InstanceService;
use crate::job::server::{ServerService, DISABLED};
use crate::job::sharding::ShardingService;
use crate::job::JobContext;
use crate::leader::LeaderService;
use crate::storage::path::{
    direct_child, parse_item_node, CONFIG, INSTANCES, ITEM_FAILOVER, ITEM_RUNNING,
    LEADER_ELECTION_INSTANCE, SERVERS,
};
use crate::storage::{ChangeEvent, ChangeKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Parse a config write; `None` for removals.
fn config_change(relative: &str, event: &ChangeEvent) -> Result<Option<JobConfig>> {
    if relative != CONFIG || event.kind == ChangeKind::Removed {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&event.data)?))
}

pub struct ShardingTotalCountChangedHandler {
    ctx: Arc<JobContext>,
    sharding: Arc<ShardingService>,
    execution: Arc<ExecutionService>,
}

impl ShardingTotalCountChangedHandler {
    pub fn new(
        ctx: Arc<JobContext>,
        sharding: Arc<ShardingService>,
        execution: Arc<ExecutionService>,
    ) -> Self {
        Self {
            ctx,
            sharding,
            execution,
        }
    }
}

#[async_trait]
impl ChangeHandler for ShardingTotalCountChangedHandler {
    fn name(&self) -> &'static str {
        "sharding-total-count"
    }

    async fn handle(&self, relative: &str, event: &ChangeEvent) -> Result<()> {
        let Some(config) = config_change(relative, event)? else {
            return Ok(());
        };
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        let registry = &self.ctx.registry;
        let cached = registry.current_sharding_total_count(&self.ctx.job_name);
        if cached != 0 && cached != config.sharding_total_count {
            tracing::info!(
                job = %self.ctx.job_name,
                from = cached,
                to = config.sharding_total_count,
                "Sharding total count changed"
            );
            self.sharding.set_resharding_flag().await?;
            self.execution.set_need_fix_execution_info().await?;
        }
        registry.set_current_sharding_total_count(&self.ctx.job_name, config.sharding_total_count);
        Ok(())
    }
}

pub struct FailoverSettingsChangedHandler {
    ctx: Arc<JobContext>,
    failover: Arc<FailoverService>,
}

impl FailoverSettingsChangedHandler {
    pub fn new(ctx: Arc<JobContext>, failover: Arc<FailoverService>) -> Self {
        Self { ctx, failover }
    }
}

#[async_trait]
impl ChangeHandler for FailoverSettingsChangedHandler {
    fn name(&self) -> &'static str {
        "failover-settings"
    }

    async fn handle(&self, relative: &str, event: &ChangeEvent) -> Result<()> {
        let Some(config) = config_change(relative, event)? else {
            return Ok(());
        };
        if self.ctx.is_shutdown() || config.is_failover_active() {
            return Ok(());
        }
        self.failover.remove_failover_info().await
    }
}

pub struct ServersChangedHandler {
    ctx: Arc<JobContext>,
    config: ConfigService,
    sharding: Arc<ShardingService>,
}

impl ServersChangedHandler {
    pub fn new(ctx: Arc<JobContext>, sharding: Arc<ShardingService>) -> Self {
        Self {
            config: ConfigService::new(ctx.clone()),
            ctx,
            sharding,
        }
    }

    async fn reshard(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        if self.config.load().await?.static_sharding && self.sharding.has_sharding_info().await? {
            return Ok(());
        }
        self.sharding.set_resharding_flag().await
    }
}

#[async_trait]
impl ChangeHandler for ServersChangedHandler {
    fn name(&self) -> &'static str {
        "servers-changed"
    }

    async fn handle(&self, relative: &str, _event: &ChangeEvent) -> Result<()> {
        if direct_child(relative, INSTANCES).is_none() && direct_child(relative, SERVERS).is_none() {
            return Ok(());
        }
        self.reshard().await
    }

    async fn on_lagged(&self, _missed: u64) -> Result<()> {
        // A topology change may have been among the dropped events.
        self.reshard().await
    }
}

pub struct JobCrashedHandler {
    ctx: Arc<JobContext>,
    instances: InstanceService,
    failover: Arc<FailoverService>,
}

impl JobCrashedHandler {
    pub fn new(ctx: Arc<JobContext>, failover: Arc<FailoverService>) -> Self {
        Self {
            instances: InstanceService::new(ctx.clone()),
            ctx,
            failover,
        }
    }
}

#[async_trait]
impl ChangeHandler for JobCrashedHandler {
    fn name(&self) -> &'static str {
        "job-crashed"
    }

    async fn handle(&self, relative: &str, event: &ChangeEvent) -> Result<()> {
        if event.kind != ChangeKind::Removed || self.ctx.is_shutdown() {
            return Ok(());
        }

        if let Some((item, leaf)) = parse_item_node(relative) {
            match leaf {
                ITEM_RUNNING => {
                    self.failover.on_item_crashed(item).await?;
                }
                ITEM_FAILOVER => {
                    // Claims are also removed on normal completion; only a
                    // claimant that went away counts as a crash.
                    let owner = event.data_str();
                    if !owner.is_empty() && self.instances.is_instance_online(owner).await? {
                        return Ok(());
                    }
                    self.failover.on_item_crashed(item).await?;
                }
                _ => {}
            }
            return Ok(());
        }

        if let Some(instance_id) = direct_child(relative, INSTANCES) {
            if instance_id == self.ctx.instance()?.instance_id {
                return Ok(());
            }
            self.failover.crash_scan(instance_id).await?;
        }
        Ok(())
    }
}

pub struct LeaderElectionHandler {
    ctx: Arc<JobContext>,
    leader: Arc<LeaderService>,
    servers: ServerService,
}

impl LeaderElectionHandler {
    pub fn new(ctx: Arc<JobContext>, leader: Arc<LeaderService>) -> Self {
        Self {
            servers: ServerService::new(ctx.clone()),
            ctx,
            leader,
        }
    }
}

#[async_trait]
impl ChangeHandler for LeaderElectionHandler {
    fn name(&self) -> &'static str {
        "leader-election"
    }

    async fn handle(&self, relative: &str, event: &ChangeEvent) -> Result<()> {
        use crate::leader::LeaderGate;

        if self.ctx.is_shutdown() {
            return Ok(());
        }
        if relative == LEADER_ELECTION_INSTANCE && event.kind == ChangeKind::Removed {
            if self.servers.is_local_server_available().await? {
                self.leader.elect_leader().await?;
            }
            return Ok(());
        }
        if let Some(ip) = direct_child(relative, SERVERS) {
            if ip == self.ctx.instance()?.server_ip
                && event.kind != ChangeKind::Removed
                && event.data_str() == DISABLED
            {
                self.leader.remove_leader().await?;
            }
        }
        Ok(())
    }
}
