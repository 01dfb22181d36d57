//! Job bootstrap and the per-tick execution bracket
//!
//! [`JobScheduler::register`] wires one job into this process: registry
//! entry, services, change handlers, online nodes, first election. The
//! trigger layer then calls [`JobScheduler::execute_tick`] on every fire
//! (scheduled or triggered by failover) and [`JobScheduler::shutdown`] once.

use super::config::ConfigService;
use super::context::{ShardingContext, ShardingContexts};
use super::execution::ExecutionService;
use super::facade::{JobFacade, JobListener};
use super::failover::FailoverService;
use super::instance::InstanceService;
use super::server::ServerService;
use super::sharding::ShardingService;
use super::{JobContext, JobNodeStorage};
use crate::common::{Config, JobConfig, Result};
use crate::leader::{LeaderGate, LeaderService};
use crate::listener::{
    FailoverSettingsChangedHandler, JobCrashedHandler, LeaderElectionHandler, ListenerDispatcher,
    ServersChangedHandler, ShardingTotalCountChangedHandler,
};
use crate::registry::{InstanceRegistry, JobInstance, JobTrigger};
use crate::storage::{CoordinationClient, JobNodePath};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

/// An item's result, or the payload it panicked with.
type ItemOutcome = std::thread::Result<Result<()>>;

/// Business logic of a sharded job, run once per item per tick.
#[async_trait]
pub trait ShardedJob: Send + Sync {
    async fn execute(&self, ctx: ShardingContext) -> Result<()>;
}

/// What a call to [`JobScheduler::execute_tick`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// Nothing assigned to this instance.
    Idle,
    /// The previous tick still runs these items; a misfire was recorded.
    Misfired { items: Vec<u32> },
    Executed {
        items: Vec<u32>,
        /// Items whose execution returned an error or panicked.
        failed: Vec<u32>,
        failover: bool,
    },
}

pub struct JobScheduler {
    ctx: Arc<JobContext>,
    leader: Arc<LeaderService>,
    execution: Arc<ExecutionService>,
    sharding: Arc<ShardingService>,
    failover: Arc<FailoverService>,
    facade: JobFacade,
    servers: ServerService,
    instances: InstanceService,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Register `job` in this process and bring it online.
    ///
    /// A stored config wins over `job` unless `job.overwrite` is set.
    pub async fn register(
        client: Arc<dyn CoordinationClient>,
        registry: Arc<InstanceRegistry>,
        config: &Config,
        job: JobConfig,
        trigger: Arc<dyn JobTrigger>,
        listeners: Vec<Arc<dyn JobListener>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        job.validate()?;

        let instance = JobInstance::new(&config.server_ip, config.instance_suffix.as_deref());
        let instance_id = instance.instance_id.clone();
        let shutdown = registry.register_job(&job.job_name, instance, trigger, 0);
        let storage =
            JobNodeStorage::new(client, JobNodePath::new(&config.namespace, &job.job_name));
        let ctx = JobContext::new(job.job_name.clone(), storage, registry, config.wait);

        let leader = Arc::new(LeaderService::new(ctx.clone()));
        let gate: Arc<dyn LeaderGate> = leader.clone();
        let execution = Arc::new(ExecutionService::new(ctx.clone(), gate.clone()));
        let sharding = Arc::new(ShardingService::new(
            ctx.clone(),
            gate.clone(),
            execution.clone(),
        ));
        let failover = Arc::new(FailoverService::new(
            ctx.clone(),
            gate,
            sharding.clone(),
            execution.clone(),
        ));
        let facade = JobFacade::new(
            ctx.clone(),
            sharding.clone(),
            execution.clone(),
            failover.clone(),
            listeners,
        );

        // Subscribe before the first write so nothing from here on is missed.
        let watch = ctx.storage.watch();
        let in_force = ConfigService::new(ctx.clone()).persist(&job).await?;
        ctx.registry
            .set_current_sharding_total_count(&ctx.job_name, in_force.sharding_total_count);

        let mut dispatcher = ListenerDispatcher::new(ctx.storage.path().clone());
        dispatcher.add_handler(Arc::new(ShardingTotalCountChangedHandler::new(
            ctx.clone(),
            sharding.clone(),
            execution.clone(),
        )));
        dispatcher.add_handler(Arc::new(FailoverSettingsChangedHandler::new(
            ctx.clone(),
            failover.clone(),
        )));
        dispatcher.add_handler(Arc::new(ServersChangedHandler::new(
            ctx.clone(),
            sharding.clone(),
        )));
        dispatcher.add_handler(Arc::new(JobCrashedHandler::new(
            ctx.clone(),
            failover.clone(),
        )));
        dispatcher.add_handler(Arc::new(LeaderElectionHandler::new(
            ctx.clone(),
            leader.clone(),
        )));
        let handle = dispatcher.start(watch, shutdown);

        let scheduler = Arc::new(Self {
            servers: ServerService::new(ctx.clone()),
            instances: InstanceService::new(ctx.clone()),
            ctx,
            leader,
            execution,
            sharding,
            failover,
            facade,
            dispatcher: Mutex::new(Some(handle)),
        });
        scheduler.start_up(&config.server_ip).await?;

        tracing::info!(
            job = %scheduler.ctx.job_name,
            instance_id = %instance_id,
            sharding_total_count = in_force.sharding_total_count,
            failover = in_force.failover,
            "Job registered"
        );
        Ok(scheduler)
    }

    async fn start_up(&self, server_ip: &str) -> Result<()> {
        // An operator's disable outlives restarts.
        let enabled = self.servers.is_enable_server(server_ip).await?;
        self.servers.persist_online(enabled).await?;
        self.instances.persist_online().await?;
        self.leader.elect_leader().await?;
        self.sharding.set_resharding_flag().await?;
        self.execution.clean_previous_execution_info().await
    }

    /// Run one tick: resolve items, bracket them with begin/complete, run
    /// misfire makeups, then drain the failover queue.
    pub async fn execute_tick(&self, job: &dyn ShardedJob) -> Result<TickReport> {
        let contexts = self.facade.get_sharding_contexts().await?;
        if contexts.is_empty() {
            return Ok(TickReport::Idle);
        }
        let items = contexts.items();
        if self.facade.misfire_if_running(&items).await? {
            tracing::info!(job = %self.ctx.job_name, items = ?items, "Previous tick still running, misfire recorded");
            return Ok(TickReport::Misfired { items });
        }

        self.facade.before_job_executed(&contexts);
        let mut failed = self.run_round(job, &contexts).await?;
        while self.facade.is_execute_misfired(&items).await? {
            self.facade.clear_misfire(&items).await?;
            tracing::info!(job = %self.ctx.job_name, items = ?items, "Running misfired tick");
            for item in self.run_round(job, &contexts).await? {
                if !failed.contains(&item) {
                    failed.push(item);
                }
            }
        }
        self.facade.failover_if_necessary().await?;
        self.facade.after_job_executed(&contexts);

        Ok(TickReport::Executed {
            items,
            failed,
            failover: contexts.is_failover,
        })
    }

    async fn run_round(&self, job: &dyn ShardedJob, contexts: &ShardingContexts) -> Result<Vec<u32>> {
        self.facade.register_job_begin(contexts).await?;

        // Boxed so the tick future stays `Send` for spawned triggers.
        let runs: Vec<BoxFuture<'_, (u32, ItemOutcome)>> = contexts
            .contexts()
            .into_iter()
            .map(|item_ctx| {
                let item = item_ctx.sharding_item;
                async move { (item, AssertUnwindSafe(job.execute(item_ctx)).catch_unwind().await) }
                    .boxed()
            })
            .collect();
        let mut failed = Vec::new();
        for (item, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(job = %self.ctx.job_name, item, error = %e, "Item execution failed");
                    failed.push(item);
                }
                Err(_) => {
                    tracing::error!(job = %self.ctx.job_name, item, "Item execution panicked");
                    failed.push(item);
                }
            }
        }

        // A failed item still completed its tick; only a crash leaves it running.
        self.facade.register_job_completed(contexts).await?;
        Ok(failed)
    }

    /// Leave the cluster: step down, go offline, stop every wait and the
    /// dispatcher. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        let stepped_down = self.leader.remove_leader().await;
        let offline = self.instances.remove_instance().await;
        self.ctx.registry.shutdown(&self.ctx.job_name);

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(job = %self.ctx.job_name, error = %e, "Dispatcher task failed");
            }
        }
        tracing::info!(job = %self.ctx.job_name, "Job shut down");
        stepped_down.and(offline)
    }

    pub fn job_name(&self) -> &str {
        &self.ctx.job_name
    }

    pub fn instance_id(&self) -> Result<String> {
        Ok(self.ctx.instance()?.instance_id)
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    pub fn facade(&self) -> &JobFacade {
        &self.facade
    }

    pub fn leader(&self) -> &Arc<LeaderService> {
        &self.leader
    }

    pub fn execution(&self) -> &Arc<ExecutionService> {
        &self.execution
    }

    pub fn sharding(&self) -> &Arc<ShardingService> {
        &self.sharding
    }

    pub fn failover(&self) -> &Arc<FailoverService> {
        &self.failover
    }

    pub fn servers(&self) -> &ServerService {
        &self.servers
    }
}
