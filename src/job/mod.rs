//! Per-job coordination services
//!
//! Each job running in this process gets one [`JobContext`] and one instance
//! of every service below, all sharing the same coordination session:
//! - `config`: the job's configuration snapshot
//! - `server` / `instance`: online registration and availability
//! - `sharding` + `strategy`: item → instance assignment
//! - `execution`: running/completed/misfire bookkeeping
//! - `failover`: crash takeover
//! - `facade` / `scheduler`: what business code and the trigger layer see

pub mod config;
pub mod context;
pub mod execution;
pub mod facade;
pub mod failover;
pub mod instance;
pub mod scheduler;
pub mod server;
pub mod sharding;
pub mod storage;
pub mod strategy;

pub use context::{ShardingContext, ShardingContexts};
pub use facade::{JobFacade, JobListener};
pub use scheduler::{JobScheduler, ShardedJob, TickReport};
pub use storage::JobNodeStorage;

use crate::common::{wait_until, Error, Result, WaitPolicy};
use crate::registry::{InstanceRegistry, JobInstance, JobTrigger};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a job service needs: its tree, the process registry and the
/// polling policy.
pub struct JobContext {
    pub job_name: String,
    pub storage: JobNodeStorage,
    pub registry: Arc<InstanceRegistry>,
    pub wait: WaitPolicy,
}

impl JobContext {
    pub fn new(
        job_name: impl Into<String>,
        storage: JobNodeStorage,
        registry: Arc<InstanceRegistry>,
        wait: WaitPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            job_name: job_name.into(),
            storage,
            registry,
            wait,
        })
    }

    /// This process's instance for the job.
    pub fn instance(&self) -> Result<JobInstance> {
        self.registry
            .get_job_instance(&self.job_name)
            .ok_or_else(|| Error::JobNotRegistered(self.job_name.clone()))
    }

    pub fn trigger(&self) -> Result<Arc<dyn JobTrigger>> {
        self.registry
            .get_trigger(&self.job_name)
            .ok_or_else(|| Error::JobNotRegistered(self.job_name.clone()))
    }

    pub fn is_shutdown(&self) -> bool {
        self.registry.is_shutdown(&self.job_name)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.registry.shutdown_token(&self.job_name)
    }

    /// Cancellable poll bound to this job's lifetime.
    pub async fn wait_until<F, Fut>(&self, what: &str, done: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let token = self.shutdown_token();
        wait_until(what, self.wait, &token, done)
            .await
            .map_err(|e| match e {
                Error::Shutdown(_) => Error::Shutdown(self.job_name.clone()),
                other => other,
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the service tests.

    use super::*;
    use crate::common::JobConfig;
    use crate::registry::JobTrigger;
    use crate::storage::{JobNodePath, MemorySession, MemoryTree};
    use std::sync::Mutex;

    pub const JOB: &str = "test_job";

    #[derive(Default)]
    pub struct RecordingTrigger {
        pub calls: Mutex<Vec<String>>,
    }

    impl RecordingTrigger {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl JobTrigger for RecordingTrigger {
        fn trigger_job(&self, instance_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(instance_id.to_string());
            Ok(())
        }
    }

    pub fn fast_wait() -> WaitPolicy {
        WaitPolicy {
            initial_ms: 1,
            max_ms: 5,
        }
    }

    pub struct Node {
        pub session: MemorySession,
        pub ctx: Arc<JobContext>,
        pub trigger: Arc<RecordingTrigger>,
    }

    /// Register a process `{ip}@-@{suffix}` for the test job on `tree`.
    pub fn node(tree: &Arc<MemoryTree>, ip: &str, suffix: &str) -> Node {
        let session = tree.connect();
        let registry = InstanceRegistry::new();
        let trigger = Arc::new(RecordingTrigger::default());
        registry.register_job(
            JOB,
            JobInstance::from_id(&format!("{}@-@{}", ip, suffix)),
            trigger.clone(),
            0,
        );
        let storage = JobNodeStorage::new(Arc::new(session.clone()), JobNodePath::new("ns", JOB));
        Node {
            session,
            ctx: JobContext::new(JOB, storage, registry, fast_wait()),
            trigger,
        }
    }

    pub async fn put_config(ctx: &JobContext, config: &JobConfig) {
        ctx.storage
            .replace("config", serde_json::to_vec(config).unwrap())
            .await
            .unwrap();
    }
}
