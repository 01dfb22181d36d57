//! Process-local job registry
//!
//! One entry per job running in this process. Services never cache job state
//! themselves; they read it here, so removing the entry on shutdown stops
//! every reaction for that job at once.

use crate::common::Result;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

/// Trigger-now capability of the scheduling layer.
pub trait JobTrigger: Send + Sync {
    /// Fire an out-of-cycle execution on `instance_id` as soon as possible.
    fn trigger_job(&self, instance_id: &str) -> Result<()>;
}

/// This process as seen by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInstance {
    pub instance_id: String,
    pub server_ip: String,
}

impl JobInstance {
    pub fn new(server_ip: &str, suffix: Option<&str>) -> Self {
        Self {
            instance_id: crate::common::instance_id(server_ip, suffix),
            server_ip: server_ip.to_string(),
        }
    }

    /// Rebuild from an id found in the tree.
    pub fn from_id(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            server_ip: crate::common::server_ip_of(instance_id).to_string(),
        }
    }
}

struct JobEntry {
    instance: JobInstance,
    trigger: Arc<dyn JobTrigger>,
    running: bool,
    sharding_total_count: u32,
    shutdown: CancellationToken,
}

#[derive(Default)]
pub struct InstanceRegistry {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl InstanceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a job; returns the token cancelled when the job shuts down.
    ///
    /// Re-registering replaces the entry and cancels the previous token.
    pub fn register_job(
        &self,
        job_name: &str,
        instance: JobInstance,
        trigger: Arc<dyn JobTrigger>,
        sharding_total_count: u32,
    ) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let previous = self.write().insert(
            job_name.to_string(),
            JobEntry {
                instance,
                trigger,
                running: false,
                sharding_total_count,
                shutdown: shutdown.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.shutdown.cancel();
        }
        shutdown
    }

    pub fn get_job_instance(&self, job_name: &str) -> Option<JobInstance> {
        self.read().get(job_name).map(|e| e.instance.clone())
    }

    pub fn get_trigger(&self, job_name: &str) -> Option<Arc<dyn JobTrigger>> {
        self.read().get(job_name).map(|e| Arc::clone(&e.trigger))
    }

    pub fn is_job_running(&self, job_name: &str) -> bool {
        self.read().get(job_name).is_some_and(|e| e.running)
    }

    pub fn set_job_running(&self, job_name: &str, running: bool) {
        if let Some(entry) = self.write().get_mut(job_name) {
            entry.running = running;
        }
    }

    /// Shard count this process last saw, `0` when unknown.
    pub fn current_sharding_total_count(&self, job_name: &str) -> u32 {
        self.read()
            .get(job_name)
            .map_or(0, |e| e.sharding_total_count)
    }

    pub fn set_current_sharding_total_count(&self, job_name: &str, count: u32) {
        if let Some(entry) = self.write().get_mut(job_name) {
            entry.sharding_total_count = count;
        }
    }

    /// Token for cancellable waits. Unknown jobs get an already-cancelled one.
    pub fn shutdown_token(&self, job_name: &str) -> CancellationToken {
        match self.read().get(job_name) {
            Some(entry) => entry.shutdown.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn is_shutdown(&self, job_name: &str) -> bool {
        self.read()
            .get(job_name)
            .map_or(true, |e| e.shutdown.is_cancelled())
    }

    /// Remove the job and cancel everything waiting on it.
    pub fn shutdown(&self, job_name: &str) -> bool {
        match self.write().remove(job_name) {
            Some(entry) => {
                entry.shutdown.cancel();
                tracing::info!(job = %job_name, "Job removed from registry");
                true
            }
            None => false,
        }
    }

    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}
