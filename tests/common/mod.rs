//! Fleet fixtures for the scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use minishard::common::WaitPolicy;
use minishard::{
    Config, InstanceRegistry, JobConfig, JobScheduler, JobTrigger, MemorySession, MemoryTree,
    ShardedJob, ShardingContext, TickReport,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const NAMESPACE: &str = "it";

#[derive(Default)]
pub struct RecordingTrigger {
    calls: Mutex<Vec<String>>,
}

impl RecordingTrigger {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl JobTrigger for RecordingTrigger {
    fn trigger_job(&self, instance_id: &str) -> minishard::Result<()> {
        self.calls.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

/// Records every item it runs, optionally taking its time.
#[derive(Default)]
pub struct Collect {
    pub seen: Mutex<Vec<u32>>,
    pub work: Duration,
}

impl Collect {
    pub fn slow(work: Duration) -> Self {
        Self {
            work,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<u32> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort();
        seen
    }
}

#[async_trait]
impl ShardedJob for Collect {
    async fn execute(&self, ctx: ShardingContext) -> minishard::Result<()> {
        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        self.seen.lock().unwrap().push(ctx.sharding_item);
        Ok(())
    }
}

pub struct Member {
    pub session: MemorySession,
    pub scheduler: Arc<JobScheduler>,
    pub trigger: Arc<RecordingTrigger>,
}

pub async fn join(tree: &Arc<MemoryTree>, ip: &str, job: JobConfig) -> Member {
    let config = Config {
        namespace: NAMESPACE.into(),
        server_ip: ip.into(),
        wait: WaitPolicy {
            initial_ms: 1,
            max_ms: 5,
        },
        ..Config::default()
    };
    let session = tree.connect();
    let trigger = Arc::new(RecordingTrigger::default());
    let scheduler = JobScheduler::register(
        Arc::new(session.clone()),
        InstanceRegistry::new(),
        &config,
        job,
        trigger.clone(),
        Vec::new(),
    )
    .await
    .unwrap();
    Member {
        session,
        scheduler,
        trigger,
    }
}

pub fn executed_items(report: &TickReport) -> Vec<u32> {
    match report {
        TickReport::Executed { items, .. } => items.clone(),
        _ => Vec::new(),
    }
}

/// Give the dispatchers a moment to catch up with the tree.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(40)).await;
}

pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
