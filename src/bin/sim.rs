//! Fleet simulator
//!
//! Runs several instances of one job against an in-process coordination
//! tree, prints every tick, and optionally kills one instance mid-tick to
//! show failover.

use async_trait::async_trait;
use clap::Parser;
use futures::future::join_all;
use minishard::common::parse_duration;
use minishard::{
    Config, InstanceRegistry, JobConfig, JobScheduler, JobTrigger, MemorySession, MemoryTree,
    ShardedJob, ShardingContext, TickReport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const JOB_NAME: &str = "sim_job";
/// Rounds of triggered executions drained after each tick.
const MAX_TRIGGER_ROUNDS: usize = 4;

#[derive(Parser)]
#[command(name = "minishard-sim")]
#[command(about = "Simulate a sharded job fleet over an in-memory coordination tree")]
struct Cli {
    /// Number of instances
    #[arg(long, default_value = "3")]
    instances: usize,

    /// Sharding total count
    #[arg(long, default_value = "8")]
    items: u32,

    /// Number of scheduled ticks
    #[arg(long, default_value = "5")]
    ticks: usize,

    /// Kill this instance (0-based) halfway through the second tick
    #[arg(long)]
    crash: Option<usize>,

    /// Enable failover
    #[arg(long)]
    failover: bool,

    /// Sharding strategy (AVG_ALLOCATION, ODEVITY, ROUND_ROBIN, HRW)
    #[arg(long)]
    strategy: Option<String>,

    /// Simulated work per item (e.g. "50ms", "1s")
    #[arg(long, default_value = "40ms")]
    work: String,
}

/// Remembers that an out-of-cycle run was requested.
#[derive(Default)]
struct PendingTrigger {
    fired: AtomicBool,
}

impl JobTrigger for PendingTrigger {
    fn trigger_job(&self, instance_id: &str) -> minishard::Result<()> {
        tracing::info!(instance_id = %instance_id, "Out-of-cycle execution requested");
        self.fired.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SimJob {
    work: Duration,
}

#[async_trait]
impl ShardedJob for SimJob {
    async fn execute(&self, ctx: ShardingContext) -> minishard::Result<()> {
        tokio::time::sleep(self.work).await;
        tracing::debug!(item = ctx.sharding_item, task_id = %ctx.task_id, "Item done");
        Ok(())
    }
}

struct Member {
    name: String,
    session: MemorySession,
    scheduler: Arc<JobScheduler>,
    trigger: Arc<PendingTrigger>,
    alive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base = Config::load();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| base.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if cli.instances == 0 {
        anyhow::bail!("--instances must be at least 1");
    }
    if let Some(victim) = cli.crash {
        if victim >= cli.instances {
            anyhow::bail!("--crash {} is out of range for {} instances", victim, cli.instances);
        }
    }
    let job = SimJob {
        work: parse_duration(&cli.work)?,
    };

    let mut job_config = JobConfig::new(JOB_NAME, cli.items).with_failover(cli.failover);
    if let Some(strategy) = &cli.strategy {
        job_config = job_config.with_strategy(strategy.clone());
    }

    let tree = MemoryTree::new(base.event_capacity);
    let mut members = Vec::with_capacity(cli.instances);
    for i in 0..cli.instances {
        let config = Config {
            server_ip: format!("10.0.0.{}", i + 1),
            ..base.clone()
        };
        let session = tree.connect();
        let trigger = Arc::new(PendingTrigger::default());
        let scheduler = JobScheduler::register(
            Arc::new(session.clone()),
            InstanceRegistry::new(),
            &config,
            job_config.clone(),
            trigger.clone(),
            Vec::new(),
        )
        .await?;
        let name = scheduler.instance_id()?;
        println!("✓ {} online", name);
        members.push(Member {
            name,
            session,
            scheduler,
            trigger,
            alive: true,
        });
    }

    tokio::select! {
        _ = run_ticks(&cli, &job, &mut members) => {}
        _ = shutdown_signal() => println!("\ninterrupted"),
    }

    for member in members.iter().filter(|m| m.alive) {
        member.scheduler.shutdown().await?;
    }
    println!("\n✓ fleet shut down");
    Ok(())
}

async fn run_ticks(cli: &Cli, job: &SimJob, members: &mut [Member]) {
    for tick in 1..=cli.ticks {
        println!("\n── tick {} ──", tick);
        let victim = cli.crash.filter(|_| tick == 2);

        let live: Vec<&Member> = members.iter().filter(|m| m.alive).collect();
        if live.is_empty() {
            println!("no live instances left");
            break;
        }
        let runs = join_all(live.iter().map(|m| run_tick(m, job)));
        let crash = async {
            if let Some(victim) = victim {
                tokio::time::sleep(job.work / 2).await;
                let member = &members[victim];
                println!("✗ {} crashed", member.name);
                member.session.expire();
            }
        };
        let (reports, ()) = tokio::join!(runs, crash);
        for (name, report) in reports {
            print_report(name, &report);
        }

        if let Some(victim) = victim {
            let member = &mut members[victim];
            member.alive = false;
            // Its session is gone; only the local teardown can succeed.
            if let Err(e) = member.scheduler.shutdown().await {
                tracing::debug!(instance_id = %member.name, error = %e, "Teardown after crash");
            }
        }

        drain_triggers(members, job).await;
        print_assignment(members).await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn run_tick<'a>(
    member: &'a Member,
    job: &SimJob,
) -> (&'a str, minishard::Result<TickReport>) {
    (member.name.as_str(), member.scheduler.execute_tick(job).await)
}

/// Run the out-of-cycle executions failover asked for.
async fn drain_triggers(members: &[Member], job: &SimJob) {
    for _ in 0..MAX_TRIGGER_ROUNDS {
        let fired: Vec<&Member> = members
            .iter()
            .filter(|m| m.alive && m.trigger.fired.swap(false, Ordering::SeqCst))
            .collect();
        if fired.is_empty() {
            return;
        }
        for (name, report) in join_all(fired.iter().map(|m| run_tick(m, job))).await {
            print_report(name, &report);
        }
    }
}

async fn print_assignment(members: &[Member]) {
    let Some(member) = members.iter().find(|m| m.alive) else {
        return;
    };
    match member.scheduler.sharding().get_assignment().await {
        Ok(assignment) => {
            println!("  assignment:");
            for (item, owner) in assignment {
                println!("    {:>3} → {}", item, owner);
            }
        }
        Err(e) => println!("  assignment unavailable: {}", e),
    }
}

fn print_report(name: &str, report: &minishard::Result<TickReport>) {
    match report {
        Ok(TickReport::Idle) => println!("  {}: idle", name),
        Ok(TickReport::Misfired { items }) => println!("  {}: misfired {:?}", name, items),
        Ok(TickReport::Executed {
            items,
            failed,
            failover,
        }) => {
            let kind = if *failover { "failover" } else { "ran" };
            if failed.is_empty() {
                println!("  {}: {} {:?}", name, kind, items);
            } else {
                println!("  {}: {} {:?}, failed {:?}", name, kind, items, failed);
            }
        }
        Err(e) => println!("  {}: error: {}", name, e),
    }
}
