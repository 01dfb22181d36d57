//! Leader gate
//!
//! Leadership is a single ephemeral node, `leader/election/instance`, created
//! exclusively by whichever instance gets there first. It disappears with
//! the leader's session, at which point the election handler lets the
//! remaining instances race again.
//!
//! `execute_under_leadership` uses the same primitive on an arbitrary latch
//! key: the holder runs the task, everybody else skips.

use crate::common::Result;
use crate::job::server::ServerService;
use crate::job::JobContext;
use crate::storage::path::LEADER_ELECTION_INSTANCE;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Narrow leadership capability the job services depend on.
#[async_trait]
pub trait LeaderGate: Send + Sync {
    async fn is_leader(&self) -> Result<bool>;

    /// Try to become leader; returns whether this instance now leads.
    async fn elect_leader(&self) -> Result<bool>;

    /// Wait until some instance leads (standing for election when eligible),
    /// then report whether it is this one.
    async fn is_leader_until_block(&self) -> Result<bool>;

    /// Run `task` only if the latch at `key` can be taken. At most one task
    /// per key runs cluster-wide; returns whether it ran here.
    async fn execute_under_leadership(
        &self,
        key: &str,
        task: BoxFuture<'_, Result<()>>,
    ) -> Result<bool>;
}

pub struct LeaderService {
    ctx: Arc<JobContext>,
    servers: ServerService,
}

impl LeaderService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        let servers = ServerService::new(ctx.clone());
        Self { ctx, servers }
    }

    pub async fn has_leader(&self) -> Result<bool> {
        self.ctx
            .storage
            .is_node_existed(LEADER_ELECTION_INSTANCE)
            .await
    }

    /// Current leader's instance id.
    pub async fn leader_id(&self) -> Result<Option<String>> {
        self.ctx
            .storage
            .get_node_data(LEADER_ELECTION_INSTANCE)
            .await
    }

    /// Step down (shutdown, local server disabled).
    pub async fn remove_leader(&self) -> Result<()> {
        if self.is_leader().await? {
            self.ctx
                .storage
                .remove_if_existed(LEADER_ELECTION_INSTANCE)
                .await?;
            tracing::info!(job = %self.ctx.job_name, "Leadership released");
        }
        Ok(())
    }
}

#[async_trait]
impl LeaderGate for LeaderService {
    async fn is_leader(&self) -> Result<bool> {
        if self.ctx.is_shutdown() {
            return Ok(false);
        }
        let local = self.ctx.instance()?.instance_id;
        Ok(self.leader_id().await?.as_deref() == Some(local.as_str()))
    }

    async fn elect_leader(&self) -> Result<bool> {
        if self.ctx.is_shutdown() {
            return Ok(false);
        }
        let local = self.ctx.instance()?.instance_id;
        if self
            .ctx
            .storage
            .try_fill_ephemeral(LEADER_ELECTION_INSTANCE, local.clone())
            .await?
        {
            tracing::info!(job = %self.ctx.job_name, instance_id = %local, "Elected leader");
            return Ok(true);
        }
        self.is_leader().await
    }

    async fn is_leader_until_block(&self) -> Result<bool> {
        self.ctx
            .wait_until("leader election", || async move {
                if self.has_leader().await? {
                    return Ok(true);
                }
                if !self.servers.has_available_servers().await? {
                    // Nobody can lead; report "not leader" rather than hang.
                    return Ok(true);
                }
                if self.servers.is_local_server_available().await? {
                    self.elect_leader().await?;
                }
                self.has_leader().await
            })
            .await?;
        self.is_leader().await
    }

    async fn execute_under_leadership(
        &self,
        key: &str,
        task: BoxFuture<'_, Result<()>>,
    ) -> Result<bool> {
        let holder = self.ctx.instance()?.instance_id;
        if !self.ctx.storage.try_fill_ephemeral(key, holder).await? {
            tracing::debug!(job = %self.ctx.job_name, latch = key, "Latch busy, skipping");
            return Ok(false);
        }

        let result = task.await;
        if let Err(e) = self.ctx.storage.remove_if_existed(key).await {
            // The latch is ephemeral; it goes away with the session anyway.
            tracing::warn!(job = %self.ctx.job_name, latch = key, error = %e, "Failed to release latch");
        }
        result.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::instance::InstanceService;
    use crate::job::testing::node;
    use crate::storage::path::FAILOVER_LATCH;
    use crate::storage::MemoryTree;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn online(ctx: &Arc<JobContext>) {
        ServerService::new(ctx.clone())
            .persist_online(true)
            .await
            .unwrap();
        InstanceService::new(ctx.clone())
            .persist_online()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_single_leader() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        let leader_a = LeaderService::new(a.ctx.clone());
        let leader_b = LeaderService::new(b.ctx.clone());

        assert!(leader_a.elect_leader().await.unwrap());
        assert!(!leader_b.elect_leader().await.unwrap());
        assert!(leader_a.is_leader().await.unwrap());
        assert!(!leader_b.is_leader().await.unwrap());
        assert_eq!(
            leader_b.leader_id().await.unwrap().as_deref(),
            Some("10.0.0.1@-@a")
        );
    }

    #[tokio::test]
    async fn test_leader_crash_frees_election() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        online(&a.ctx).await;
        online(&b.ctx).await;
        let leader_a = LeaderService::new(a.ctx.clone());
        let leader_b = LeaderService::new(b.ctx.clone());

        assert!(leader_a.elect_leader().await.unwrap());
        a.session.expire();
        assert!(!leader_b.has_leader().await.unwrap());
        assert!(leader_b.is_leader_until_block().await.unwrap());
    }

    #[tokio::test]
    async fn test_until_block_without_available_servers() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let leader = LeaderService::new(a.ctx.clone());
        // Not online anywhere: no election, no hang.
        assert!(!leader.is_leader_until_block().await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_leader() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let leader = LeaderService::new(a.ctx.clone());
        leader.elect_leader().await.unwrap();
        leader.remove_leader().await.unwrap();
        assert!(!leader.has_leader().await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_under_leadership_is_exclusive() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        let leader_a = LeaderService::new(a.ctx.clone());
        let leader_b = LeaderService::new(b.ctx.clone());
        let runs = AtomicU32::new(0);

        let ran = leader_a
            .execute_under_leadership(
                FAILOVER_LATCH,
                Box::pin(async {
                    // While A holds the latch, B must skip.
                    let nested = leader_b
                        .execute_under_leadership(
                            FAILOVER_LATCH,
                            Box::pin(async {
                                runs.fetch_add(10, Ordering::SeqCst);
                                Ok::<_, crate::Error>(())
                            }),
                        )
                        .await?;
                    assert!(!nested);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, crate::Error>(())
                }),
            )
            .await
            .unwrap();

        assert!(ran);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Released afterwards.
        assert!(leader_b
            .execute_under_leadership(FAILOVER_LATCH, Box::pin(async { Ok::<_, crate::Error>(()) }))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_execute_under_leadership_releases_on_error() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let leader = LeaderService::new(a.ctx.clone());

        let result = leader
            .execute_under_leadership(
                FAILOVER_LATCH,
                Box::pin(async { Err::<(), _>(crate::Error::Internal("boom".into())) }),
            )
            .await;
        assert!(result.is_err());
        assert!(!a
            .ctx
            .storage
            .is_node_existed(FAILOVER_LATCH)
            .await
            .unwrap());
    }
}
