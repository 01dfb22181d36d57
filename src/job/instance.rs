//! Instance registration (`instances/{instanceId}`)
//!
//! The instance node is ephemeral: it is this process's liveness as far as
//! sharding is concerned.

use super::server::ServerService;
use super::JobContext;
use crate::common::{server_ip_of, Result};
use crate::storage::path::INSTANCES;
use std::sync::Arc;

#[derive(Clone)]
pub struct InstanceService {
    ctx: Arc<JobContext>,
    servers: ServerService,
}

impl InstanceService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        let servers = ServerService::new(ctx.clone());
        Self { ctx, servers }
    }

    pub async fn persist_online(&self) -> Result<()> {
        let instance = self.ctx.instance()?;
        self.ctx
            .storage
            .fill_ephemeral(&instance_path(&instance.instance_id), "")
            .await?;
        tracing::info!(job = %self.ctx.job_name, instance_id = %instance.instance_id, "Instance online");
        Ok(())
    }

    pub async fn remove_instance(&self) -> Result<()> {
        let instance = self.ctx.instance()?;
        self.ctx
            .storage
            .remove_if_existed(&instance_path(&instance.instance_id))
            .await
    }

    pub async fn is_instance_online(&self, instance_id: &str) -> Result<bool> {
        self.ctx
            .storage
            .is_node_existed(&instance_path(instance_id))
            .await
    }

    pub async fn is_local_instance_online(&self) -> Result<bool> {
        let instance = self.ctx.instance()?;
        self.is_instance_online(&instance.instance_id).await
    }

    /// Live instances whose server is enabled, in listing order.
    pub async fn get_available_job_instances(&self) -> Result<Vec<String>> {
        let mut available = Vec::new();
        for id in self.ctx.storage.get_children(INSTANCES).await? {
            if self.servers.is_enable_server(server_ip_of(&id)).await? {
                available.push(id);
            }
        }
        Ok(available)
    }
}

fn instance_path(instance_id: &str) -> String {
    format!("{}/{}", INSTANCES, instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::testing::node;
    use crate::storage::MemoryTree;

    #[tokio::test]
    async fn test_available_instances_skip_disabled_servers() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        InstanceService::new(a.ctx.clone())
            .persist_online()
            .await
            .unwrap();
        InstanceService::new(b.ctx.clone())
            .persist_online()
            .await
            .unwrap();

        let instances = InstanceService::new(a.ctx.clone());
        assert_eq!(
            instances.get_available_job_instances().await.unwrap(),
            vec!["10.0.0.1@-@a", "10.0.0.2@-@b"]
        );

        ServerService::new(a.ctx.clone())
            .set_server_disabled("10.0.0.2", true)
            .await
            .unwrap();
        assert_eq!(
            instances.get_available_job_instances().await.unwrap(),
            vec!["10.0.0.1@-@a"]
        );
    }

    #[tokio::test]
    async fn test_instance_disappears_with_session() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let b = node(&tree, "10.0.0.2", "b");
        InstanceService::new(a.ctx.clone())
            .persist_online()
            .await
            .unwrap();

        let observer = InstanceService::new(b.ctx.clone());
        assert!(observer.is_instance_online("10.0.0.1@-@a").await.unwrap());
        a.session.expire();
        assert!(!observer.is_instance_online("10.0.0.1@-@a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_instance() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let instances = InstanceService::new(a.ctx.clone());
        instances.persist_online().await.unwrap();
        assert!(instances.is_local_instance_online().await.unwrap());
        instances.remove_instance().await.unwrap();
        assert!(!instances.is_local_instance_online().await.unwrap());
    }
}
