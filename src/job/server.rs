//! Server registration (`servers/{ip}`)
//!
//! A server node is persistent and holds either nothing (enabled) or
//! `DISABLED`. Disabling a server takes every instance on that host out of
//! sharding without stopping the processes.

use super::JobContext;
use crate::common::{server_ip_of, Result};
use crate::storage::path::{INSTANCES, SERVERS};
use std::sync::Arc;

pub const DISABLED: &str = "DISABLED";

#[derive(Clone)]
pub struct ServerService {
    ctx: Arc<JobContext>,
}

impl ServerService {
    pub fn new(ctx: Arc<JobContext>) -> Self {
        Self { ctx }
    }

    /// Register the local server, enabled or not.
    pub async fn persist_online(&self, enabled: bool) -> Result<()> {
        if self.ctx.is_shutdown() {
            return Ok(());
        }
        let ip = self.ctx.instance()?.server_ip;
        self.set_server_disabled(&ip, !enabled).await
    }

    /// Administrative switch for any server.
    pub async fn set_server_disabled(&self, ip: &str, disabled: bool) -> Result<()> {
        let data = if disabled { DISABLED } else { "" };
        self.ctx
            .storage
            .replace(&server_path(ip), data.to_string())
            .await?;
        tracing::info!(job = %self.ctx.job_name, server_ip = %ip, disabled, "Server state persisted");
        Ok(())
    }

    /// Unknown servers count as enabled; only an explicit flag disables.
    pub async fn is_enable_server(&self, ip: &str) -> Result<bool> {
        Ok(self.ctx.storage.get_node_data(&server_path(ip)).await?.as_deref() != Some(DISABLED))
    }

    /// Enabled and hosting at least one live instance of this job.
    pub async fn is_available_server(&self, ip: &str) -> Result<bool> {
        Ok(self.is_enable_server(ip).await? && self.has_online_instances(ip).await?)
    }

    pub async fn has_available_servers(&self) -> Result<bool> {
        for ip in self.ctx.storage.get_children(SERVERS).await? {
            if self.is_available_server(&ip).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn is_local_server_available(&self) -> Result<bool> {
        let ip = self.ctx.instance()?.server_ip;
        self.is_available_server(&ip).await
    }

    async fn has_online_instances(&self, ip: &str) -> Result<bool> {
        Ok(self
            .ctx
            .storage
            .get_children(INSTANCES)
            .await?
            .iter()
            .any(|id| server_ip_of(id) == ip))
    }
}

fn server_path(ip: &str) -> String {
    format!("{}/{}", SERVERS, ip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::instance::InstanceService;
    use crate::job::testing::node;
    use crate::storage::MemoryTree;

    #[tokio::test]
    async fn test_availability_needs_instance() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let servers = ServerService::new(a.ctx.clone());

        servers.persist_online(true).await.unwrap();
        assert!(servers.is_enable_server("10.0.0.1").await.unwrap());
        assert!(!servers.is_available_server("10.0.0.1").await.unwrap());
        assert!(!servers.has_available_servers().await.unwrap());

        InstanceService::new(a.ctx.clone())
            .persist_online()
            .await
            .unwrap();
        assert!(servers.is_available_server("10.0.0.1").await.unwrap());
        assert!(servers.has_available_servers().await.unwrap());
        assert!(servers.is_local_server_available().await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_server() {
        let tree = MemoryTree::new(64);
        let a = node(&tree, "10.0.0.1", "a");
        let servers = ServerService::new(a.ctx.clone());
        InstanceService::new(a.ctx.clone())
            .persist_online()
            .await
            .unwrap();

        servers.persist_online(false).await.unwrap();
        assert!(!servers.is_enable_server("10.0.0.1").await.unwrap());
        assert!(!servers.is_available_server("10.0.0.1").await.unwrap());

        servers.set_server_disabled("10.0.0.1", false).await.unwrap();
        assert!(servers.is_available_server("10.0.0.1").await.unwrap());
    }
}
