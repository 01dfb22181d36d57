//! Node layout of a job tree
//!
//! ```text
//! /{namespace}/{job}/config
//!                   /servers/{ip}
//!                   /instances/{instanceId}
//!                   /sharding/{item}/{instance|running|completed|misfire|disabled|failover}
//!                   /leader/election/instance
//!                   /leader/sharding/{necessary|processing}
//!                   /leader/failover/items/{item}
//!                   /leader/failover/latch
//!                   /leader/execution/{necessary|cleaning}
//! ```

pub const CONFIG: &str = "config";
pub const SERVERS: &str = "servers";
pub const INSTANCES: &str = "instances";
pub const SHARDING: &str = "sharding";

pub const ITEM_INSTANCE: &str = "instance";
pub const ITEM_RUNNING: &str = "running";
pub const ITEM_COMPLETED: &str = "completed";
pub const ITEM_MISFIRE: &str = "misfire";
pub const ITEM_DISABLED: &str = "disabled";
pub const ITEM_FAILOVER: &str = "failover";
pub const ITEM_LAST_BEGIN: &str = "lastBeginTime";
pub const ITEM_LAST_COMPLETE: &str = "lastCompleteTime";

pub const LEADER_ELECTION_INSTANCE: &str = "leader/election/instance";
pub const SHARDING_NECESSARY: &str = "leader/sharding/necessary";
pub const SHARDING_PROCESSING: &str = "leader/sharding/processing";
pub const FAILOVER_ITEMS: &str = "leader/failover/items";
pub const FAILOVER_LATCH: &str = "leader/failover/latch";
pub const EXECUTION_NECESSARY: &str = "leader/execution/necessary";
pub const EXECUTION_CLEANING: &str = "leader/execution/cleaning";

/// Builds absolute paths for one job and maps absolute paths back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    root: String,
}

impl JobNodePath {
    pub fn new(namespace: &str, job_name: &str) -> Self {
        Self {
            root: format!("/{}/{}", namespace, job_name),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Absolute path of a node relative to the job root.
    pub fn full(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative)
    }

    /// Inverse of [`full`](Self::full); `None` for paths outside this job.
    pub fn relative<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.root.as_str())?.strip_prefix('/')
    }
}

/// Relative path `sharding/{item}/{leaf}`.
pub fn item_path(item: u32, leaf: &str) -> String {
    format!("{}/{}/{}", SHARDING, item, leaf)
}

/// Relative path `leader/failover/items/{item}`.
pub fn failover_item_path(item: u32) -> String {
    format!("{}/{}", FAILOVER_ITEMS, item)
}

/// Parse `sharding/{item}/{leaf}` into `(item, leaf)`.
pub fn parse_item_node(relative: &str) -> Option<(u32, &str)> {
    let rest = relative.strip_prefix(SHARDING)?.strip_prefix('/')?;
    let (item, leaf) = rest.split_once('/')?;
    if leaf.contains('/') {
        return None;
    }
    Some((item.parse().ok()?, leaf))
}

/// Parse `{prefix}/{child}` into `child` when it is a direct child.
pub fn direct_child<'a>(relative: &'a str, prefix: &str) -> Option<&'a str> {
    let child = relative.strip_prefix(prefix)?.strip_prefix('/')?;
    (!child.is_empty() && !child.contains('/')).then_some(child)
}
