//! What one tick of a job gets to see

use std::collections::BTreeMap;
use uuid::Uuid;

/// The items this instance runs in one tick, with their parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContexts {
    pub task_id: String,
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    /// Item → parameter; every item to run is a key, parameter may be empty.
    pub sharding_item_parameters: BTreeMap<u32, String>,
    /// Items are failover claims, not this instance's own assignment.
    pub is_failover: bool,
}

impl ShardingContexts {
    pub fn new(
        job_name: impl Into<String>,
        sharding_total_count: u32,
        job_parameter: impl Into<String>,
        sharding_item_parameters: BTreeMap<u32, String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            job_name: job_name.into(),
            sharding_total_count,
            job_parameter: job_parameter.into(),
            sharding_item_parameters,
            is_failover: false,
        }
    }

    /// Build contexts for `items`, looking parameters up in `params`.
    pub fn for_items(
        job_name: impl Into<String>,
        sharding_total_count: u32,
        job_parameter: impl Into<String>,
        items: &[u32],
        params: &BTreeMap<u32, String>,
    ) -> Self {
        let selected = items
            .iter()
            .map(|item| (*item, params.get(item).cloned().unwrap_or_default()))
            .collect();
        Self::new(job_name, sharding_total_count, job_parameter, selected)
    }

    pub fn failover(mut self) -> Self {
        self.is_failover = true;
        self
    }

    pub fn items(&self) -> Vec<u32> {
        self.sharding_item_parameters.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sharding_item_parameters.is_empty()
    }

    /// Split into one context per item.
    pub fn contexts(&self) -> Vec<ShardingContext> {
        self.sharding_item_parameters
            .iter()
            .map(|(item, param)| ShardingContext {
                task_id: self.task_id.clone(),
                job_name: self.job_name.clone(),
                sharding_total_count: self.sharding_total_count,
                job_parameter: self.job_parameter.clone(),
                sharding_item: *item,
                sharding_parameter: param.clone(),
            })
            .collect()
    }
}

/// One item's view of a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingContext {
    pub task_id: String,
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    pub sharding_item: u32,
    pub sharding_parameter: String,
}
