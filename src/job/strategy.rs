//! Sharding strategies
//!
//! A strategy maps `(ordered instances, item count, job name)` to
//! `instance → items`. Every strategy here is deterministic: the same input
//! always produces the same assignment, whichever process computes it.

use crate::common::{hrw_owner, name_hash, Error, Result};
use std::collections::BTreeMap;

pub const AVG_ALLOCATION: &str = "AVG_ALLOCATION";
pub const ODEVITY: &str = "ODEVITY";
pub const ROUND_ROBIN: &str = "ROUND_ROBIN";
pub const HRW: &str = "HRW";

pub type Assignment = BTreeMap<String, Vec<u32>>;

pub trait ShardingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Partition `0..total` across `instances`. Empty input, empty output.
    fn sharding(&self, instances: &[String], total: u32, job_name: &str) -> Assignment;
}

/// Resolve a configured strategy name; `None` means the default.
pub fn strategy_for(name: Option<&str>) -> Result<Box<dyn ShardingStrategy>> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        None => Ok(Box::new(AverageAllocation)),
        Some(n) if n.eq_ignore_ascii_case(AVG_ALLOCATION) => Ok(Box::new(AverageAllocation)),
        Some(n) if n.eq_ignore_ascii_case(ODEVITY) => Ok(Box::new(OdevitySortByName)),
        Some(n) if n.eq_ignore_ascii_case(ROUND_ROBIN) => Ok(Box::new(RoundRobinByName)),
        Some(n) if n.eq_ignore_ascii_case(HRW) => Ok(Box::new(RendezvousHashing)),
        Some(other) => Err(Error::InvalidConfig(format!(
            "unknown sharding strategy '{}'",
            other
        ))),
    }
}

/// `total / k` contiguous items each, then the remainder one by one to the
/// first instances: 7 items over 3 instances → `[0,1,6] [2,3] [4,5]`.
pub struct AverageAllocation;

impl ShardingStrategy for AverageAllocation {
    fn name(&self) -> &'static str {
        AVG_ALLOCATION
    }

    fn sharding(&self, instances: &[String], total: u32, _job_name: &str) -> Assignment {
        average(instances, total)
    }
}

/// Average allocation, with the instance list reversed for jobs whose name
/// hashes odd. Spreads the remainder items of many small jobs over both ends
/// of the fleet.
pub struct OdevitySortByName;

impl ShardingStrategy for OdevitySortByName {
    fn name(&self) -> &'static str {
        ODEVITY
    }

    fn sharding(&self, instances: &[String], total: u32, job_name: &str) -> Assignment {
        if name_hash(job_name) % 2 == 0 {
            return average(instances, total);
        }
        let reversed: Vec<String> = instances.iter().rev().cloned().collect();
        average(&reversed, total)
    }
}

/// Average allocation over the instance list rotated by the job-name hash.
pub struct RoundRobinByName;

impl ShardingStrategy for RoundRobinByName {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn sharding(&self, instances: &[String], total: u32, job_name: &str) -> Assignment {
        if instances.is_empty() {
            return Assignment::new();
        }
        let offset = (name_hash(job_name) % instances.len() as u64) as usize;
        let mut rotated = instances.to_vec();
        rotated.rotate_left(offset);
        average(&rotated, total)
    }
}

/// Each item goes to its highest-random-weight instance. Only the items of a
/// departed instance move when the fleet shrinks, at the cost of an uneven
/// spread for small item counts.
pub struct RendezvousHashing;

impl ShardingStrategy for RendezvousHashing {
    fn name(&self) -> &'static str {
        HRW
    }

    fn sharding(&self, instances: &[String], total: u32, job_name: &str) -> Assignment {
        let mut result: Assignment = instances.iter().map(|i| (i.clone(), Vec::new())).collect();
        for item in 0..total {
            let key = format!("{}/{}", job_name, item);
            if let Some(owner) = hrw_owner(&key, instances) {
                if let Some(items) = result.get_mut(owner) {
                    items.push(item);
                }
            }
        }
        result
    }
}

fn average(instances: &[String], total: u32) -> Assignment {
    let mut result = Assignment::new();
    if instances.is_empty() {
        return result;
    }
    let k = instances.len() as u32;
    let per = total / k;

    for (idx, instance) in instances.iter().enumerate() {
        let start = idx as u32 * per;
        result.insert(instance.clone(), (start..start + per).collect());
    }
    for (offset, item) in (per * k..total).enumerate() {
        if let Some(items) = result.get_mut(&instances[offset]) {
            items.push(item);
        }
    }
    result
}

/// Invert `instance → items` into `item → instance`.
pub fn invert(assignment: &Assignment) -> BTreeMap<u32, String> {
    assignment
        .iter()
        .flat_map(|(instance, items)| items.iter().map(move |item| (*item, instance.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("10.0.0.{}@-@{}", i + 1, i)).collect()
    }

    fn assert_partition(assignment: &Assignment, total: u32) {
        let mut seen: Vec<u32> = assignment.values().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..total).collect::<Vec<_>>());
    }

    #[test]
    fn test_average_allocation() {
        let instances = fleet(3);
        let result = AverageAllocation.sharding(&instances, 7, "job");
        assert_eq!(result[&instances[0]], vec![0, 1, 6]);
        assert_eq!(result[&instances[1]], vec![2, 3]);
        assert_eq!(result[&instances[2]], vec![4, 5]);
    }

    #[test]
    fn test_three_items_two_instances() {
        let instances = fleet(2);
        let result = AverageAllocation.sharding(&instances, 3, "job");
        assert_eq!(result[&instances[0]], vec![0, 2]);
        assert_eq!(result[&instances[1]], vec![1]);
    }

    #[test]
    fn test_more_instances_than_items() {
        let instances = fleet(4);
        let result = AverageAllocation.sharding(&instances, 2, "job");
        assert_eq!(result[&instances[0]], vec![0]);
        assert_eq!(result[&instances[1]], vec![1]);
        assert!(result[&instances[2]].is_empty());
        assert!(result[&instances[3]].is_empty());
    }

    #[test]
    fn test_empty_fleet() {
        for name in [AVG_ALLOCATION, ODEVITY, ROUND_ROBIN, HRW] {
            let strategy = strategy_for(Some(name)).unwrap();
            assert!(strategy.sharding(&[], 5, "job").is_empty());
        }
    }

    #[test]
    fn test_every_strategy_partitions() {
        for name in [AVG_ALLOCATION, ODEVITY, ROUND_ROBIN, HRW] {
            let strategy = strategy_for(Some(name)).unwrap();
            for k in 1..6 {
                for total in [1, 3, 10, 17] {
                    let result = strategy.sharding(&fleet(k), total, "partition_job");
                    assert_partition(&result, total);
                }
            }
        }
    }

    #[test]
    fn test_deterministic() {
        let instances = fleet(4);
        for name in [AVG_ALLOCATION, ODEVITY, ROUND_ROBIN, HRW] {
            let strategy = strategy_for(Some(name)).unwrap();
            assert_eq!(
                strategy.sharding(&instances, 9, "stable"),
                strategy.sharding(&instances, 9, "stable")
            );
        }
    }

    #[test]
    fn test_odevity_reverses_for_odd_hash() {
        let instances = fleet(2);
        // Find one job name of each parity.
        let odd = (0..)
            .map(|i| format!("job{}", i))
            .find(|n| name_hash(n) % 2 == 1)
            .unwrap();
        let even = (0..)
            .map(|i| format!("job{}", i))
            .find(|n| name_hash(n) % 2 == 0)
            .unwrap();

        let result = OdevitySortByName.sharding(&instances, 3, &odd);
        assert_eq!(result[&instances[1]], vec![0, 2]);
        let result = OdevitySortByName.sharding(&instances, 3, &even);
        assert_eq!(result[&instances[0]], vec![0, 2]);
    }

    #[test]
    fn test_strategy_for() {
        assert_eq!(strategy_for(None).unwrap().name(), AVG_ALLOCATION);
        assert_eq!(strategy_for(Some("")).unwrap().name(), AVG_ALLOCATION);
        assert_eq!(strategy_for(Some("round_robin")).unwrap().name(), ROUND_ROBIN);
        assert!(matches!(
            strategy_for(Some("BIN_PACKING")),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invert() {
        let instances = fleet(2);
        let inverted = invert(&AverageAllocation.sharding(&instances, 3, "job"));
        assert_eq!(inverted.len(), 3);
        assert_eq!(inverted[&1], instances[1]);
    }
}
