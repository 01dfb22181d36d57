//! Hashing utilities for minishard
//!
//! - BLAKE3-derived 64-bit hashes for stable, platform-independent tie-breaks
//! - HRW (Highest Random Weight) owner selection for sticky item placement

/// Stable 64-bit hash of a name (job names, instance ids).
pub fn name_hash(name: &str) -> u64 {
    let hash = blake3::hash(name.as_bytes());
    let mut first = [0u8; 8];
    first.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(first)
}

/// HRW (Highest Random Weight) winner for a key
///
/// Every node is scored against the key; the heaviest wins, ties fall back to
/// the node name. A node joining or leaving only moves the keys it wins or
/// held.
pub fn hrw_owner<'a>(key: &str, nodes: &'a [String]) -> Option<&'a String> {
    nodes
        .iter()
        .max_by(|a, b| {
            name_hash(&format!("{}{}", key, a))
                .cmp(&name_hash(&format!("{}{}", key, b)))
                .then_with(|| b.cmp(a))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<String> {
        vec![
            "node1".to_string(),
            "node2".to_string(),
            "node3".to_string(),
        ]
    }

    #[test]
    fn test_name_hash_deterministic() {
        assert_eq!(name_hash("report-job"), name_hash("report-job"));
        assert_ne!(name_hash("report-job"), name_hash("backup-job"));
    }

    #[test]
    fn test_hrw_owner_consistent() {
        let nodes = nodes();
        for key in ["item-0", "item-1", "item-2", "item-3"] {
            let owner = hrw_owner(key, &nodes);
            assert!(owner.is_some());
            assert_eq!(owner, hrw_owner(key, &nodes));
        }
        assert_eq!(hrw_owner("x", &[]), None);
    }

    #[test]
    fn test_hrw_owner_ignores_node_order() {
        let mut reversed = nodes();
        reversed.reverse();
        for i in 0..32 {
            let key = format!("item-{}", i);
            assert_eq!(hrw_owner(&key, &nodes()), hrw_owner(&key, &reversed));
        }
    }

    #[test]
    fn test_hrw_removal_only_moves_lost_keys() {
        let all = nodes();
        let survivors = vec!["node1".to_string(), "node3".to_string()];

        for i in 0..64 {
            let key = format!("item-{}", i);
            let before = hrw_owner(&key, &all).unwrap().clone();
            let after = hrw_owner(&key, &survivors).unwrap().clone();
            if before != "node2" {
                assert_eq!(before, after);
            }
        }
    }
}
