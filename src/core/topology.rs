//! Host CPU topology loaded from a NUMA map file.
//!
//! The map is JSON produced externally (e.g. from Coreinfo output on Windows
//! hosts): node name to a list of logical CPU ids, possibly nested one level.
//! The model here is deliberately tolerant — a malformed node is skipped with
//! a warning rather than failing the whole job, and an empty map simply
//! disables affinity upstream.

use std::path::Path;

use anyhow::Context;

/// Windows groups logical CPUs in blocks of 64; affinity masks traditionally
/// cannot cross a group boundary.
pub const PROC_GROUP_SIZE: u32 = 64;

/// An ordered pool of logical CPU ids, usually one NUMA node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuPool {
    pub node: String,
    pub cpus: Vec<u32>,
}

impl CpuPool {
    /// The processor group implied by the pool's lowest CPU id.
    pub fn group(&self) -> u32 {
        self.cpus.first().map(|c| c / PROC_GROUP_SIZE).unwrap_or(0)
    }
}

/// The processor group a logical CPU belongs to.
pub fn group_of(cpu: u32) -> u32 {
    cpu / PROC_GROUP_SIZE
}

/// Compute the processor group and group-local 64-bit mask for a CPU set.
/// Fails when the set spans more than one group, which the affinity API
/// cannot express in a single mask.
pub fn group_mask(cpus: &[u32]) -> anyhow::Result<(u32, u64)> {
    let first = *cpus.first().context("empty affinity block")?;
    let group = group_of(first);
    let mut mask = 0u64;
    for &cpu in cpus {
        if group_of(cpu) != group {
            anyhow::bail!(
                "affinity block spans processor groups {} and {}",
                group,
                group_of(cpu)
            );
        }
        mask |= 1 << (cpu % PROC_GROUP_SIZE);
    }
    Ok((group, mask))
}

/// Load and normalize the NUMA map at `path`.
pub fn load_numa_map(path: &Path) -> anyhow::Result<Vec<CpuPool>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading NUMA map {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing NUMA map {}", path.display()))?;
    pools_from_value(&value)
}

/// Normalize a parsed NUMA map into ordered CPU pools: nodes sorted by their
/// numeric name (`group_<k>` counts as `<k>`) else lexicographically, each
/// pool sorted and de-duplicated. A CPU claimed by several pools stays with
/// the later pool.
pub fn pools_from_value(value: &serde_json::Value) -> anyhow::Result<Vec<CpuPool>> {
    let map = value
        .as_object()
        .context("NUMA map must be a JSON object of node name to CPU list")?;

    let mut pools = Vec::new();
    for (name, cpus) in map {
        match flatten_cpu_list(cpus) {
            Some(mut list) => {
                list.sort_unstable();
                list.dedup();
                pools.push(CpuPool {
                    node: name.clone(),
                    cpus: list,
                });
            }
            None => {
                log::warn!("NUMA map node {name:?} contains non-integer entries; skipping node");
            }
        }
    }

    pools.sort_by(|a, b| node_sort_key(&a.node).cmp(&node_sort_key(&b.node)));

    // Pathological maps can list a CPU under several nodes; the later pool
    // keeps it.
    let mut claimed = std::collections::HashSet::new();
    for pool in pools.iter_mut().rev() {
        pool.cpus.retain(|c| claimed.insert(*c));
    }
    pools.retain(|p| !p.cpus.is_empty());

    Ok(pools)
}

/// All pool CPUs concatenated in pool order.
pub fn flatten_pools(pools: &[CpuPool]) -> Vec<u32> {
    pools.iter().flat_map(|p| p.cpus.iter().copied()).collect()
}

fn node_sort_key(name: &str) -> (u8, i64, String) {
    let trimmed = name.strip_prefix("group_").unwrap_or(name);
    match trimmed.parse::<i64>() {
        Ok(n) => (0, n, String::new()),
        Err(_) => (1, 0, name.to_string()),
    }
}

// One level of list nesting is tolerated and flattened. Returns None when any
// entry is not an unsigned integer (or a list of them).
fn flatten_cpu_list(value: &serde_json::Value) -> Option<Vec<u32>> {
    let items = value.as_array()?;
    let mut cpus = Vec::with_capacity(items.len());
    for item in items {
        match item {
            serde_json::Value::Number(n) => cpus.push(u32::try_from(n.as_u64()?).ok()?),
            serde_json::Value::Array(nested) => {
                for n in nested {
                    cpus.push(u32::try_from(n.as_u64()?).ok()?);
                }
            }
            _ => return None,
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pools(v: serde_json::Value) -> Vec<CpuPool> {
        pools_from_value(&v).unwrap()
    }

    #[test]
    fn basic_map() {
        let p = pools(json!({"0": [3, 1, 2, 2], "1": [4, 5]}));
        assert_eq!(p.len(), 2);
        assert_eq!(p[0].cpus, vec![1, 2, 3]);
        assert_eq!(p[1].cpus, vec![4, 5]);
    }

    #[test]
    fn group_prefix_orders_numerically() {
        let p = pools(json!({"group_10": [10], "group_2": [2], "group_1": [1]}));
        let names: Vec<_> = p.iter().map(|p| p.node.as_str()).collect();
        assert_eq!(names, vec!["group_1", "group_2", "group_10"]);
    }

    #[test]
    fn non_numeric_names_sort_lexicographically_after_numeric() {
        let p = pools(json!({"zeta": [9], "2": [2], "alpha": [8]}));
        let names: Vec<_> = p.iter().map(|p| p.node.as_str()).collect();
        assert_eq!(names, vec!["2", "alpha", "zeta"]);
    }

    #[test]
    fn nested_lists_flattened() {
        let p = pools(json!({"0": [[0, 1], [2], 3]}));
        assert_eq!(p[0].cpus, vec![0, 1, 2, 3]);
    }

    #[test]
    fn bad_node_skipped() {
        let p = pools(json!({"0": [0, "x"], "1": [1]}));
        assert_eq!(p.len(), 1);
        assert_eq!(p[0].node, "1");
    }

    #[test]
    fn empty_map_yields_no_pools() {
        assert!(pools(json!({})).is_empty());
    }

    #[test]
    fn duplicate_cpu_stays_with_later_pool() {
        let p = pools(json!({"0": [0, 1, 2], "1": [2, 3]}));
        assert_eq!(p[0].cpus, vec![0, 1]);
        assert_eq!(p[1].cpus, vec![2, 3]);
    }

    #[test]
    fn group_mask_within_one_group() {
        let (group, mask) = group_mask(&[65, 66, 127]).unwrap();
        assert_eq!(group, 1);
        assert_eq!(mask, (1 << 1) | (1 << 2) | (1 << 63));
    }

    #[test]
    fn group_mask_rejects_spanning_block() {
        assert!(group_mask(&[63, 64]).is_err());
        assert!(group_mask(&[]).is_err());
    }

    #[test]
    fn pool_group_from_lowest_cpu() {
        let pool = CpuPool {
            node: "0".into(),
            cpus: vec![64, 70],
        };
        assert_eq!(pool.group(), 1);
    }
}
