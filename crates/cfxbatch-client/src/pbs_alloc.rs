use cfxbatch_core::config::{PbsAllocationMode, RunConfig};
use cfxbatch_core::log_warn;
use serde::Serialize;
use std::collections::BTreeMap;

/// One PBS node as the allocator sees it: name plus processors per node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbsNodeSpec {
    pub node_name: String,
    pub ppn: u32,
    pub available: bool,
}

impl PbsNodeSpec {
    pub fn new(node_name: impl Into<String>, ppn: u32) -> Self {
        PbsNodeSpec {
            node_name: node_name.into(),
            ppn,
            available: true,
        }
    }
}

/// Result of packing one job onto PBS nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PbsAllocation {
    /// `-l nodes=` literal, e.g. `n41:ppn=28+n61:ppn=16`.
    pub nodes_spec: String,
    pub total_cpus: u32,
    pub node_count: usize,
    pub allocated_nodes: Vec<String>,
    /// Cores the job actually uses on each node.
    pub load_distribution: BTreeMap<String, u32>,
    pub warnings: Vec<String>,
}

impl PbsAllocation {
    pub fn is_empty(&self) -> bool {
        self.node_count == 0
    }
}

/// `node41` -> `n41`; names already in short form pass through.
pub fn short_node_name(name: &str) -> String {
    match name.strip_prefix("node") {
        Some(rest) if !rest.is_empty() => format!("n{}", rest),
        _ => name.to_string(),
    }
}

/// Parse a nodes-spec literal (`node3:ppn=28+node4:ppn=28`). Entries
/// without an explicit ppn get `default_ppn`; entries with garbage ppn are
/// dropped with a warning.
pub fn parse_nodes_spec(spec: &str, default_ppn: u32) -> Vec<PbsNodeSpec> {
    let mut parsed = Vec::new();
    for part in spec.split('+') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(":ppn=") {
            Some((name, ppn)) => match ppn.trim().parse::<u32>() {
                Ok(ppn) => parsed.push(PbsNodeSpec::new(name.trim(), ppn)),
                Err(_) => log_warn!("unparseable ppn in nodes_spec entry '{}'", part),
            },
            None => parsed.push(PbsNodeSpec::new(part, default_ppn)),
        }
    }
    parsed
}

/// Emit the `+`-joined spec string with short node names.
pub fn build_nodes_spec(specs: &[&PbsNodeSpec]) -> String {
    specs
        .iter()
        .filter(|s| s.available)
        .map(|s| format!("{}:ppn={}", short_node_name(&s.node_name), s.ppn))
        .collect::<Vec<_>>()
        .join("+")
}

/// Pack one job onto PBS nodes following the configured mode.
pub fn allocate_for_job(
    required_cpus: u32,
    available: &[PbsNodeSpec],
    config: &RunConfig,
) -> PbsAllocation {
    match config.pbs_allocation_mode {
        PbsAllocationMode::SingleNode => single_node(available, config.min_cores),
        PbsAllocationMode::MultiNode => multi_node(required_cpus, available),
        PbsAllocationMode::Hybrid => hybrid(required_cpus, available, config.min_cores),
        PbsAllocationMode::Auto => auto(required_cpus, available, config),
    }
}

/// Smallest single node satisfying `min_cores`; ties break to the
/// lexicographically smaller node name.
fn single_node(available: &[PbsNodeSpec], min_cores: u32) -> PbsAllocation {
    let best = available
        .iter()
        .filter(|n| n.available && n.ppn >= min_cores)
        .min_by(|a, b| a.ppn.cmp(&b.ppn).then(a.node_name.cmp(&b.node_name)));

    match best {
        Some(node) => {
            // The whole node is granted, not just min_cores.
            let mut load = BTreeMap::new();
            load.insert(node.node_name.clone(), node.ppn);
            PbsAllocation {
                nodes_spec: format!("{}:ppn={}", short_node_name(&node.node_name), node.ppn),
                total_cpus: node.ppn,
                node_count: 1,
                allocated_nodes: vec![node.node_name.clone()],
                load_distribution: load,
                warnings: vec![format!(
                    "single-node allocation: {} ({} cores, minimum {})",
                    node.node_name, node.ppn, min_cores
                )],
            }
        }
        None => PbsAllocation {
            warnings: vec![format!(
                "no single node satisfies the minimum core requirement ({})",
                min_cores
            )],
            ..PbsAllocation::default()
        },
    }
}

/// Multi-node fill, large nodes first. 32- and 44-core requests get the
/// 28+16 pairing when both sizes are free (44 is a perfect fit; 32 leaves
/// the 16-core node at 4 used).
fn multi_node(required_cpus: u32, available: &[PbsNodeSpec]) -> PbsAllocation {
    let mut sorted: Vec<&PbsNodeSpec> = available.iter().filter(|n| n.available).collect();
    sorted.sort_by(|a, b| b.ppn.cmp(&a.ppn).then(a.node_name.cmp(&b.node_name)));

    let pair = match required_cpus {
        32 | 44 => {
            let node_28 = sorted.iter().find(|n| n.ppn == 28);
            let node_16 = sorted.iter().find(|n| n.ppn == 16);
            node_28.zip(node_16)
        }
        _ => None,
    };

    if let Some((node_28, node_16)) = pair {
        let specs = [*node_28, *node_16];
        let mut load = BTreeMap::new();
        load.insert(node_28.node_name.clone(), 28);
        let (cores_on_16, note) = if required_cpus == 32 {
            (4, "28+16 pairing covers the 32-core request".to_string())
        } else {
            (16, "perfect fit: 28+16 pairing at 100% utilization".to_string())
        };
        load.insert(node_16.node_name.clone(), cores_on_16);
        return PbsAllocation {
            nodes_spec: build_nodes_spec(&specs),
            total_cpus: 44,
            node_count: 2,
            allocated_nodes: vec![node_28.node_name.clone(), node_16.node_name.clone()],
            load_distribution: load,
            warnings: vec![note],
        };
    }

    let mut allocation = PbsAllocation::default();
    let mut chosen: Vec<&PbsNodeSpec> = Vec::new();
    let mut remaining = required_cpus;
    for node in sorted {
        if remaining == 0 {
            break;
        }
        let used = remaining.min(node.ppn);
        chosen.push(node);
        allocation.allocated_nodes.push(node.node_name.clone());
        allocation
            .load_distribution
            .insert(node.node_name.clone(), used);
        // PBS grants whole nodes.
        allocation.total_cpus += node.ppn;
        remaining -= used;
    }
    if remaining > 0 {
        allocation
            .warnings
            .push(format!("{} cores remain unallocated", remaining));
    }
    allocation.nodes_spec = build_nodes_spec(&chosen);
    allocation.node_count = chosen.len();
    allocation
}

/// Single node when possible, multi-node otherwise.
fn hybrid(required_cpus: u32, available: &[PbsNodeSpec], min_cores: u32) -> PbsAllocation {
    let mut single = single_node(available, min_cores);
    if !single.is_empty() {
        single.warnings.push("hybrid: single-node path".to_string());
        return single;
    }
    let mut multi = multi_node(required_cpus, available);
    multi.warnings.push("hybrid: multi-node path".to_string());
    multi
}

/// A configured nodes_spec literal is used verbatim; without one, fall
/// back to the hybrid policy.
fn auto(required_cpus: u32, available: &[PbsNodeSpec], config: &RunConfig) -> PbsAllocation {
    if config.nodes_spec.is_empty() {
        return hybrid(required_cpus, available, config.min_cores);
    }

    let specs = parse_nodes_spec(&config.nodes_spec, config.ppn);
    if specs.is_empty() {
        return hybrid(required_cpus, available, config.min_cores);
    }

    // Spread the requested cores evenly, remainder to the earlier nodes.
    let per_node = required_cpus / specs.len() as u32;
    let remainder = required_cpus as usize % specs.len();
    let mut load = BTreeMap::new();
    for (i, spec) in specs.iter().enumerate() {
        let extra = if i < remainder { 1 } else { 0 };
        load.insert(spec.node_name.clone(), (per_node + extra).min(spec.ppn));
    }

    PbsAllocation {
        nodes_spec: config.nodes_spec.clone(),
        total_cpus: specs.iter().map(|s| s.ppn).sum(),
        node_count: specs.len(),
        allocated_nodes: specs.iter().map(|s| s.node_name.clone()).collect(),
        load_distribution: load,
        warnings: vec!["using the configured nodes_spec".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_mode(mode: PbsAllocationMode) -> RunConfig {
        let mut config = RunConfig::default();
        config.pbs_allocation_mode = mode;
        config
    }

    #[test]
    fn test_short_node_name_mapping() {
        assert_eq!(short_node_name("node41"), "n41");
        assert_eq!(short_node_name("n41"), "n41");
        assert_eq!(short_node_name("compute01"), "compute01");
    }

    #[test]
    fn test_parse_and_build_round_trip() {
        let specs = parse_nodes_spec("node3:ppn=28+node4:ppn=28", 16);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].ppn, 28);
        let refs: Vec<&PbsNodeSpec> = specs.iter().collect();
        assert_eq!(build_nodes_spec(&refs), "n3:ppn=28+n4:ppn=28");
    }

    #[test]
    fn test_parse_uses_default_ppn_without_suffix() {
        let specs = parse_nodes_spec("node5", 16);
        assert_eq!(specs[0].ppn, 16);
    }

    #[test]
    fn test_special_fit_44_cores() {
        let available = vec![PbsNodeSpec::new("node41", 28), PbsNodeSpec::new("node61", 16)];
        let mut config = config_with_mode(PbsAllocationMode::MultiNode);
        config.min_cores = 44;
        let allocation = allocate_for_job(44, &available, &config);
        assert_eq!(allocation.nodes_spec, "n41:ppn=28+n61:ppn=16");
        assert_eq!(allocation.total_cpus, 44);
        assert_eq!(allocation.load_distribution["node41"], 28);
        assert_eq!(allocation.load_distribution["node61"], 16);
    }

    #[test]
    fn test_special_fit_32_cores_uses_partial_16() {
        let available = vec![PbsNodeSpec::new("node41", 28), PbsNodeSpec::new("node61", 16)];
        let config = config_with_mode(PbsAllocationMode::MultiNode);
        let allocation = allocate_for_job(32, &available, &config);
        assert_eq!(allocation.nodes_spec, "n41:ppn=28+n61:ppn=16");
        assert_eq!(allocation.load_distribution["node61"], 4);
    }

    #[test]
    fn test_single_node_prefers_smallest_fitting() {
        let available = vec![
            PbsNodeSpec::new("node41", 28),
            PbsNodeSpec::new("node61", 16),
        ];
        let mut config = config_with_mode(PbsAllocationMode::SingleNode);
        config.min_cores = 16;
        let allocation = allocate_for_job(16, &available, &config);
        assert_eq!(allocation.nodes_spec, "n61:ppn=16");
        assert_eq!(allocation.total_cpus, 16);
    }

    #[test]
    fn test_single_node_tie_breaks_by_name() {
        let available = vec![
            PbsNodeSpec::new("node43", 28),
            PbsNodeSpec::new("node42", 28),
        ];
        let mut config = config_with_mode(PbsAllocationMode::SingleNode);
        config.min_cores = 28;
        let allocation = allocate_for_job(28, &available, &config);
        assert_eq!(allocation.allocated_nodes, vec!["node42".to_string()]);
    }

    #[test]
    fn test_multi_node_greedy_fill() {
        let available = vec![
            PbsNodeSpec::new("node41", 28),
            PbsNodeSpec::new("node42", 28),
            PbsNodeSpec::new("node61", 16),
        ];
        let config = config_with_mode(PbsAllocationMode::MultiNode);
        let allocation = allocate_for_job(50, &available, &config);
        assert_eq!(allocation.nodes_spec, "n41:ppn=28+n42:ppn=28");
        assert_eq!(allocation.load_distribution["node42"], 22);
        assert!(allocation.warnings.is_empty());
    }

    #[test]
    fn test_hybrid_falls_back_to_multi() {
        let available = vec![
            PbsNodeSpec::new("node41", 28),
            PbsNodeSpec::new("node42", 28),
        ];
        let mut config = config_with_mode(PbsAllocationMode::Hybrid);
        config.min_cores = 40;
        let allocation = allocate_for_job(40, &available, &config);
        assert_eq!(allocation.node_count, 2);
        assert!(allocation
            .warnings
            .iter()
            .any(|w| w.contains("multi-node path")));
    }

    #[test]
    fn test_auto_uses_configured_literal() {
        let available = vec![PbsNodeSpec::new("node41", 28)];
        let mut config = config_with_mode(PbsAllocationMode::Auto);
        config.nodes_spec = "n1:ppn=28+n2:ppn=28".to_string();
        let allocation = allocate_for_job(28, &available, &config);
        assert_eq!(allocation.nodes_spec, "n1:ppn=28+n2:ppn=28");
        assert_eq!(allocation.total_cpus, 56);
        assert_eq!(allocation.load_distribution["n1"], 14);
        assert_eq!(allocation.load_distribution["n2"], 14);
    }
}
