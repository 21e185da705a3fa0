use cfxbatch_core::config::{PlacementStrategy, RunConfig};
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::NodeRecord;
use cfxbatch_core::{log_debug, log_info, log_warn};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;

/// A job as the placement engine sees it.
#[derive(Debug, Clone, Serialize)]
pub struct PlacementJob {
    pub name: String,
    pub pressure: f64,
    pub cores: u32,
    pub memory_mb: u64,
}

/// One placed job: the node chosen for it and the resources booked there.
#[derive(Debug, Clone, Serialize)]
pub struct PlacedJob {
    pub job: PlacementJob,
    pub node: String,
    pub cores: u32,
    pub memory_mb: u64,
    pub partition: String,
    pub allocated_at: DateTime<Local>,
    pub match_score: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlacementSummary {
    pub total_jobs: usize,
    pub placed_jobs: usize,
    pub unplaced_jobs: usize,
    pub nodes_used: usize,
    pub total_cores_allocated: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacementResult {
    pub strategy: PlacementStrategy,
    pub jobs: Vec<PlacedJob>,
    pub summary: PlacementSummary,
    /// 0..=100
    pub efficiency_score: f64,
    pub estimated_minutes: u64,
    /// 0..=1
    pub node_utilization: f64,
    pub warnings: Vec<String>,
}

/// Per-node bookkeeping shared by the packing strategies.
struct NodeSlot {
    node: NodeRecord,
    remaining_cores: u32,
    remaining_memory_mb: u64,
    placed: u32,
}

impl NodeSlot {
    fn new(node: NodeRecord) -> Self {
        NodeSlot {
            remaining_cores: node.cpus,
            remaining_memory_mb: node.memory_mb,
            placed: 0,
            node,
        }
    }

    fn fits(&self, job: &PlacementJob) -> bool {
        self.remaining_cores >= job.cores && self.remaining_memory_mb >= job.memory_mb
    }

    fn book(&mut self, job: &PlacementJob, score: Option<f64>) -> PlacedJob {
        self.remaining_cores -= job.cores;
        self.remaining_memory_mb = self.remaining_memory_mb.saturating_sub(job.memory_mb);
        self.placed += 1;
        PlacedJob {
            job: job.clone(),
            node: self.node.name.clone(),
            cores: job.cores,
            memory_mb: job.memory_mb,
            partition: self.node.partition.clone(),
            allocated_at: Local::now(),
            match_score: score,
        }
    }
}

fn eligible_nodes(nodes: &[NodeRecord], config: &RunConfig) -> Vec<NodeRecord> {
    let excluded: Vec<&str> = config
        .exclude_nodes
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut eligible: Vec<NodeRecord> = nodes
        .iter()
        .filter(|n| n.available && n.cpus >= 1)
        .filter(|n| {
            // Nodes that report no partition (PBS) are never filtered on it.
            config.partition.is_empty()
                || n.partition.is_empty()
                || n.partition == config.partition
        })
        .filter(|n| !excluded.contains(&n.name.as_str()))
        .cloned()
        .collect();

    // Largest nodes first; every strategy scans in this order.
    eligible.sort_by(|a, b| b.cpus.cmp(&a.cpus).then(a.name.cmp(&b.name)));
    eligible
}

/// Run one placement strategy over the eligible nodes.
pub fn allocate(
    strategy: PlacementStrategy,
    nodes: &[NodeRecord],
    jobs: &[PlacementJob],
    config: &RunConfig,
) -> Result<PlacementResult> {
    let eligible = eligible_nodes(nodes, config);
    if eligible.is_empty() {
        return Err(AppError::Placement(
            "no available nodes meet the minimum resource requirement".to_string(),
        ));
    }

    log_info!(
        "placement: strategy {} over {} nodes, {} jobs",
        strategy,
        eligible.len(),
        jobs.len()
    );

    let effective = effective_strategy(strategy, eligible.len(), jobs.len());
    let mut slots: Vec<NodeSlot> = eligible.into_iter().map(NodeSlot::new).collect();

    let placed = match effective {
        PlacementStrategy::BatchAllocation => batch_allocation(&mut slots, jobs),
        PlacementStrategy::NodeReuse => node_reuse(&mut slots, jobs),
        PlacementStrategy::SmartQueue => smart_queue(&mut slots, jobs, config),
        PlacementStrategy::Hybrid => unreachable!("hybrid resolves to a concrete strategy"),
    };

    Ok(build_result(strategy, &slots, jobs, placed, config))
}

/// Hybrid picks a concrete strategy from the job density.
fn effective_strategy(
    strategy: PlacementStrategy,
    node_count: usize,
    job_count: usize,
) -> PlacementStrategy {
    if strategy != PlacementStrategy::Hybrid {
        return strategy;
    }
    let density = job_count as f64 / node_count.max(1) as f64;
    let chosen = if density <= 1.0 {
        PlacementStrategy::BatchAllocation
    } else if density <= 3.0 {
        PlacementStrategy::SmartQueue
    } else {
        PlacementStrategy::NodeReuse
    };
    log_debug!("hybrid density {:.2} -> {}", density, chosen);
    chosen
}

/// Round-robin: the i-th job lands on nodes[i mod N] when that node still
/// has the cores; otherwise the job is skipped with a warning.
fn batch_allocation(slots: &mut [NodeSlot], jobs: &[PlacementJob]) -> Vec<PlacedJob> {
    let mut placed = Vec::new();
    for (i, job) in jobs.iter().enumerate() {
        let slot = &mut slots[i % slots.len()];
        if slot.remaining_cores >= job.cores {
            placed.push(slot.book(job, None));
        } else {
            log_warn!(
                "node {} lacks cores for job {} ({} needed, {} free)",
                slot.node.name,
                job.name,
                job.cores,
                slot.remaining_cores
            );
        }
    }
    placed
}

/// First-fit in input order: fill a node before moving to the next.
fn node_reuse(slots: &mut [NodeSlot], jobs: &[PlacementJob]) -> Vec<PlacedJob> {
    let mut placed = Vec::new();
    for job in jobs {
        match slots.iter_mut().find(|s| s.fits(job)) {
            Some(slot) => placed.push(slot.book(job, None)),
            None => log_warn!("job {} does not fit on any node", job.name),
        }
    }
    placed
}

/// Load-aware best-fit: big jobs first, each to the node maximizing
/// `(cpu_ratio + memory_ratio) * load_factor`.
fn smart_queue(
    slots: &mut [NodeSlot],
    jobs: &[PlacementJob],
    config: &RunConfig,
) -> Vec<PlacedJob> {
    let mut ordered: Vec<&PlacementJob> = jobs.iter().collect();
    ordered.sort_by(|a, b| b.cores.cmp(&a.cores));

    let max_concurrent = config.max_concurrent_jobs.max(1) as f64;
    let mut placed = Vec::new();

    for job in ordered {
        let mut best: Option<(usize, f64)> = None;
        for (idx, slot) in slots.iter().enumerate() {
            if !slot.fits(job) {
                continue;
            }
            let cpu_ratio = job.cores as f64 / slot.node.cpus.max(1) as f64;
            let memory_ratio = job.memory_mb as f64 / slot.node.memory_mb.max(1) as f64;
            let load_factor = 1.0 - slot.placed as f64 / max_concurrent;
            let score = (cpu_ratio + memory_ratio) * load_factor;
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((idx, score));
            }
        }
        match best {
            Some((idx, score)) => placed.push(slots[idx].book(job, Some(score))),
            None => log_warn!("job {} does not fit on any node", job.name),
        }
    }
    placed
}

fn build_result(
    strategy: PlacementStrategy,
    slots: &[NodeSlot],
    jobs: &[PlacementJob],
    placed: Vec<PlacedJob>,
    config: &RunConfig,
) -> PlacementResult {
    let total_cores: u64 = slots.iter().map(|s| s.node.cpus as u64).sum();
    let allocated_cores: u64 = placed.iter().map(|p| p.cores as u64).sum();

    let node_utilization = if total_cores == 0 {
        0.0
    } else {
        allocated_cores as f64 / total_cores as f64
    };

    // Load balance from the variance of per-node allocated cores.
    let mut per_node_cores: BTreeMap<&str, u64> = BTreeMap::new();
    let mut per_node_jobs: BTreeMap<&str, u64> = BTreeMap::new();
    for p in &placed {
        *per_node_cores.entry(p.node.as_str()).or_default() += p.cores as u64;
        *per_node_jobs.entry(p.node.as_str()).or_default() += 1;
    }

    let load_balance = if per_node_cores.is_empty() {
        1.0
    } else {
        let loads: Vec<f64> = per_node_cores.values().map(|&c| c as f64).collect();
        let mean = loads.iter().sum::<f64>() / loads.len() as f64;
        let variance =
            loads.iter().map(|l| (l - mean) * (l - mean)).sum::<f64>() / loads.len() as f64;
        1.0 / (1.0 + variance / 100.0)
    };

    let efficiency_score =
        ((node_utilization * 0.7 + load_balance * 0.3) * 100.0).min(100.0);

    // Sixty minutes per job, jobs on one node serialized in groups of
    // max_concurrent_jobs; the batch finishes with its slowest node.
    const AVG_JOB_MINUTES: u64 = 60;
    let max_concurrent = config.max_concurrent_jobs.max(1) as u64;
    let estimated_minutes = per_node_jobs
        .values()
        .map(|&count| AVG_JOB_MINUTES * count.div_ceil(max_concurrent))
        .max()
        .unwrap_or(0);

    let unplaced = jobs.len() - placed.len();
    let mut warnings = Vec::new();
    if node_utilization < 0.3 {
        warnings.push(format!(
            "low node utilization ({:.0}%); consider fewer nodes",
            node_utilization * 100.0
        ));
    } else if node_utilization > 0.9 {
        warnings.push(format!(
            "very high node utilization ({:.0}%); resource contention is likely",
            node_utilization * 100.0
        ));
    }
    if let (Some(max), Some(min)) = (
        per_node_jobs.values().max().copied(),
        per_node_jobs.values().min().copied(),
    ) {
        if max > min * 2 {
            warnings.push(format!(
                "node load is imbalanced ({} jobs on the busiest node, {} on the idlest)",
                max, min
            ));
        }
    }
    if unplaced > 0 {
        warnings.push(format!("{} jobs could not be placed on any node", unplaced));
    }

    let summary = PlacementSummary {
        total_jobs: jobs.len(),
        placed_jobs: placed.len(),
        unplaced_jobs: unplaced,
        nodes_used: per_node_cores.len(),
        total_cores_allocated: allocated_cores,
    };

    PlacementResult {
        strategy,
        jobs: placed,
        summary,
        efficiency_score,
        estimated_minutes,
        node_utilization,
        warnings,
    }
}

/// Run every strategy for comparison; a strategy that errors reports an
/// empty result carrying the error as its only warning.
pub fn compare_strategies(
    nodes: &[NodeRecord],
    jobs: &[PlacementJob],
    config: &RunConfig,
) -> Vec<PlacementResult> {
    [
        PlacementStrategy::BatchAllocation,
        PlacementStrategy::NodeReuse,
        PlacementStrategy::SmartQueue,
        PlacementStrategy::Hybrid,
    ]
    .into_iter()
    .map(|strategy| match allocate(strategy, nodes, jobs, config) {
        Ok(result) => result,
        Err(e) => PlacementResult {
            strategy,
            jobs: Vec::new(),
            summary: PlacementSummary {
                total_jobs: jobs.len(),
                unplaced_jobs: jobs.len(),
                ..PlacementSummary::default()
            },
            efficiency_score: 0.0,
            estimated_minutes: 0,
            node_utilization: 0.0,
            warnings: vec![format!("allocation failed: {}", e)],
        },
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfxbatch_core::model::NodeState;

    fn node(name: &str, cpus: u32, memory_mb: u64) -> NodeRecord {
        NodeRecord {
            name: name.to_string(),
            cpus,
            memory_mb,
            raw_state: "idle".to_string(),
            state: NodeState::Idle,
            available: true,
            partition: String::new(),
            features: String::new(),
            query_time: Local::now(),
        }
    }

    fn job(name: &str, cores: u32) -> PlacementJob {
        PlacementJob {
            name: name.to_string(),
            pressure: 2000.0,
            cores,
            memory_mb: 0,
        }
    }

    fn config() -> RunConfig {
        let mut config = RunConfig::default();
        config.partition.clear();
        config
    }

    #[test]
    fn test_batch_allocation_round_robin() {
        let nodes = vec![node("n01", 32, 64000), node("n02", 32, 64000)];
        let jobs = vec![job("a", 32), job("b", 32)];
        let result = allocate(PlacementStrategy::BatchAllocation, &nodes, &jobs, &config()).unwrap();
        assert_eq!(result.jobs.len(), 2);
        let targets: Vec<&str> = result.jobs.iter().map(|p| p.node.as_str()).collect();
        assert_eq!(targets, vec!["n01", "n02"]);
        assert_eq!(result.node_utilization, 1.0);
    }

    #[test]
    fn test_node_reuse_fills_densely() {
        let nodes = vec![node("n01", 32, 64000), node("n02", 32, 64000)];
        let jobs = vec![job("a", 16), job("b", 16), job("c", 16)];
        let result = allocate(PlacementStrategy::NodeReuse, &nodes, &jobs, &config()).unwrap();
        let targets: Vec<&str> = result.jobs.iter().map(|p| p.node.as_str()).collect();
        assert_eq!(targets, vec!["n01", "n01", "n02"]);
    }

    #[test]
    fn test_smart_queue_places_large_jobs_first() {
        let nodes = vec![node("big", 64, 128000), node("small", 16, 32000)];
        let jobs = vec![job("tiny", 8), job("huge", 64)];
        let result = allocate(PlacementStrategy::SmartQueue, &nodes, &jobs, &config()).unwrap();
        let by_name: BTreeMap<&str, &str> = result
            .jobs
            .iter()
            .map(|p| (p.job.name.as_str(), p.node.as_str()))
            .collect();
        assert_eq!(by_name["huge"], "big");
        assert_eq!(by_name["tiny"], "small");
    }

    #[test]
    fn test_hybrid_density_dispatch() {
        assert_eq!(
            effective_strategy(PlacementStrategy::Hybrid, 2, 2),
            PlacementStrategy::BatchAllocation
        );
        assert_eq!(
            effective_strategy(PlacementStrategy::Hybrid, 2, 5),
            PlacementStrategy::SmartQueue
        );
        assert_eq!(
            effective_strategy(PlacementStrategy::Hybrid, 2, 8),
            PlacementStrategy::NodeReuse
        );
    }

    #[test]
    fn test_no_available_nodes_is_an_error() {
        let mut unavailable = node("n01", 32, 64000);
        unavailable.available = false;
        let jobs = vec![job("a", 4)];
        let result = allocate(
            PlacementStrategy::NodeReuse,
            &[unavailable],
            &jobs,
            &config(),
        );
        assert!(matches!(result, Err(AppError::Placement(_))));
    }

    #[test]
    fn test_oversized_job_is_unplaced_with_warning() {
        let nodes = vec![node("n01", 16, 64000)];
        let jobs = vec![job("fits", 8), job("oversized", 64)];
        let result = allocate(PlacementStrategy::NodeReuse, &nodes, &jobs, &config()).unwrap();
        assert_eq!(result.jobs.len(), 1);
        assert_eq!(result.summary.unplaced_jobs, 1);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("could not be placed")));
    }

    #[test]
    fn test_allocation_never_overcommits_a_node() {
        let nodes = vec![node("n01", 32, 64000), node("n02", 16, 32000)];
        let jobs: Vec<PlacementJob> = (0..8).map(|i| job(&format!("j{}", i), 16)).collect();
        for strategy in [
            PlacementStrategy::BatchAllocation,
            PlacementStrategy::NodeReuse,
            PlacementStrategy::SmartQueue,
            PlacementStrategy::Hybrid,
        ] {
            let result = allocate(strategy, &nodes, &jobs, &config()).unwrap();
            let mut per_node: BTreeMap<&str, u64> = BTreeMap::new();
            for p in &result.jobs {
                *per_node.entry(p.node.as_str()).or_default() += p.cores as u64;
            }
            for node in &nodes {
                let booked = per_node.get(node.name.as_str()).copied().unwrap_or(0);
                assert!(
                    booked <= node.cpus as u64,
                    "{} overcommitted under {:?}",
                    node.name,
                    strategy
                );
            }
        }
    }

    #[test]
    fn test_efficiency_score_full_utilization() {
        let nodes = vec![node("n01", 32, 64000)];
        let jobs = vec![job("a", 32)];
        let result = allocate(PlacementStrategy::NodeReuse, &nodes, &jobs, &config()).unwrap();
        // cpu utilization 1.0, single node so variance 0 -> balance 1.0.
        assert!((result.efficiency_score - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_excluded_nodes_are_skipped() {
        let nodes = vec![node("n01", 32, 64000), node("n02", 32, 64000)];
        let jobs = vec![job("a", 32)];
        let mut config = config();
        config.exclude_nodes = "n01".to_string();
        let result =
            allocate(PlacementStrategy::BatchAllocation, &nodes, &jobs, &config).unwrap();
        assert_eq!(result.jobs[0].node, "n02");
    }

    #[test]
    fn test_compare_strategies_covers_all_four() {
        let nodes = vec![node("n01", 32, 64000)];
        let jobs = vec![job("a", 16)];
        let results = compare_strategies(&nodes, &jobs, &config());
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| !r.jobs.is_empty()));
    }
}
