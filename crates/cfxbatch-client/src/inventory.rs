use crate::transport::Transport;
use cfxbatch_core::config::SchedulerKind;
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::{NodeRecord, NodeState};
use cfxbatch_core::{log_debug, log_info, log_warn};
use chrono::Local;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;

const SINFO_NODES: &str = "sinfo -N -h -o '%N %c %m %t %P %f'";
const PBSNODES_ALL: &str = "pbsnodes -a";

/// Probe the cluster for its batch system: SLURM first, then PBS.
pub fn detect_scheduler(transport: &mut Transport) -> Result<SchedulerKind> {
    if transport.exec("which sinfo")?.success() {
        log_info!("detected SLURM scheduler");
        return Ok(SchedulerKind::Slurm);
    }
    if transport.exec("which pbsnodes")?.success() {
        log_info!("detected PBS scheduler");
        return Ok(SchedulerKind::Pbs);
    }
    Err(AppError::Transport(
        "no supported scheduler detected (neither sinfo nor pbsnodes found)".to_string(),
    ))
}

/// Query and normalize the node inventory for the given dialect.
pub fn query_nodes(transport: &mut Transport, kind: SchedulerKind) -> Result<Vec<NodeRecord>> {
    let command = match kind {
        SchedulerKind::Slurm => SINFO_NODES,
        SchedulerKind::Pbs => PBSNODES_ALL,
    };
    let output = transport.exec(command)?;
    if !output.success() {
        return Err(AppError::Transport(format!(
            "{} node query failed: {}",
            kind,
            output.stderr.trim()
        )));
    }

    let nodes = match kind {
        SchedulerKind::Slurm => parse_sinfo_output(&output.stdout),
        SchedulerKind::Pbs => parse_pbsnodes_output(&output.stdout),
    };
    log_info!("cluster inventory: {} nodes ({})", nodes.len(), kind);
    Ok(nodes)
}

static MEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?B?)").unwrap());
static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Memory token to MB. Accepts `<num>[KMGT][B]`; a bare number is already
/// MB. Returns None for tokens with no leading number.
pub fn parse_memory_mb(raw: &str) -> Option<u64> {
    let upper = raw.trim().to_uppercase();
    let caps = MEMORY_RE.captures(&upper)?;
    let value: f64 = caps[1].parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let mb = match unit.chars().next() {
        Some('K') => value / 1024.0,
        Some('G') => value * 1024.0,
        Some('T') => value * 1024.0 * 1024.0,
        // 'M', bare 'B', or no unit at all.
        _ => value,
    };
    Some(mb as u64)
}

/// Leading integer of a CPU token (`28`, `28+`, ...).
pub fn parse_cpu_count(raw: &str) -> Option<u32> {
    INT_RE.find(raw).and_then(|m| m.as_str().parse().ok())
}

fn normalize_slurm_state(raw: &str) -> (NodeState, bool) {
    match raw.to_lowercase().as_str() {
        "idle" => (NodeState::Idle, true),
        "mix" => (NodeState::Mixed, true),
        "alloc" => (NodeState::Allocated, false),
        "comp" => (NodeState::Completing, false),
        "drain" => (NodeState::Draining, false),
        "down" => (NodeState::Down, false),
        "resv" => (NodeState::Reserved, false),
        _ => (NodeState::Unknown, false),
    }
}

fn normalize_pbs_state(raw: &str) -> (NodeState, bool) {
    match raw.to_lowercase().as_str() {
        "free" => (NodeState::Idle, true),
        "job-exclusive" => (NodeState::Allocated, false),
        "job-sharing" => (NodeState::Mixed, false),
        "busy" => (NodeState::Busy, false),
        "down" => (NodeState::Down, false),
        "offline" => (NodeState::Offline, false),
        "state-unknown" => (NodeState::Unknown, false),
        _ => (NodeState::Unknown, false),
    }
}

/// One line per node: `%N %c %m %t %P %f`.
pub fn parse_sinfo_output(output: &str) -> Vec<NodeRecord> {
    let now = Local::now();
    let mut nodes = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            log_warn!("dropping malformed sinfo row: '{}'", line);
            continue;
        }

        let cpus = match parse_cpu_count(parts[1]) {
            Some(c) => c,
            None => {
                log_warn!("dropping node {}: unparseable CPU count '{}'", parts[0], parts[1]);
                continue;
            }
        };
        let memory_mb = match parse_memory_mb(parts[2]) {
            Some(m) => m,
            None => {
                log_warn!("dropping node {}: unparseable memory '{}'", parts[0], parts[2]);
                continue;
            }
        };

        let (state, available) = normalize_slurm_state(parts[3]);
        nodes.push(NodeRecord {
            name: parts[0].to_string(),
            cpus,
            memory_mb,
            raw_state: parts[3].to_string(),
            state,
            available,
            partition: parts[4].trim_end_matches('*').to_string(),
            features: parts.get(5).copied().unwrap_or("").to_string(),
            query_time: now,
        });
    }

    nodes
}

#[derive(Default)]
struct PbsNodeBuilder {
    name: String,
    cpus: Option<u32>,
    status_ncpus: Option<u32>,
    memory_mb: Option<u64>,
    raw_state: Option<String>,
    properties: String,
    malformed: Option<String>,
}

impl PbsNodeBuilder {
    fn finish(self, nodes: &mut Vec<NodeRecord>) {
        if let Some(reason) = self.malformed {
            log_warn!("dropping node {}: {}", self.name, reason);
            return;
        }
        // np takes precedence over status ncpus.
        let cpus = match self.cpus.or(self.status_ncpus) {
            Some(c) => c,
            None => {
                log_warn!("dropping node {}: no CPU count", self.name);
                return;
            }
        };
        let raw_state = self.raw_state.unwrap_or_else(|| "state-unknown".to_string());
        let (state, available) = normalize_pbs_state(&raw_state);
        nodes.push(NodeRecord {
            name: self.name,
            cpus,
            memory_mb: self.memory_mb.unwrap_or(0),
            raw_state,
            state,
            available,
            partition: String::new(),
            features: self.properties,
            query_time: Local::now(),
        });
    }
}

/// `pbsnodes -a`: one block per node, a bare node-name line followed by
/// indented `key = value` attributes, blocks separated by blank lines.
pub fn parse_pbsnodes_output(output: &str) -> Vec<NodeRecord> {
    let mut nodes = Vec::new();
    let mut current: Option<PbsNodeBuilder> = None;

    for raw_line in output.lines() {
        let line = raw_line.trim();

        if line.is_empty() {
            if let Some(builder) = current.take() {
                builder.finish(&mut nodes);
            }
            continue;
        }

        let indented = raw_line.starts_with(' ') || raw_line.starts_with('\t');
        if !indented && !line.contains('=') {
            if let Some(builder) = current.take() {
                builder.finish(&mut nodes);
            }
            log_debug!("pbsnodes block: {}", line);
            current = Some(PbsNodeBuilder {
                name: line.to_string(),
                ..PbsNodeBuilder::default()
            });
            continue;
        }

        let Some(builder) = current.as_mut() else {
            continue;
        };
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let (key, value) = (key.trim(), value.trim());

        match key {
            "state" => builder.raw_state = Some(value.to_string()),
            "np" => match parse_cpu_count(value) {
                Some(c) => builder.cpus = Some(c),
                None => builder.malformed = Some(format!("unparseable np '{}'", value)),
            },
            "properties" => builder.properties = value.to_string(),
            "status" => parse_pbs_status_field(builder, value),
            _ => {}
        }
    }

    if let Some(builder) = current.take() {
        builder.finish(&mut nodes);
    }

    nodes
}

/// The `status=` attribute packs `key=value` pairs separated by commas;
/// memory totals live here. A status field whose memory or CPU entries do
/// not parse marks the whole node malformed.
fn parse_pbs_status_field(builder: &mut PbsNodeBuilder, status: &str) {
    for pair in status.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key.trim() {
            "totmem" => match parse_memory_mb(value.trim()) {
                Some(mb) => builder.memory_mb = Some(mb),
                None => {
                    builder.malformed =
                        Some(format!("unparseable totmem '{}' in status", value.trim()));
                    return;
                }
            },
            "ncpus" => match parse_cpu_count(value.trim()) {
                Some(c) => builder.status_ncpus = Some(c),
                None => {
                    builder.malformed =
                        Some(format!("unparseable ncpus '{}' in status", value.trim()));
                    return;
                }
            },
            _ => {}
        }
    }
}

/// Keep available nodes meeting the resource floor, optionally restricted
/// to one partition.
pub fn filter_available(
    nodes: &[NodeRecord],
    min_cores: u32,
    min_memory_mb: u64,
    partition: Option<&str>,
) -> Vec<NodeRecord> {
    let filtered: Vec<NodeRecord> = nodes
        .iter()
        .filter(|n| n.available)
        .filter(|n| n.cpus >= min_cores)
        .filter(|n| n.memory_mb >= min_memory_mb)
        .filter(|n| partition.is_none_or(|p| n.partition == p))
        .cloned()
        .collect();
    log_debug!("{} of {} nodes pass the availability filter", filtered.len(), nodes.len());
    filtered
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PartitionSummary {
    pub nodes: usize,
    pub cores: u64,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeSummary {
    pub total_nodes: usize,
    pub available_nodes: usize,
    pub total_cores: u64,
    pub available_cores: u64,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub states: BTreeMap<String, usize>,
    pub partitions: BTreeMap<String, PartitionSummary>,
}

pub fn summarize(nodes: &[NodeRecord]) -> NodeSummary {
    let mut summary = NodeSummary {
        total_nodes: nodes.len(),
        ..NodeSummary::default()
    };

    for node in nodes {
        summary.total_cores += node.cpus as u64;
        summary.total_memory_mb += node.memory_mb;
        if node.available {
            summary.available_nodes += 1;
            summary.available_cores += node.cpus as u64;
            summary.available_memory_mb += node.memory_mb;
        }

        *summary.states.entry(node.state.to_string()).or_default() += 1;

        if !node.partition.is_empty() {
            let entry = summary
                .partitions
                .entry(node.partition.clone())
                .or_default();
            entry.nodes += 1;
            entry.cores += node.cpus as u64;
            entry.memory_mb += node.memory_mb;
        }
    }

    summary
}

/// One queued or running job as reported by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct QueueJob {
    pub id: String,
    pub name: String,
    pub user: String,
    pub state: String,
    pub reason: String,
}

/// Best-effort queue listing for `cluster-status`.
pub fn query_queue(transport: &mut Transport, kind: SchedulerKind) -> Result<Vec<QueueJob>> {
    match kind {
        SchedulerKind::Slurm => {
            let output = transport.exec("squeue -h -o '%i %j %u %t %r'")?;
            if !output.success() {
                return Err(AppError::Transport(format!(
                    "squeue failed: {}",
                    output.stderr.trim()
                )));
            }
            Ok(parse_squeue_output(&output.stdout))
        }
        SchedulerKind::Pbs => {
            let output = transport.exec("qstat -f")?;
            if !output.success() {
                return Err(AppError::Transport(format!(
                    "qstat failed: {}",
                    output.stderr.trim()
                )));
            }
            Ok(parse_qstat_queue_output(&output.stdout))
        }
    }
}

fn parse_squeue_output(output: &str) -> Vec<QueueJob> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            Some(QueueJob {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                user: parts[2].to_string(),
                state: parts[3].to_string(),
                reason: parts[4..].join(" "),
            })
        })
        .collect()
}

fn parse_qstat_queue_output(output: &str) -> Vec<QueueJob> {
    let mut jobs = Vec::new();
    for block in output.split("Job Id:").skip(1) {
        let mut job = QueueJob {
            id: block.lines().next().unwrap_or("").trim().to_string(),
            name: String::new(),
            user: String::new(),
            state: String::new(),
            reason: String::new(),
        };
        for line in block.lines().skip(1) {
            if let Some((key, value)) = line.trim().split_once('=') {
                match key.trim() {
                    "Job_Name" => job.name = value.trim().to_string(),
                    "Job_Owner" => job.user = value.trim().to_string(),
                    "job_state" => job.state = value.trim().to_string(),
                    _ => {}
                }
            }
        }
        if !job.id.is_empty() {
            jobs.push(job);
        }
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINFO_SAMPLE: &str = "\
n01 32 128000 idle cpu-low (null)
n02 32 128000 mix cpu-low avx2
n03 32 128000 alloc cpu-low avx2
n04 abc 128000 idle cpu-low avx2
";

    #[test]
    fn test_parse_sinfo_nodes() {
        let nodes = parse_sinfo_output(SINFO_SAMPLE);
        // n04 has no parseable CPU count and is dropped.
        assert_eq!(nodes.len(), 3);

        assert_eq!(nodes[0].name, "n01");
        assert_eq!(nodes[0].cpus, 32);
        assert_eq!(nodes[0].memory_mb, 128000);
        assert_eq!(nodes[0].state, NodeState::Idle);
        assert!(nodes[0].available);

        assert_eq!(nodes[1].state, NodeState::Mixed);
        assert!(nodes[1].available);

        assert_eq!(nodes[2].state, NodeState::Allocated);
        assert!(!nodes[2].available);
    }

    #[test]
    fn test_available_iff_idle_like() {
        for (raw, available) in [
            ("idle", true),
            ("mix", true),
            ("alloc", false),
            ("comp", false),
            ("drain", false),
            ("down", false),
            ("resv", false),
            ("weird", false),
        ] {
            assert_eq!(normalize_slurm_state(raw).1, available, "slurm {}", raw);
        }
        for (raw, available) in [
            ("free", true),
            ("job-exclusive", false),
            ("job-sharing", false),
            ("busy", false),
            ("down", false),
            ("offline", false),
            ("state-unknown", false),
        ] {
            assert_eq!(normalize_pbs_state(raw).1, available, "pbs {}", raw);
        }
    }

    const PBSNODES_SAMPLE: &str = "\
node41
     state = free
     np = 28
     properties = batch
     ntype = cluster
     status = rectime=1699999999,ncpus=28,totmem=66000000kb,loadave=0.01

node42
     state = job-exclusive
     np = 28
     jobs = 0-27/50197.hn
     status = rectime=1699999999,ncpus=28,totmem=66000000kb

node61
     state = free
     np = 16
     status = rectime=1699999999,totmem=notanumber
";

    #[test]
    fn test_parse_pbsnodes_drops_malformed_status() {
        let nodes = parse_pbsnodes_output(PBSNODES_SAMPLE);
        // node61's status carries an unparseable totmem and is dropped.
        assert_eq!(nodes.len(), 2);

        assert_eq!(nodes[0].name, "node41");
        assert_eq!(nodes[0].cpus, 28);
        assert_eq!(nodes[0].memory_mb, 66000000 / 1024);
        assert_eq!(nodes[0].state, NodeState::Idle);
        assert!(nodes[0].available);

        assert_eq!(nodes[1].name, "node42");
        assert_eq!(nodes[1].state, NodeState::Allocated);
        assert!(!nodes[1].available);
    }

    #[test]
    fn test_pbs_np_takes_precedence_over_status_ncpus() {
        let output = "\
node50
     state = free
     np = 28
     status = ncpus=56,totmem=1000mb
";
        let nodes = parse_pbsnodes_output(output);
        assert_eq!(nodes[0].cpus, 28);
    }

    #[test]
    fn test_parse_memory_units() {
        assert_eq!(parse_memory_mb("0kb"), Some(0));
        assert_eq!(parse_memory_mb("2GB"), Some(2048));
        assert_eq!(parse_memory_mb("2048"), Some(2048));
        assert_eq!(parse_memory_mb("1T"), Some(1024 * 1024));
        assert_eq!(parse_memory_mb("16427572kb"), Some(16042));
        assert_eq!(parse_memory_mb("garbage"), None);
    }

    #[test]
    fn test_parse_cpu_count_leading_integer() {
        assert_eq!(parse_cpu_count("28"), Some(28));
        assert_eq!(parse_cpu_count("28+"), Some(28));
        assert_eq!(parse_cpu_count("none"), None);
    }

    #[test]
    fn test_filter_available() {
        let nodes = parse_sinfo_output(SINFO_SAMPLE);
        let filtered = filter_available(&nodes, 32, 0, None);
        assert_eq!(filtered.len(), 2);

        let filtered = filter_available(&nodes, 64, 0, None);
        assert!(filtered.is_empty());

        let filtered = filter_available(&nodes, 1, 0, Some("cpu-high"));
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_summarize_partitions_and_states() {
        let nodes = parse_sinfo_output(SINFO_SAMPLE);
        let summary = summarize(&nodes);
        assert_eq!(summary.total_nodes, 3);
        assert_eq!(summary.available_nodes, 2);
        assert_eq!(summary.total_cores, 96);
        assert_eq!(summary.states.get("idle"), Some(&1));
        assert_eq!(summary.partitions.get("cpu-low").unwrap().nodes, 3);
    }

    #[test]
    fn test_parse_squeue_output() {
        let output = "\
101 CFX_Job_2187 alice R None
102 CFX_Job_2189 alice PD Resources
";
        let jobs = parse_squeue_output(output);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "101");
        assert_eq!(jobs[1].state, "PD");
        assert_eq!(jobs[1].reason, "Resources");
    }
}
