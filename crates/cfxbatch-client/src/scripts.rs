use crate::pbs_alloc::{self, PbsNodeSpec};
use cfxbatch_core::config::{RunConfig, SchedulerKind};
use cfxbatch_core::error::Result;
use cfxbatch_core::model::{Case, NodeRecord};
use cfxbatch_core::{log_info, log_warn};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const SUBMIT_SCRIPT_NAME: &str = "Submit_All.sh";
pub const MONITOR_SCRIPT_NAME: &str = "Monitor_Jobs.sh";

/// Submission policy over time, picked from job and node counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    /// All scripts submitted at once; the cluster orders execution.
    Parallel,
    /// Groups of K submitted, each group awaited before the next.
    Batch,
    /// One job at a time, each awaited before the next.
    Sequential,
}

impl fmt::Display for QueueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueStrategy::Parallel => write!(f, "parallel"),
            QueueStrategy::Batch => write!(f, "batch"),
            QueueStrategy::Sequential => write!(f, "sequential"),
        }
    }
}

/// K >= J runs everything at once; up to 2K jobs go out in waves of K;
/// anything denser is strictly one at a time.
pub fn choose_queue_strategy(job_count: usize, available_nodes: usize) -> QueueStrategy {
    if available_nodes >= job_count {
        QueueStrategy::Parallel
    } else if available_nodes >= 1 && job_count <= 2 * available_nodes {
        QueueStrategy::Batch
    } else {
        QueueStrategy::Sequential
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedScripts {
    /// One scheduler script per case, inside the case folders, in pressure
    /// order.
    pub job_scripts: Vec<PathBuf>,
    pub submit_script: PathBuf,
    pub monitor_script: PathBuf,
    pub queue_strategy: QueueStrategy,
    pub job_names: Vec<String>,
}

fn scheduler_script_name(config: &RunConfig, case: &Case) -> String {
    match config.scheduler_type {
        SchedulerKind::Slurm => format!("{}.slurm", case.job_name),
        SchedulerKind::Pbs => format!("{}.pbs", case.job_name),
    }
}

fn solver_invocation(config: &RunConfig, case: &Case, cores: u32) -> String {
    let solver = if config.cfx_module_name.is_empty() {
        config.remote_cfx_executable("cfx5solve")
    } else {
        "cfx5solve".to_string()
    };

    let mut line = format!(
        "\"{}\" -def \"{}\" -part {} -start-method \"Intel MPI Local Parallel\"",
        solver, case.def_file_name, cores
    );
    if let Some(initial) = &case.initial_file {
        line.push_str(&format!(" -ini \"{}\"", initial));
    }
    line
}

fn module_preamble(config: &RunConfig) -> String {
    if config.cfx_module_name.is_empty() {
        String::new()
    } else {
        format!("module load {}\n\n", config.cfx_module_name)
    }
}

fn render_slurm_script(config: &RunConfig, case: &Case, nodelist: Option<&str>) -> String {
    let mut s = String::from("#!/bin/bash\n");
    s.push_str(&format!("#SBATCH --job-name={}\n", case.job_name));
    s.push_str(&format!("#SBATCH --partition={}\n", config.partition));
    s.push_str(&format!("#SBATCH --nodes={}\n", config.nodes));
    s.push_str(&format!(
        "#SBATCH --ntasks-per-node={}\n",
        config.tasks_per_node
    ));
    s.push_str(&format!("#SBATCH --time={}\n", config.time_limit));
    s.push_str(&format!("#SBATCH --mem={}\n", config.memory_per_node));
    if !config.qos.is_empty() {
        s.push_str(&format!("#SBATCH --qos={}\n", config.qos));
    }
    if let Some(nodelist) = nodelist.filter(|n| !n.is_empty()) {
        s.push_str(&format!("#SBATCH --nodelist={}\n", nodelist));
    }
    if !config.exclude_nodes.is_empty() {
        s.push_str(&format!("#SBATCH --exclude={}\n", config.exclude_nodes));
    }
    if !config.email.is_empty() {
        s.push_str(&format!("#SBATCH --mail-user={}\n", config.email));
        s.push_str("#SBATCH --mail-type=END,FAIL\n");
    }
    s.push_str(&format!("#SBATCH --output={}.out\n", case.job_name));
    s.push_str(&format!("#SBATCH --error={}.err\n", case.job_name));
    s.push('\n');
    s.push_str("cd \"$SLURM_SUBMIT_DIR\"\n\n");
    s.push_str(&module_preamble(config));

    let cores = config.nodes * config.tasks_per_node;
    s.push_str(&solver_invocation(config, case, cores));
    s.push('\n');
    s.push_str(&format!("# expected result: {}\n", case.result_file_name()));
    s
}

fn render_pbs_script(config: &RunConfig, case: &Case, nodes_spec: &str, cores: u32) -> String {
    let mut s = String::from("#!/bin/bash\n");
    s.push_str(&format!("#PBS -N {}\n", case.job_name));
    s.push_str(&format!("#PBS -q {}\n", config.queue));
    s.push_str(&format!("#PBS -l nodes={}\n", nodes_spec));
    s.push_str(&format!("#PBS -l walltime={}\n", config.walltime));
    s.push_str(&format!("#PBS -l mem={}\n", config.memory));
    if !config.email.is_empty() {
        s.push_str(&format!("#PBS -M {}\n", config.email));
        s.push_str(&format!("#PBS -m {}\n", config.email_events));
    }
    s.push_str(&format!("#PBS -o {}.out\n", case.job_name));
    s.push_str(&format!("#PBS -e {}.err\n", case.job_name));
    s.push('\n');
    s.push_str("cd \"$PBS_O_WORKDIR\"\n\n");
    s.push_str(&module_preamble(config));
    s.push_str(&solver_invocation(config, case, cores));
    s.push('\n');
    s.push_str(&format!("# expected result: {}\n", case.result_file_name()));
    s
}

fn pbs_specs_from_nodes(nodes: &[NodeRecord]) -> Vec<PbsNodeSpec> {
    nodes
        .iter()
        .filter(|n| n.available)
        .map(|n| PbsNodeSpec::new(n.name.clone(), n.cpus))
        .collect()
}

/// Resolve the `-l nodes=` literal for one PBS job, excluding nodes the
/// current submission wave already claimed.
fn pbs_nodes_spec_for_job(
    config: &RunConfig,
    all_specs: &[PbsNodeSpec],
    claimed: &mut std::collections::BTreeSet<String>,
    exclusive: bool,
) -> (String, u32) {
    let pool: Vec<PbsNodeSpec> = if exclusive {
        all_specs
            .iter()
            .filter(|s| !claimed.contains(&s.node_name))
            .cloned()
            .collect()
    } else {
        all_specs.to_vec()
    };

    let allocation = pbs_alloc::allocate_for_job(config.min_cores, &pool, config);
    for warning in &allocation.warnings {
        log_warn!("PBS allocation: {}", warning);
    }

    if allocation.is_empty() {
        let fallback = if config.nodes_spec.is_empty() {
            format!("1:ppn={}", config.ppn)
        } else {
            config.nodes_spec.clone()
        };
        log_warn!("PBS allocation found no node; falling back to '{}'", fallback);
        return (fallback, config.ppn);
    }

    if exclusive {
        for name in &allocation.allocated_nodes {
            claimed.insert(name.clone());
        }
    }
    (allocation.nodes_spec, allocation.total_cpus)
}

#[cfg(unix)]
fn mark_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs_err::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs_err::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

fn write_script(path: &PathBuf, content: &str) -> Result<()> {
    // Scripts always carry LF endings; they run on POSIX hosts.
    fs_err::write(path, content.replace("\r\n", "\n"))?;
    mark_executable(path)?;
    Ok(())
}

/// Generate one scheduler script per case plus the submit and monitor
/// drivers. `slurm_nodelist` maps job names to pinned nodes when the
/// placement engine chose them.
pub fn generate(
    config: &RunConfig,
    cases: &[Case],
    nodes: &[NodeRecord],
    slurm_nodelist: &BTreeMap<String, String>,
) -> Result<GeneratedScripts> {
    let available_nodes = if nodes.is_empty() {
        // Without inventory data, assume a small cluster slice.
        2
    } else {
        nodes.iter().filter(|n| n.available).count()
    };
    let queue_strategy = choose_queue_strategy(cases.len(), available_nodes);
    log_info!(
        "{} jobs over {} available nodes -> {} submission",
        cases.len(),
        available_nodes,
        queue_strategy
    );

    let pbs_specs = pbs_specs_from_nodes(nodes);
    let mut claimed = std::collections::BTreeSet::new();
    let mut job_scripts = Vec::new();
    let mut job_names = Vec::new();

    for (index, case) in cases.iter().enumerate() {
        let folder = config.base_path.join(&case.folder_name);
        fs_err::create_dir_all(&folder)?;
        let script_path = folder.join(scheduler_script_name(config, case));

        let content = match config.scheduler_type {
            SchedulerKind::Slurm => {
                let pinned = slurm_nodelist
                    .get(&case.job_name)
                    .map(String::as_str)
                    .or({
                        if config.nodelist.is_empty() {
                            None
                        } else {
                            Some(config.nodelist.as_str())
                        }
                    });
                render_slurm_script(config, case, pinned)
            }
            SchedulerKind::Pbs => {
                // Parallel waves claim nodes exclusively; sequential reuses
                // the same best node for every job. Batch waves reset their
                // claims at each group boundary.
                let exclusive = match queue_strategy {
                    QueueStrategy::Parallel => true,
                    QueueStrategy::Sequential => false,
                    QueueStrategy::Batch => {
                        if index % available_nodes.max(1) == 0 {
                            claimed.clear();
                        }
                        true
                    }
                };
                let (nodes_spec, cores) =
                    pbs_nodes_spec_for_job(config, &pbs_specs, &mut claimed, exclusive);
                render_pbs_script(config, case, &nodes_spec, cores)
            }
        };

        write_script(&script_path, &content)?;
        log_info!("job script written: {}", script_path.display());
        job_scripts.push(script_path);
        job_names.push(case.job_name.clone());
    }

    let submit_script = config.base_path.join(SUBMIT_SCRIPT_NAME);
    write_script(
        &submit_script,
        &render_submit_script(config, cases, queue_strategy, available_nodes),
    )?;

    let monitor_script = config.base_path.join(MONITOR_SCRIPT_NAME);
    write_script(&monitor_script, &render_monitor_script(config, &job_names))?;

    Ok(GeneratedScripts {
        job_scripts,
        submit_script,
        monitor_script,
        queue_strategy,
        job_names,
    })
}

fn submit_command(config: &RunConfig) -> &'static str {
    match config.scheduler_type {
        SchedulerKind::Slurm => "sbatch",
        SchedulerKind::Pbs => "qsub",
    }
}

/// One `submit + capture id` stanza. SLURM answers
/// `Submitted batch job <id>`; PBS prints the id alone.
fn submit_stanza(config: &RunConfig, case: &Case) -> String {
    let script = scheduler_script_name(config, case);
    let mut s = String::new();
    s.push_str(&format!("echo \"submitting {}/{}\"\n", case.folder_name, script));
    s.push_str(&format!(
        "OUTPUT=$(cd \"{}\" && {} \"{}\")\n",
        case.folder_name,
        submit_command(config),
        script
    ));
    s.push_str("echo \"$OUTPUT\"\n");
    match config.scheduler_type {
        SchedulerKind::Slurm => {
            s.push_str("JOB_ID=$(echo \"$OUTPUT\" | awk '/Submitted batch job/ {print $4}')\n");
        }
        SchedulerKind::Pbs => {
            s.push_str("JOB_ID=\"$OUTPUT\"\n");
        }
    }
    s
}

fn wait_loop(config: &RunConfig, id_var: &str) -> String {
    match config.scheduler_type {
        SchedulerKind::Slurm => format!(
            "while [ -n \"$(squeue -h -j \"{}\" 2>/dev/null)\" ]; do sleep 30; done\n",
            id_var
        ),
        SchedulerKind::Pbs => format!(
            "while qstat \"{}\" >/dev/null 2>&1; do sleep 30; done\n",
            id_var
        ),
    }
}

fn render_submit_script(
    config: &RunConfig,
    cases: &[Case],
    queue_strategy: QueueStrategy,
    available_nodes: usize,
) -> String {
    let mut s = String::from("#!/bin/bash\n");
    s.push_str(&format!(
        "# submit driver: strategy {}, {} jobs, {} available nodes\n",
        queue_strategy,
        cases.len(),
        available_nodes
    ));
    s.push_str("cd \"$(dirname \"$0\")\"\n\n");

    let delay = config.job_submit_delay;

    match queue_strategy {
        QueueStrategy::Parallel => {
            s.push_str("echo \"submitting all jobs\"\n");
            for case in cases {
                s.push_str(&submit_stanza(config, case));
                if delay > 0 {
                    s.push_str(&format!("sleep {}\n", delay));
                }
                s.push('\n');
            }
        }
        QueueStrategy::Sequential => {
            s.push_str("echo \"submitting jobs one at a time\"\n");
            for (i, case) in cases.iter().enumerate() {
                s.push_str(&submit_stanza(config, case));
                if i + 1 < cases.len() {
                    s.push_str("echo \"waiting for $JOB_ID to finish\"\n");
                    s.push_str(&wait_loop(config, "$JOB_ID"));
                }
                s.push('\n');
            }
        }
        QueueStrategy::Batch => {
            let group = available_nodes.max(1);
            let chunks: Vec<&[Case]> = cases.chunks(group).collect();
            s.push_str(&format!(
                "echo \"submitting {} groups of up to {} jobs\"\n\n",
                chunks.len(),
                group
            ));
            for (g, chunk) in chunks.iter().enumerate() {
                s.push_str(&format!("echo \"group {}\"\n", g + 1));
                s.push_str("JOB_IDS=\"\"\n");
                for case in *chunk {
                    s.push_str(&submit_stanza(config, case));
                    s.push_str("JOB_IDS=\"$JOB_IDS $JOB_ID\"\n");
                    if delay > 0 {
                        s.push_str(&format!("sleep {}\n", delay));
                    }
                }
                if g + 1 < chunks.len() {
                    s.push_str("echo \"waiting for group to finish\"\n");
                    s.push_str("for id in $JOB_IDS; do\n");
                    s.push_str(&format!("    {}", wait_loop(config, "$id")));
                    s.push_str("done\n");
                }
                s.push('\n');
            }
        }
    }

    s.push_str("echo \"all jobs submitted\"\n");
    s
}

fn render_monitor_script(config: &RunConfig, job_names: &[String]) -> String {
    let mut s = String::from("#!/bin/bash\n");
    s.push_str("# loops until none of the named jobs is in the queue\n\n");
    s.push_str(&format!("JOBS=({})\n", job_names.join(" ")));
    s.push_str(&format!("CHECK_INTERVAL={}\n\n", config.monitor_interval));
    s.push_str("while true; do\n");
    s.push_str("    running=0\n");
    s.push_str("    for job in \"${JOBS[@]}\"; do\n");
    match config.scheduler_type {
        SchedulerKind::Slurm => {
            s.push_str(
                "        if [ -n \"$(squeue -h -n \"$job\" 2>/dev/null)\" ]; then\n",
            );
        }
        SchedulerKind::Pbs => {
            s.push_str(
                "        if qstat -f 2>/dev/null | grep -q \"Job_Name = $job\"; then\n",
            );
        }
    }
    s.push_str("            running=$((running + 1))\n");
    s.push_str("        fi\n");
    s.push_str("    done\n");
    s.push_str("    if [ \"$running\" -eq 0 ]; then\n");
    s.push_str("        echo \"all jobs finished\"\n");
    s.push_str("        break\n");
    s.push_str("    fi\n");
    s.push_str("    echo \"$(date): $running jobs still queued or running\"\n");
    s.push_str("    sleep $CHECK_INTERVAL\n");
    s.push_str("done\n");
    s
}
