use crate::casegen::{self, CaseGeneration};
use crate::inventory;
use crate::monitor::{JobMonitor, MonitorReport};
use crate::placement::{self, PlacementJob, PlacementResult};
use crate::probe;
use crate::report::{
    self, ConfigurationEcho, ExecutionReport, ExecutionSummary, GeneratedFiles,
};
use crate::scripts::{self, GeneratedScripts};
use crate::transport::{remote_join, RemoteSession, SshSession, Transport, TransferItem};
use cfxbatch_core::config::{CfxMode, RunConfig, SchedulerKind};
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::{Case, JobId, JobRecord, NodeRecord};
use cfxbatch_core::{log_error, log_info, log_warn};
use chrono::{DateTime, Local};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The pipeline's steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ConnectServer,
    VerifyCfx,
    GeneratePre,
    GenerateDef,
    QueryCluster,
    GenerateScripts,
    UploadFiles,
    SubmitJobs,
    MonitorJobs,
}

impl Step {
    pub const ALL: [Step; 9] = [
        Step::ConnectServer,
        Step::VerifyCfx,
        Step::GeneratePre,
        Step::GenerateDef,
        Step::QueryCluster,
        Step::GenerateScripts,
        Step::UploadFiles,
        Step::SubmitJobs,
        Step::MonitorJobs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Step::ConnectServer => "connect_server",
            Step::VerifyCfx => "verify_cfx",
            Step::GeneratePre => "generate_pre",
            Step::GenerateDef => "generate_def",
            Step::QueryCluster => "query_cluster",
            Step::GenerateScripts => "generate_scripts",
            Step::UploadFiles => "upload_files",
            Step::SubmitJobs => "submit_jobs",
            Step::MonitorJobs => "monitor_jobs",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Step {
    type Err = AppError;
    fn from_str(s: &str) -> Result<Self> {
        Step::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| AppError::UnknownStep(s.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub current: Option<Step>,
    pub completed: Vec<Step>,
    pub failed: Vec<Step>,
    pub started: DateTime<Local>,
    pub finished: Option<DateTime<Local>>,
}

impl WorkflowState {
    fn new() -> Self {
        WorkflowState {
            current: None,
            completed: Vec::new(),
            failed: Vec::new(),
            started: Local::now(),
            finished: None,
        }
    }
}

/// Everything one step hands to later steps. No hidden mutable state:
/// the pipeline's data flow is exactly these fields.
#[derive(Default)]
pub struct Artifacts {
    pub local_pre_executable: Option<PathBuf>,
    pub remote_cfx: Vec<(String, String)>,
    pub session_script: Option<PathBuf>,
    pub generation: Option<CaseGeneration>,
    pub nodes: Vec<NodeRecord>,
    pub placement: Option<PlacementResult>,
    pub scripts: Option<GeneratedScripts>,
    pub jobs: Vec<JobRecord>,
    pub monitor_report: Option<MonitorReport>,
}

static SLURM_SUBMIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Submitted batch job (\d+)$").unwrap());
static PBS_JOB_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(\.\S+)?$").unwrap());

/// Pull scheduler-assigned job ids out of the driver's stdout. SLURM
/// announces `Submitted batch job <id>`; PBS prints the bare id.
pub fn parse_submission_output(scheduler: SchedulerKind, stdout: &str) -> Vec<JobId> {
    stdout
        .lines()
        .map(str::trim)
        .filter_map(|line| match scheduler {
            SchedulerKind::Slurm => SLURM_SUBMIT_RE
                .captures(line)
                .map(|caps| JobId(caps[1].to_string())),
            SchedulerKind::Pbs => PBS_JOB_ID_RE
                .is_match(line)
                .then(|| JobId(line.to_string())),
        })
        .collect()
}

type Connector = Box<dyn FnMut(&RunConfig) -> Result<Box<dyn RemoteSession>>>;

/// The resumable step pipeline driving one batch run end to end.
pub struct Workflow {
    config: RunConfig,
    cases: Vec<Case>,
    state: WorkflowState,
    artifacts: Artifacts,
    transport: Option<Transport>,
    connector: Connector,
    cancel: Arc<AtomicBool>,
}

impl Workflow {
    pub fn new(config: RunConfig, cancel: Arc<AtomicBool>) -> Result<Self> {
        Self::with_connector(
            config,
            cancel,
            Box::new(|config| {
                Ok(Box::new(SshSession::connect(config)?) as Box<dyn RemoteSession>)
            }),
        )
    }

    /// Construction seam for tests: supply the session factory.
    pub fn with_connector(
        config: RunConfig,
        cancel: Arc<AtomicBool>,
        connector: Connector,
    ) -> Result<Self> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(AppError::config("run configuration", errors.join("; ")));
        }
        let cases = config.cases();
        Ok(Workflow {
            config,
            cases,
            state: WorkflowState::new(),
            artifacts: Artifacts::default(),
            transport: None,
            connector,
            cancel,
        })
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    fn transport(&mut self) -> Result<&mut Transport> {
        self.transport.as_mut().ok_or_else(|| {
            AppError::Transport("not connected; run the connect_server step first".to_string())
        })
    }

    fn execute(&mut self, step: Step) -> Result<()> {
        if self.cancel.load(Ordering::Relaxed) && step != Step::MonitorJobs {
            return Err(AppError::UserAborted);
        }

        self.state.current = Some(step);
        log_info!("step {} started", step);
        match self.dispatch(step) {
            Ok(()) => {
                self.state.completed.push(step);
                log_info!("step {} completed", step);
                Ok(())
            }
            Err(e) => {
                self.state.failed.push(step);
                log_error!("step {} failed: {}", step, e);
                Err(AppError::Workflow {
                    step: step.name().to_string(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn dispatch(&mut self, step: Step) -> Result<()> {
        match step {
            Step::ConnectServer => self.step_connect_server(),
            Step::VerifyCfx => self.step_verify_cfx(),
            Step::GeneratePre => self.step_generate_pre(),
            Step::GenerateDef => self.step_generate_def(),
            Step::QueryCluster => self.step_query_cluster(),
            Step::GenerateScripts => self.step_generate_scripts(),
            Step::UploadFiles => self.step_upload_files(),
            Step::SubmitJobs => self.step_submit_jobs(),
            Step::MonitorJobs => self.step_monitor_jobs(),
        }
    }

    /// Run the full pipeline. With `dry_run`, stop after enumerating the
    /// planned jobs and their placement.
    pub fn run(&mut self, dry_run: bool) -> Result<ExecutionReport> {
        log_info!(
            "starting batch run '{}': {} cases, {} on {}",
            self.config.project_name,
            self.cases.len(),
            self.config.scheduler_type,
            self.config.ssh_host
        );

        let outcome = if dry_run {
            self.run_dry()
        } else {
            self.run_full()
        };
        self.finish(outcome)
    }

    /// Run only the named steps, in the supplied order, writing a small
    /// report after each.
    pub fn run_steps(&mut self, steps: &[Step]) -> Result<ExecutionReport> {
        let mut outcome = Ok(());
        for &step in steps {
            outcome = self.execute(step);
            let status = if outcome.is_ok() { "completed" } else { "failed" };
            if let Err(e) = report::write_step_report(
                &self.config.base_path,
                step.name(),
                status,
                self.step_detail(step),
            ) {
                log_warn!("could not write step report for {}: {}", step, e);
            }
            if outcome.is_err() {
                break;
            }
        }
        self.finish(outcome)
    }

    fn step_detail(&self, step: Step) -> serde_json::Value {
        match step {
            Step::GenerateDef => serde_json::json!({
                "def_files": self
                    .artifacts
                    .generation
                    .as_ref()
                    .map(|g| g.def_files.clone())
                    .unwrap_or_default(),
            }),
            Step::QueryCluster => serde_json::json!({
                "nodes": self.artifacts.nodes.len(),
                "available": self.artifacts.nodes.iter().filter(|n| n.available).count(),
            }),
            Step::SubmitJobs => serde_json::json!({
                "job_ids": self
                    .artifacts
                    .jobs
                    .iter()
                    .map(|j| j.id.0.clone())
                    .collect::<Vec<_>>(),
            }),
            _ => serde_json::json!({
                "pressure_list": self.config.pressure_list,
            }),
        }
    }

    fn run_full(&mut self) -> Result<()> {
        self.execute(Step::ConnectServer)?;
        self.execute(Step::VerifyCfx)?;
        self.execute(Step::GeneratePre)?;
        self.execute(Step::GenerateDef)?;
        if self.config.enable_node_detection {
            self.execute(Step::QueryCluster)?;
        }
        self.execute(Step::GenerateScripts)?;
        self.execute(Step::UploadFiles)?;
        self.execute(Step::SubmitJobs)?;
        if self.config.enable_monitoring {
            self.execute(Step::MonitorJobs)?;
        }
        Ok(())
    }

    fn run_dry(&mut self) -> Result<()> {
        self.execute(Step::ConnectServer)?;
        self.execute(Step::VerifyCfx)?;
        if self.config.enable_node_detection {
            self.execute(Step::QueryCluster)?;
        }

        let available = self.artifacts.nodes.iter().filter(|n| n.available).count();
        let strategy = scripts::choose_queue_strategy(
            self.cases.len(),
            if self.artifacts.nodes.is_empty() { 2 } else { available },
        );
        log_info!(
            "dry run: {} planned jobs, queue strategy {}",
            self.cases.len(),
            strategy
        );
        for case in &self.cases {
            log_info!(
                "planned job {}: folder {}, def {}",
                case.job_name,
                case.folder_name,
                case.def_file_name
            );
        }

        if self.config.enable_node_allocation && !self.artifacts.nodes.is_empty() {
            let jobs = self.placement_jobs();
            for result in
                placement::compare_strategies(&self.artifacts.nodes, &jobs, &self.config)
            {
                log_info!(
                    "strategy {}: {} placed, efficiency {:.1}, est. {} min",
                    result.strategy,
                    result.summary.placed_jobs,
                    result.efficiency_score,
                    result.estimated_minutes
                );
            }
        }
        Ok(())
    }

    fn finish(&mut self, outcome: Result<()>) -> Result<ExecutionReport> {
        self.state.finished = Some(Local::now());

        if outcome.is_ok() && self.config.cleanup_remote_files {
            let remote_base = self.config.remote_base_path.clone();
            if let Ok(transport) = self.transport() {
                if let Err(e) = transport.cleanup_remote(&remote_base) {
                    log_warn!("remote cleanup failed: {}", e);
                }
            }
        }

        let report = self.build_report();
        if let Err(e) = report::write_execution_report(&report, &self.config.base_path) {
            log_error!("could not write the execution report: {}", e);
        }

        if let Some(transport) = self.transport.as_mut() {
            let _ = transport.close();
        }

        match outcome {
            Ok(()) => {
                if self.cancel.load(Ordering::Relaxed) {
                    Err(AppError::UserAborted)
                } else {
                    Ok(report)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn placement_jobs(&self) -> Vec<PlacementJob> {
        let default_cores = match self.config.scheduler_type {
            SchedulerKind::Slurm => self.config.nodes * self.config.tasks_per_node,
            SchedulerKind::Pbs => self.config.min_cores,
        };
        self.cases
            .iter()
            .map(|case| PlacementJob {
                name: case.job_name.clone(),
                pressure: case.pressure,
                cores: default_cores,
                memory_mb: 0,
            })
            .collect()
    }

    fn step_connect_server(&mut self) -> Result<()> {
        let session = (self.connector)(&self.config)?;
        self.transport = Some(Transport::new(session, &self.config));
        Ok(())
    }

    fn step_verify_cfx(&mut self) -> Result<()> {
        let uses_module_system = !self.config.cfx_module_name.is_empty();
        if self.config.skip_cfx_verification || uses_module_system {
            log_info!(
                "skipping remote CFX verification ({})",
                if uses_module_system {
                    "environment-module system"
                } else {
                    "disabled in configuration"
                }
            );
        } else {
            let transport = self.transport.as_mut().ok_or_else(|| {
                AppError::Transport("not connected; run the connect_server step first".to_string())
            })?;
            let found = probe::verify_remote_cfx(transport, &self.config)?;
            self.artifacts.remote_cfx = found;
        }

        if self.config.cfx_mode == CfxMode::Local {
            let pre = probe::resolve_local_pre_executable(&self.config)?;
            log_info!("local CFX-Pre: {}", pre.display());
            self.artifacts.local_pre_executable = Some(pre);
        }
        Ok(())
    }

    fn step_generate_pre(&mut self) -> Result<()> {
        let path = casegen::write_session_script(&self.config, &self.cases)?;
        self.artifacts.session_script = Some(path);
        Ok(())
    }

    fn step_generate_def(&mut self) -> Result<()> {
        let generation = match self.config.cfx_mode {
            CfxMode::Local => {
                let pre = match &self.artifacts.local_pre_executable {
                    Some(pre) => pre.clone(),
                    None => probe::resolve_local_pre_executable(&self.config)?,
                };
                casegen::generate_local(&self.config, &self.cases, &pre)?
            }
            CfxMode::Server => {
                let config = self.config.clone();
                let cases = self.cases.clone();
                let transport = self.transport()?;
                casegen::generate_remote(&config, &cases, transport)?
            }
        };
        log_info!(
            "{}/{} cases produced a solver input",
            generation.valid_count(),
            self.cases.len()
        );
        self.artifacts.generation = Some(generation);
        Ok(())
    }

    fn step_query_cluster(&mut self) -> Result<()> {
        let configured = self.config.scheduler_type;
        let transport = self.transport()?;
        let detected = inventory::detect_scheduler(transport)?;
        if detected != configured {
            log_warn!(
                "configured scheduler {} but detected {}; proceeding with {}",
                configured,
                detected,
                configured
            );
        }
        let nodes = inventory::query_nodes(transport, configured)?;

        let available = nodes.iter().filter(|n| n.available).count();
        log_info!("{} nodes, {} available", nodes.len(), available);
        if available == 0 {
            return Err(AppError::Placement(
                "cluster query returned no available nodes".to_string(),
            ));
        }
        self.artifacts.nodes = nodes;
        Ok(())
    }

    fn step_generate_scripts(&mut self) -> Result<()> {
        let mut nodelist = BTreeMap::new();

        if self.config.enable_node_allocation && !self.artifacts.nodes.is_empty() {
            let jobs = self.placement_jobs();
            let result = placement::allocate(
                self.config.node_allocation_strategy,
                &self.artifacts.nodes,
                &jobs,
                &self.config,
            )?;
            if result.jobs.is_empty() && !jobs.is_empty() {
                return Err(AppError::Placement(
                    "no job could be placed on any available node".to_string(),
                ));
            }
            for warning in &result.warnings {
                log_warn!("placement: {}", warning);
            }
            log_info!(
                "placement {}: {} jobs placed, efficiency {:.1}",
                result.strategy,
                result.summary.placed_jobs,
                result.efficiency_score
            );
            if self.config.scheduler_type == SchedulerKind::Slurm {
                for placed in &result.jobs {
                    nodelist.insert(placed.job.name.clone(), placed.node.clone());
                }
            }
            self.artifacts.placement = Some(result);
        }

        let scripts =
            scripts::generate(&self.config, &self.cases, &self.artifacts.nodes, &nodelist)?;
        self.artifacts.scripts = Some(scripts);
        Ok(())
    }

    fn step_upload_files(&mut self) -> Result<()> {
        let mut items = Vec::new();

        // Whole case folders, structure preserved.
        for case in &self.cases {
            let folder = self.config.base_path.join(&case.folder_name);
            if !folder.is_dir() {
                continue;
            }
            for entry in walkdir::WalkDir::new(&folder)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let relative = entry
                    .path()
                    .strip_prefix(&self.config.base_path)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                items.push(TransferItem {
                    local: entry.path().to_path_buf(),
                    relative,
                });
            }
        }

        // The restart file is staged into every case folder.
        if let Some(initial) = &self.config.initial_file {
            let initial_path = PathBuf::from(initial);
            if initial_path.is_file() {
                let name = initial_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| initial.clone());
                for case in &self.cases {
                    items.push(TransferItem {
                        local: initial_path.clone(),
                        relative: format!("{}/{}", case.folder_name, name),
                    });
                }
            } else {
                log_warn!("initial file not found, skipping: {}", initial);
            }
        }

        // Driver and monitor scripts at the staging root.
        if let Some(scripts) = &self.artifacts.scripts {
            for script in [&scripts.submit_script, &scripts.monitor_script] {
                let relative = script
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                items.push(TransferItem {
                    local: script.clone(),
                    relative,
                });
            }
        }

        if items.is_empty() {
            return Err(AppError::Transport(
                "nothing to upload; did script generation run?".to_string(),
            ));
        }

        log_info!("uploading {} files", items.len());
        let remote_base = self.config.remote_base_path.clone();
        let transport = self.transport()?;
        let report = transport.upload(&items, &remote_base)?;
        if !report.all_ok() {
            return Err(AppError::Transport(format!(
                "{} of {} files failed to upload after retries",
                report.failed.len(),
                items.len()
            )));
        }
        Ok(())
    }

    fn step_submit_jobs(&mut self) -> Result<()> {
        let remote_base = self.config.remote_base_path.clone();
        let scheduler = self.config.scheduler_type;
        let driver = remote_join(&remote_base, scripts::SUBMIT_SCRIPT_NAME);

        let transport = self.transport()?;
        transport.exec_checked(&format!("chmod +x '{}'", driver))?;

        let command = format!("cd '{}' && ./{}", remote_base, scripts::SUBMIT_SCRIPT_NAME);
        log_info!("submitting jobs: {}", command);
        let output = transport.exec_unbounded(&command)?;

        if !output.success() {
            log_error!(
                "submit driver exited with {}; stdout: {}; stderr: {}",
                output.exit_code,
                output.stdout.trim(),
                output.stderr.trim()
            );
            // Diagnostic replay with shell tracing for the log.
            match transport.exec(&format!(
                "cd '{}' && bash -x ./{}",
                remote_base,
                scripts::SUBMIT_SCRIPT_NAME
            )) {
                Ok(diag) => log_error!("driver trace: {}", diag.stderr.trim()),
                Err(e) => log_warn!("driver trace unavailable: {}", e),
            }
            return Err(AppError::Scheduler(format!(
                "submit driver exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let ids = parse_submission_output(scheduler, &output.stdout);
        if ids.is_empty() {
            return Err(AppError::Scheduler(
                "no job ids could be parsed from the submit driver output".to_string(),
            ));
        }
        if ids.len() != self.cases.len() {
            log_warn!(
                "{} job ids for {} cases; pairing by submission order",
                ids.len(),
                self.cases.len()
            );
        }

        let mut jobs = Vec::new();
        for (index, id) in ids.into_iter().enumerate() {
            let mut record = match self.cases.get(index) {
                Some(case) => {
                    let mut record = JobRecord::new(id, case.job_name.clone());
                    record.pressure = Some(case.pressure);
                    record.case_folder = Some(case.folder_name.clone());
                    record
                }
                None => {
                    let name = format!("job_{}", index + 1);
                    JobRecord::new(id, name)
                }
            };
            record.submitted_at = Some(Local::now());
            jobs.push(record);
        }
        log_info!("{} jobs submitted", jobs.len());
        self.artifacts.jobs = jobs;
        Ok(())
    }

    fn step_monitor_jobs(&mut self) -> Result<()> {
        if self.artifacts.jobs.is_empty() {
            log_warn!("no submitted jobs to monitor");
            return Ok(());
        }

        let config = self.config.clone();
        let jobs = self.artifacts.jobs.clone();
        let cancel = Arc::clone(&self.cancel);
        let transport = self.transport()?;

        let mut monitor = JobMonitor::new(jobs, cancel);
        let monitor_report = monitor.run(&config, transport)?;
        self.artifacts.jobs = monitor.jobs().to_vec();
        self.artifacts.monitor_report = Some(monitor_report);

        if self.cancel.load(Ordering::Relaxed) {
            return Err(AppError::UserAborted);
        }
        Ok(())
    }

    pub fn build_report(&self) -> ExecutionReport {
        let end = self.state.finished.unwrap_or_else(Local::now);
        let generated_files = self
            .artifacts
            .scripts
            .as_ref()
            .map(|scripts| GeneratedFiles {
                job_scripts: scripts
                    .job_scripts
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect(),
                submit_script: scripts.submit_script.display().to_string(),
                monitor_script: scripts.monitor_script.display().to_string(),
                queue_strategy: scripts.queue_strategy.to_string(),
            })
            .unwrap_or_default();

        ExecutionReport {
            execution_summary: ExecutionSummary {
                total_jobs: self.cases.len(),
                successful_submissions: self.artifacts.jobs.len(),
                execution_duration_seconds: (end - self.state.started).num_seconds(),
                completed_steps: self.state.completed.iter().map(|s| s.to_string()).collect(),
                failed_steps: self.state.failed.iter().map(|s| s.to_string()).collect(),
                start_time: self.state.started,
                end_time: self.state.finished,
            },
            configuration: ConfigurationEcho::from_config(&self.config),
            generated_files,
            transfer_statistics: self
                .transport
                .as_ref()
                .map(|t| t.stats().clone())
                .unwrap_or_default(),
            monitoring_report: self.artifacts.monitor_report.clone(),
            report_generation_time: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_round_trip_names() {
        for step in Step::ALL {
            assert_eq!(Step::from_str(step.name()).unwrap(), step);
        }
        assert!(Step::from_str("reticulate_splines").is_err());
    }

    #[test]
    fn test_parse_slurm_submission_output() {
        let stdout = "\
submitting P_Out_2187/CFX_Job_2187.slurm
Submitted batch job 11122885
submitting P_Out_2189/CFX_Job_2189.slurm
Submitted batch job 11122886
Submitted batch job 11122887 extra trailing text
all jobs submitted
";
        let ids = parse_submission_output(SchedulerKind::Slurm, stdout);
        assert_eq!(
            ids,
            vec![JobId("11122885".into()), JobId("11122886".into())]
        );
    }

    #[test]
    fn test_parse_pbs_submission_output() {
        let stdout = "\
submitting P_Out_2200/CFX_Job_2200.pbs
50197.hn
50198.hn
all jobs submitted
";
        let ids = parse_submission_output(SchedulerKind::Pbs, stdout);
        assert_eq!(ids, vec![JobId("50197.hn".into()), JobId("50198.hn".into())]);
    }

    #[test]
    fn test_workflow_rejects_invalid_config() {
        let config = RunConfig::default();
        let result = Workflow::new(config, Arc::new(AtomicBool::new(false)));
        assert!(matches!(result, Err(AppError::Config { .. })));
    }

    #[test]
    fn test_workflow_rejects_empty_pressure_list() {
        let mut config = RunConfig::default();
        config.ssh_host = "hpc".into();
        config.ssh_user = "alice".into();
        config.ssh_key = Some("/key".into());
        config.remote_base_path = "/scratch".into();
        config.cfx_file_path = "pump.cfx".into();
        config.pressure_list.clear();
        let result = Workflow::new(config, Arc::new(AtomicBool::new(false)));
        match result {
            Err(AppError::Config { reason, .. }) => {
                assert!(reason.contains("pressure_list"));
            }
            other => panic!("expected ConfigError, got {:?}", other.map(|_| ())),
        }
    }
}
