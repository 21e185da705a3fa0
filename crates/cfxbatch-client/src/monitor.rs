use crate::transport::{remote_join, Transport};
use cfxbatch_core::config::{RunConfig, SchedulerKind};
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::{JobRecord, JobState};
use cfxbatch_core::{log_debug, log_info, log_warn};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive query failures before a job is marked unknown and dropped
/// from active polling.
const MAX_QUERY_FAILURES: u32 = 3;
const HISTORY_CAP: usize = 1000;
const HISTORY_KEEP: usize = 500;

/// Outcome of one status query. "Command succeeded with empty output" is
/// an observation (the scheduler forgot the job: completed); a failing
/// command is not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusProbe {
    Observed(JobState),
    QueryFailed(String),
}

pub fn parse_slurm_state(raw: &str) -> JobState {
    let upper = raw.trim().to_uppercase();
    // sacct reports cancellations as e.g. "CANCELLED by 1234".
    if upper.starts_with("CANCELLED") {
        return JobState::Cancelled;
    }
    match upper.as_str() {
        "PENDING" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "FAILED" | "NODE_FAIL" | "OUT_OF_MEMORY" => JobState::Failed,
        "TIMEOUT" => JobState::Timeout,
        "PREEMPTED" => JobState::Cancelled,
        _ => JobState::Unknown,
    }
}

pub fn parse_pbs_state(raw: &str) -> JobState {
    match raw.trim().to_uppercase().as_str() {
        "Q" | "H" | "W" | "S" => JobState::Pending,
        "R" | "T" => JobState::Running,
        "C" | "E" => JobState::Completed,
        _ => JobState::Unknown,
    }
}

/// First data row of `sacct ... --parsable2` output:
/// `JobID|State|Start|End|ExitCode`.
pub fn parse_sacct_output(output: &str) -> Option<JobState> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|line| line.split('|').nth(1))
        .map(parse_slurm_state)
}

/// `job_state = R` line of `qstat -f` output.
pub fn parse_qstat_full_output(output: &str) -> Option<JobState> {
    output
        .lines()
        .filter_map(|l| l.trim().split_once('='))
        .find(|(key, _)| key.trim() == "job_state")
        .map(|(_, value)| parse_pbs_state(value))
}

fn check_slurm_job(transport: &mut Transport, job_id: &str) -> StatusProbe {
    let sacct = format!(
        "sacct -j {} -n -o JobID,State,Start,End,ExitCode --parsable2",
        job_id
    );
    match transport.exec(&sacct) {
        Ok(output) if output.success() => {
            if output.stdout.trim().is_empty() {
                check_squeue_fallback(transport, job_id)
            } else {
                match parse_sacct_output(&output.stdout) {
                    Some(state) => StatusProbe::Observed(state),
                    None => StatusProbe::Observed(JobState::Unknown),
                }
            }
        }
        Ok(_) => check_squeue_fallback(transport, job_id),
        Err(e) => StatusProbe::QueryFailed(e.to_string()),
    }
}

fn check_squeue_fallback(transport: &mut Transport, job_id: &str) -> StatusProbe {
    let squeue = format!("squeue -j {} -h -o '%T'", job_id);
    match transport.exec(&squeue) {
        Ok(output) if output.success() => {
            let state = output.stdout.trim();
            if state.is_empty() {
                // The queue no longer knows the job and the query itself
                // succeeded: it finished.
                StatusProbe::Observed(JobState::Completed)
            } else {
                StatusProbe::Observed(parse_slurm_state(state))
            }
        }
        Ok(output) => StatusProbe::QueryFailed(format!(
            "squeue exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )),
        Err(e) => StatusProbe::QueryFailed(e.to_string()),
    }
}

fn check_pbs_job(transport: &mut Transport, job_id: &str) -> StatusProbe {
    match transport.exec(&format!("qstat -f {}", job_id)) {
        Ok(output) if output.success() => match parse_qstat_full_output(&output.stdout) {
            Some(state) => StatusProbe::Observed(state),
            None => StatusProbe::Observed(JobState::Unknown),
        },
        Ok(output) => {
            // qstat rejects ids it no longer tracks; that is completion,
            // not a query failure.
            if output.stderr.to_lowercase().contains("unknown job") {
                StatusProbe::Observed(JobState::Completed)
            } else {
                StatusProbe::QueryFailed(format!(
                    "qstat exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ))
            }
        }
        Err(e) => StatusProbe::QueryFailed(e.to_string()),
    }
}

pub fn check_job(
    transport: &mut Transport,
    scheduler: SchedulerKind,
    job_id: &str,
) -> StatusProbe {
    match scheduler {
        SchedulerKind::Slurm => check_slurm_job(transport, job_id),
        SchedulerKind::Pbs => check_pbs_job(transport, job_id),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub timestamp: DateTime<Local>,
    pub state_counts: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSummary {
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub success_rate: f64,
    pub total_runtime_seconds: u64,
    pub average_runtime_seconds: u64,
    pub downloaded_results: usize,
    pub monitoring_duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub summary: MonitorSummary,
    pub jobs: Vec<JobRecord>,
    pub history: Vec<MonitorSnapshot>,
    pub generated_at: DateTime<Local>,
}

fn download_results(
    config: &RunConfig,
    transport: &mut Transport,
    job: &mut JobRecord,
) {
    let remote_dir = match &job.case_folder {
        Some(folder) => remote_join(&config.remote_base_path, folder),
        None => config.remote_base_path.clone(),
    };
    let local_dir = config.base_path.join("results").join(&job.name);
    match transport.collect_results(
        &job.name,
        &remote_dir,
        &config.result_file_patterns,
        &local_dir,
    ) {
        Ok(files) => {
            log_info!("downloaded {} result files for {}", files.len(), job.name);
            job.result_files = files;
            job.downloaded = true;
        }
        Err(e) => {
            log_warn!("result download failed for {}: {}", job.name, e);
            job.error_message = Some(format!("result download failed: {}", e));
        }
    }
}

/// Polls the scheduler until every job reaches a terminal state, the user
/// cancels, or every remaining job has gone unknown.
pub struct JobMonitor {
    jobs: Vec<JobRecord>,
    history: Vec<MonitorSnapshot>,
    cancel: Arc<AtomicBool>,
    started: DateTime<Local>,
}

impl JobMonitor {
    pub fn new(jobs: Vec<JobRecord>, cancel: Arc<AtomicBool>) -> Self {
        JobMonitor {
            jobs,
            history: Vec::new(),
            cancel,
            started: Local::now(),
        }
    }

    fn has_active_jobs(&self) -> bool {
        self.jobs.iter().any(|j| j.state.is_active())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn poll_cycle(&mut self, config: &RunConfig, transport: &mut Transport) {
        let now = Local::now();
        for job in &mut self.jobs {
            if job.state.is_terminal() || job.state == JobState::Unknown {
                continue;
            }

            match check_job(transport, config.scheduler_type, &job.id.0) {
                StatusProbe::Observed(state) => {
                    job.consecutive_query_failures = 0;
                    let old_state = job.state;
                    if job.observe(state, now) {
                        log_info!("job {} ({}): {} -> {}", job.id, job.name, old_state, state);
                    }
                    if job.state == JobState::Completed
                        && config.auto_download_results
                        && !job.downloaded
                    {
                        download_results(config, transport, job);
                    }
                }
                StatusProbe::QueryFailed(reason) => {
                    job.consecutive_query_failures += 1;
                    log_warn!(
                        "status query failed for {} ({}/{}): {}",
                        job.id,
                        job.consecutive_query_failures,
                        MAX_QUERY_FAILURES,
                        reason
                    );
                    if job.consecutive_query_failures >= MAX_QUERY_FAILURES {
                        job.observe(JobState::Unknown, now);
                        job.error_message = Some(format!(
                            "marked unknown after {} consecutive query failures: {}",
                            MAX_QUERY_FAILURES, reason
                        ));
                    }
                }
            }
        }
    }

    fn record_snapshot(&mut self) {
        let mut state_counts: BTreeMap<String, usize> = BTreeMap::new();
        for job in &self.jobs {
            *state_counts.entry(job.state.to_string()).or_default() += 1;
        }
        self.history.push(MonitorSnapshot {
            timestamp: Local::now(),
            state_counts,
        });
        if self.history.len() > HISTORY_CAP {
            let drop = self.history.len() - HISTORY_KEEP;
            self.history.drain(..drop);
        }
    }

    fn sleep_until_next_poll(&self, interval: Duration) {
        let mut remaining = interval;
        // Sliced so a cancellation is noticed within a second; the cycle
        // itself still finishes before the monitor stops.
        while !remaining.is_zero() && !self.cancelled() {
            let slice = remaining.min(Duration::from_secs(1));
            std::thread::sleep(slice);
            remaining -= slice;
        }
    }

    pub fn run(&mut self, config: &RunConfig, transport: &mut Transport) -> Result<MonitorReport> {
        log_info!("monitoring {} jobs every {} s", self.jobs.len(), config.monitor_interval);

        while self.has_active_jobs() {
            if self.cancelled() {
                log_info!("monitoring interrupted; writing final report");
                break;
            }

            self.poll_cycle(config, transport);
            self.record_snapshot();

            if !self.has_active_jobs() {
                log_info!("all jobs reached a terminal or unknown state");
                break;
            }
            self.sleep_until_next_poll(Duration::from_secs(config.monitor_interval));
        }

        let report = self.build_report();
        save_report(&report, &config.base_path)?;

        let all_unknown =
            !self.jobs.is_empty() && self.jobs.iter().all(|j| j.state == JobState::Unknown);
        if all_unknown {
            return Err(AppError::Monitor(
                "status queries failed repeatedly; every job is in an unknown state".to_string(),
            ));
        }
        Ok(report)
    }

    pub fn build_report(&self) -> MonitorReport {
        let total = self.jobs.len();
        let completed = self
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .count();
        let failed = self
            .jobs
            .iter()
            .filter(|j| {
                matches!(
                    j.state,
                    JobState::Failed | JobState::Cancelled | JobState::Timeout
                )
            })
            .count();
        let total_runtime: u64 = self.jobs.iter().map(|j| j.runtime_seconds).sum();
        let downloaded = self.jobs.iter().filter(|j| j.downloaded).count();

        MonitorReport {
            summary: MonitorSummary {
                total_jobs: total,
                completed_jobs: completed,
                failed_jobs: failed,
                success_rate: completed as f64 / total.max(1) as f64,
                total_runtime_seconds: total_runtime,
                average_runtime_seconds: total_runtime / completed.max(1) as u64,
                downloaded_results: downloaded,
                monitoring_duration_seconds: (Local::now() - self.started).num_seconds(),
            },
            jobs: self.jobs.clone(),
            history: self.history.clone(),
            generated_at: Local::now(),
        }
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }
}

fn save_report(report: &MonitorReport, base_path: &Path) -> Result<()> {
    fs_err::create_dir_all(base_path)?;
    let file_name = format!(
        "monitoring_report_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    );
    let path = base_path.join(file_name);
    fs_err::write(&path, serde_json::to_string_pretty(report)?)?;
    log_info!("monitoring report written: {}", path.display());
    log_debug!(
        "monitoring history: {} snapshots retained",
        report.history.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_slurm_states() {
        assert_eq!(parse_slurm_state("RUNNING"), JobState::Running);
        assert_eq!(parse_slurm_state("COMPLETED"), JobState::Completed);
        assert_eq!(parse_slurm_state("CANCELLED by 1001"), JobState::Cancelled);
        assert_eq!(parse_slurm_state("NODE_FAIL"), JobState::Failed);
        assert_eq!(parse_slurm_state("OUT_OF_MEMORY"), JobState::Failed);
        assert_eq!(parse_slurm_state("TIMEOUT"), JobState::Timeout);
        assert_eq!(parse_slurm_state("MYSTERY"), JobState::Unknown);
    }

    #[test]
    fn test_parse_pbs_states() {
        assert_eq!(parse_pbs_state("Q"), JobState::Pending);
        assert_eq!(parse_pbs_state("R"), JobState::Running);
        assert_eq!(parse_pbs_state("C"), JobState::Completed);
        assert_eq!(parse_pbs_state("E"), JobState::Completed);
        assert_eq!(parse_pbs_state("H"), JobState::Pending);
        assert_eq!(parse_pbs_state("X"), JobState::Unknown);
    }

    #[test]
    fn test_parse_sacct_output() {
        let output = "11122885|COMPLETED|2026-01-02T10:00:00|2026-01-02T11:00:00|0:0\n\
                      11122885.batch|COMPLETED|2026-01-02T10:00:00|2026-01-02T11:00:00|0:0\n";
        assert_eq!(parse_sacct_output(output), Some(JobState::Completed));
        assert_eq!(parse_sacct_output(""), None);
    }

    #[test]
    fn test_parse_qstat_full_output() {
        let output = "Job Id: 50197.hn\n    Job_Name = CFX_Job_2200\n    job_state = R\n";
        assert_eq!(parse_qstat_full_output(output), Some(JobState::Running));
        assert_eq!(parse_qstat_full_output("no state here"), None);
    }
}
