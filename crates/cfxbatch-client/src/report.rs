use crate::monitor::MonitorReport;
use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::Result;
use cfxbatch_core::log_info;
use cfxbatch_core::model::TransferStats;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub total_jobs: usize,
    pub successful_submissions: usize,
    pub execution_duration_seconds: i64,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationEcho {
    pub project_name: String,
    pub cfx_mode: String,
    pub cluster_type: String,
    pub scheduler_type: String,
    pub node_allocation_enabled: bool,
    pub monitoring_enabled: bool,
}

impl ConfigurationEcho {
    pub fn from_config(config: &RunConfig) -> Self {
        ConfigurationEcho {
            project_name: config.project_name.clone(),
            cfx_mode: format!("{:?}", config.cfx_mode).to_lowercase(),
            cluster_type: config.cluster_type.to_string(),
            scheduler_type: config.scheduler_type.to_string(),
            node_allocation_enabled: config.enable_node_allocation,
            monitoring_enabled: config.enable_monitoring,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratedFiles {
    pub job_scripts: Vec<String>,
    pub submit_script: String,
    pub monitor_script: String,
    pub queue_strategy: String,
}

/// The JSON document written at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub execution_summary: ExecutionSummary,
    pub configuration: ConfigurationEcho,
    pub generated_files: GeneratedFiles,
    pub transfer_statistics: TransferStats,
    pub monitoring_report: Option<MonitorReport>,
    pub report_generation_time: DateTime<Local>,
}

fn report_dir(base_path: &Path) -> Result<PathBuf> {
    let dir = base_path.join("report");
    fs_err::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn write_execution_report(report: &ExecutionReport, base_path: &Path) -> Result<PathBuf> {
    let path = report_dir(base_path)?.join(format!(
        "cfx_execution_report_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    fs_err::write(&path, serde_json::to_string_pretty(report)?)?;
    log_info!("execution report written: {}", path.display());
    Ok(path)
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step_name: String,
    pub status: String,
    pub execution_time: DateTime<Local>,
    pub detail: serde_json::Value,
}

/// Small per-step document for isolated `--steps` invocations.
pub fn write_step_report(
    base_path: &Path,
    step_name: &str,
    status: &str,
    detail: serde_json::Value,
) -> Result<PathBuf> {
    let report = StepReport {
        step_name: step_name.to_string(),
        status: status.to_string(),
        execution_time: Local::now(),
        detail,
    };
    let path = report_dir(base_path)?.join(format!(
        "step_{}_report_{}.json",
        step_name,
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    fs_err::write(&path, serde_json::to_string_pretty(&report)?)?;
    log_info!("step report written: {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_land_under_base_path_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = ExecutionReport {
            execution_summary: ExecutionSummary {
                total_jobs: 2,
                successful_submissions: 2,
                execution_duration_seconds: 10,
                completed_steps: vec!["connect_server".into()],
                failed_steps: vec![],
                start_time: Local::now(),
                end_time: Some(Local::now()),
            },
            configuration: ConfigurationEcho::from_config(&RunConfig::default()),
            generated_files: GeneratedFiles::default(),
            transfer_statistics: TransferStats::default(),
            monitoring_report: None,
            report_generation_time: Local::now(),
        };
        let path = write_execution_report(&report, dir.path()).unwrap();
        assert!(path.starts_with(dir.path().join("report")));
        let content = fs_err::read_to_string(path).unwrap();
        assert!(content.contains("\"total_jobs\": 2"));
    }

    #[test]
    fn test_step_report_carries_detail() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_step_report(
            dir.path(),
            "query_cluster",
            "completed",
            serde_json::json!({"nodes": 7}),
        )
        .unwrap();
        let content = fs_err::read_to_string(path).unwrap();
        assert!(content.contains("query_cluster"));
        assert!(content.contains("\"nodes\": 7"));
    }
}
