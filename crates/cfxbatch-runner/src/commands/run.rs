use crate::cli::RunArgs;
use cfxbatch_client::workflow::{Step, Workflow};
use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::Result;
use cfxbatch_core::{log_info, log_warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub fn handle_run(args: RunArgs) -> Result<()> {
    let mut config = RunConfig::from_yaml(&args.config)?;
    if !args.pressure_list.is_empty() {
        log_info!(
            "pressure list overridden on the command line ({} values)",
            args.pressure_list.len()
        );
        config.pressure_list = args.pressure_list.clone();
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        if let Err(e) = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
        }) {
            log_warn!("interrupt handler unavailable: {}", e);
        }
    }

    let mut workflow = Workflow::new(config, cancel)?;

    let report = if args.steps.is_empty() {
        workflow.run(args.dry_run)?
    } else {
        let steps = args
            .steps
            .iter()
            .map(|s| s.parse::<Step>())
            .collect::<Result<Vec<Step>>>()?;
        workflow.run_steps(&steps)?
    };

    let summary = &report.execution_summary;
    println!(
        "run finished in {} s: {} jobs planned, {} submitted",
        summary.execution_duration_seconds, summary.total_jobs, summary.successful_submissions
    );
    println!("completed steps: [{}]", summary.completed_steps.join(", "));
    if !summary.failed_steps.is_empty() {
        println!("failed steps:    [{}]", summary.failed_steps.join(", "));
    }
    if let Some(monitor) = &report.monitoring_report {
        println!(
            "jobs: {} completed, {} failed, {} results downloaded",
            monitor.summary.completed_jobs,
            monitor.summary.failed_jobs,
            monitor.summary.downloaded_results
        );
    }
    Ok(())
}
