pub mod run;

use cfxbatch_client::inventory;
use cfxbatch_client::probe;
use cfxbatch_client::transport::{SshSession, Transport};
use cfxbatch_core::config::{default_config_yaml, RunConfig, SchedulerKind};
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::format_pressure;
use std::path::Path;

pub fn handle_detect_cfx() -> Result<()> {
    let install = probe::detect_local_cfx()?;
    println!("ANSYS CFX installation");
    println!("  version:   {}", install.version);
    println!("  cfx home:  {}", install.cfx_home.display());
    println!("  bin path:  {}", install.bin_path.display());
    println!("  cfx5pre:   {}", install.pre_exe.display());
    println!("  cfx5solve: {}", install.solve_exe.display());
    println!("  found via: {}", install.method);
    Ok(())
}

pub fn handle_create_config(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(AppError::config(
            "output path",
            format!("'{}' already exists; refusing to overwrite", path.display()),
        ));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::PathIo {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
    }
    std::fs::write(path, default_config_yaml()).map_err(|e| AppError::PathIo {
        path: path.to_path_buf(),
        source: e,
    })?;
    println!("default configuration written to {}", path.display());
    println!("edit the model, cluster, and credential values before running");
    Ok(())
}

pub fn handle_validate(path: &Path) -> Result<()> {
    let config = RunConfig::from_yaml(path)?;
    let errors = config.validate();
    if errors.is_empty() {
        println!("{}: configuration is valid", path.display());
        Ok(())
    } else {
        for error in &errors {
            println!("  - {}", error);
        }
        Err(AppError::config(
            path.display().to_string(),
            format!("{} validation errors", errors.len()),
        ))
    }
}

pub fn handle_info(path: &Path) -> Result<()> {
    let config = RunConfig::from_yaml(path)?;

    println!("=== Environment ===");
    println!("  cfx mode:       {:?}", config.cfx_mode);
    println!("  auto-detect:    {}", config.auto_detect_cfx);
    println!("  local cfx home: {}", or_dash(&config.cfx_home));
    println!("  remote cfx:     {}", or_dash(&config.remote_cfx_home));
    println!("  cfx module:     {}", or_dash(&config.cfx_module_name));

    println!("=== Project ===");
    println!("  name:        {}", config.project_name);
    println!("  base path:   {}", config.base_path.display());
    println!("  model:       {}", or_dash(&config.cfx_file_path));
    println!("  job stem:    {}", config.job_stem());
    let pressures: Vec<String> = config
        .pressure_list
        .iter()
        .map(|p| format_pressure(*p))
        .collect();
    println!(
        "  pressures:   [{}] {}",
        pressures.join(", "),
        config.pressure_unit
    );

    println!("=== Cluster ===");
    println!("  endpoint:    {}@{}:{}", config.ssh_user, config.ssh_host, config.ssh_port);
    println!("  remote path: {}", config.remote_base_path);
    println!("  type:        {}", config.cluster_type);
    println!("  scheduler:   {}", config.scheduler_type);
    match config.scheduler_type {
        SchedulerKind::Slurm => {
            println!(
                "  resources:   {} nodes x {} tasks, {}, {} (partition {})",
                config.nodes,
                config.tasks_per_node,
                config.memory_per_node,
                config.time_limit,
                config.partition
            );
        }
        SchedulerKind::Pbs => {
            println!(
                "  resources:   min {} cores, {}, walltime {} (queue {})",
                config.min_cores, config.memory, config.walltime, config.queue
            );
        }
    }

    println!("=== Policies ===");
    println!(
        "  node detection {}, allocation {} ({})",
        on_off(config.enable_node_detection),
        on_off(config.enable_node_allocation),
        config.node_allocation_strategy
    );
    println!(
        "  monitoring {} every {} s, auto-download {}",
        on_off(config.enable_monitoring),
        config.monitor_interval,
        on_off(config.auto_download_results)
    );
    Ok(())
}

pub fn handle_cluster_status(path: &Path) -> Result<()> {
    let config = RunConfig::from_yaml(path)?;
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(AppError::config("run configuration", errors.join("; ")));
    }

    let session = SshSession::connect(&config)?;
    let mut transport = Transport::new(Box::new(session), &config);

    let detected = inventory::detect_scheduler(&mut transport)?;
    println!("scheduler: {} (configured {})", detected, config.scheduler_type);

    let nodes = inventory::query_nodes(&mut transport, detected)?;
    let summary = inventory::summarize(&nodes);

    println!(
        "{} nodes, {} available ({} of {} cores free)",
        summary.total_nodes, summary.available_nodes, summary.available_cores, summary.total_cores
    );
    for (state, count) in &summary.states {
        println!("  {:12} {}", state, count);
    }
    if !summary.partitions.is_empty() {
        println!("partitions:");
        for (name, p) in &summary.partitions {
            println!(
                "  {:12} {} nodes / {} cores / {} MB",
                name, p.nodes, p.cores, p.memory_mb
            );
        }
    }

    println!();
    println!(
        "{:<12} {:>5} {:>10}  {:<12} {:<9} {}",
        "NODE", "CPUS", "MEM(MB)", "STATE", "AVAILABLE", "PARTITION"
    );
    for node in &nodes {
        println!(
            "{:<12} {:>5} {:>10}  {:<12} {:<9} {}",
            node.name,
            node.cpus,
            node.memory_mb,
            node.state.to_string(),
            if node.available { "yes" } else { "no" },
            node.partition
        );
    }

    match inventory::query_queue(&mut transport, detected) {
        Ok(jobs) => println!("\n{} jobs in the queue", jobs.len()),
        Err(e) => println!("\nqueue status unavailable: {}", e),
    }

    transport.close()?;
    Ok(())
}

fn or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}
