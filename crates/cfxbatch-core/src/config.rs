use crate::error::{AppError, Result};
use crate::model::{format_pressure, Case};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Where the `.def` files are produced: on this machine or on the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CfxMode {
    Local,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[serde(rename = "SLURM")]
    Slurm,
    #[serde(rename = "PBS")]
    Pbs,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerKind::Slurm => write!(f, "SLURM"),
            SchedulerKind::Pbs => write!(f, "PBS"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    University,
    GroupNew,
    GroupOld,
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterKind::University => write!(f, "university"),
            ClusterKind::GroupNew => write!(f, "group_new"),
            ClusterKind::GroupOld => write!(f, "group_old"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementStrategy {
    BatchAllocation,
    NodeReuse,
    SmartQueue,
    Hybrid,
}

impl fmt::Display for PlacementStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementStrategy::BatchAllocation => write!(f, "batch_allocation"),
            PlacementStrategy::NodeReuse => write!(f, "node_reuse"),
            PlacementStrategy::SmartQueue => write!(f, "smart_queue"),
            PlacementStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// How the PBS nodes-spec emitter packs a single job onto nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PbsAllocationMode {
    SingleNode,
    MultiNode,
    Hybrid,
    Auto,
}

fn default_cfx_mode() -> CfxMode {
    CfxMode::Local
}
fn default_true() -> bool {
    true
}
fn default_project_name() -> String {
    "CFX_Project".to_string()
}
fn default_job_name() -> String {
    "CFX_Job".to_string()
}
fn default_base_path() -> PathBuf {
    PathBuf::from(".")
}
fn default_folder_prefix() -> String {
    "P_Out_".to_string()
}
fn default_pressure_unit() -> String {
    "Pa".to_string()
}
fn default_flow_analysis_name() -> String {
    "Flow Analysis 1".to_string()
}
fn default_domain_name() -> String {
    "S1".to_string()
}
fn default_outlet_boundary_name() -> String {
    "S1 Outlet".to_string()
}
fn default_outlet_location() -> String {
    "R2_OUTFLOW".to_string()
}
fn default_pressure_blend() -> String {
    "0.05".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_retry_times() -> u32 {
    3
}
fn default_transfer_timeout() -> u64 {
    300
}
fn default_cluster_type() -> ClusterKind {
    ClusterKind::University
}
fn default_scheduler_type() -> SchedulerKind {
    SchedulerKind::Slurm
}
fn default_partition() -> String {
    "cpu-low".to_string()
}
fn default_queue() -> String {
    "batch".to_string()
}
fn default_nodes() -> u32 {
    1
}
fn default_tasks_per_node() -> u32 {
    32
}
fn default_time_limit() -> String {
    "7-00:00:00".to_string()
}
fn default_walltime() -> String {
    "24:00:00".to_string()
}
fn default_memory_per_node() -> String {
    "64GB".to_string()
}
fn default_memory() -> String {
    "32GB".to_string()
}
fn default_min_cores() -> u32 {
    28
}
fn default_ppn() -> u32 {
    16
}
fn default_email_events() -> String {
    "abe".to_string()
}
fn default_strategy() -> PlacementStrategy {
    PlacementStrategy::Hybrid
}
fn default_pbs_mode() -> PbsAllocationMode {
    PbsAllocationMode::Hybrid
}
fn default_max_concurrent_jobs() -> u32 {
    5
}
fn default_max_queue_jobs() -> u32 {
    10
}
fn default_monitor_interval() -> u64 {
    60
}
fn default_result_patterns() -> Vec<String> {
    vec![
        "*.res".to_string(),
        "*.out".to_string(),
        "*.log".to_string(),
        "*.err".to_string(),
    ]
}
fn default_job_submit_delay() -> u64 {
    2
}

/// The immutable description of one batch run, loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    // CFX environment
    #[serde(default = "default_cfx_mode")]
    pub cfx_mode: CfxMode,
    pub cfx_home: String,
    pub cfx_bin_path: String,
    pub remote_cfx_home: String,
    pub remote_cfx_bin_path: String,
    #[serde(default = "default_true")]
    pub auto_detect_cfx: bool,
    pub skip_cfx_verification: bool,
    pub cfx_module_name: String,

    // Project / case naming
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_job_name")]
    pub job_name: String,
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,
    pub cfx_file_path: String,
    pub initial_file: Option<String>,
    #[serde(default = "default_folder_prefix")]
    pub folder_prefix: String,
    pub def_file_prefix: String,
    pub pressure_list: Vec<f64>,
    #[serde(default = "default_pressure_unit")]
    pub pressure_unit: String,

    // CFX model knobs, forwarded verbatim to the session template
    #[serde(default = "default_flow_analysis_name")]
    pub flow_analysis_name: String,
    #[serde(default = "default_domain_name")]
    pub domain_name: String,
    #[serde(default = "default_outlet_boundary_name")]
    pub outlet_boundary_name: String,
    #[serde(default = "default_outlet_location")]
    pub outlet_location: String,
    #[serde(default = "default_pressure_blend")]
    pub pressure_blend: String,

    // Transport
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password: Option<String>,
    pub ssh_key: Option<String>,
    pub remote_base_path: String,
    #[serde(default = "default_retry_times")]
    pub transfer_retry_times: u32,
    /// Per remote operation, seconds.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout: u64,
    #[serde(default = "default_true")]
    pub enable_checksum_verification: bool,

    // Cluster / scheduler
    #[serde(default = "default_cluster_type")]
    pub cluster_type: ClusterKind,
    #[serde(default = "default_scheduler_type")]
    pub scheduler_type: SchedulerKind,
    #[serde(default = "default_partition")]
    pub partition: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_nodes")]
    pub nodes: u32,
    #[serde(default = "default_tasks_per_node")]
    pub tasks_per_node: u32,
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
    #[serde(default = "default_walltime")]
    pub walltime: String,
    #[serde(default = "default_memory_per_node")]
    pub memory_per_node: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    pub qos: String,
    /// PBS multi-node request literal, e.g. `n41:ppn=28+n42:ppn=28`.
    pub nodes_spec: String,
    #[serde(default = "default_min_cores")]
    pub min_cores: u32,
    #[serde(default = "default_ppn")]
    pub ppn: u32,
    pub email: String,
    #[serde(default = "default_email_events")]
    pub email_events: String,

    // Placement
    #[serde(default = "default_true")]
    pub enable_node_detection: bool,
    #[serde(default = "default_true")]
    pub enable_node_allocation: bool,
    #[serde(default = "default_strategy")]
    pub node_allocation_strategy: PlacementStrategy,
    #[serde(default = "default_pbs_mode")]
    pub pbs_allocation_mode: PbsAllocationMode,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,
    #[serde(default = "default_max_queue_jobs")]
    pub max_queue_jobs: u32,
    /// Comma-separated node names never to place on.
    pub exclude_nodes: String,
    pub nodelist: String,

    // Monitoring
    #[serde(default = "default_true")]
    pub enable_monitoring: bool,
    /// Seconds between status polls.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: u64,
    #[serde(default = "default_true")]
    pub auto_download_results: bool,
    pub cleanup_remote_files: bool,
    #[serde(default = "default_result_patterns")]
    pub result_file_patterns: Vec<String>,
    /// Seconds between consecutive submissions in the driver script.
    #[serde(default = "default_job_submit_delay")]
    pub job_submit_delay: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            cfx_mode: default_cfx_mode(),
            cfx_home: String::new(),
            cfx_bin_path: String::new(),
            remote_cfx_home: String::new(),
            remote_cfx_bin_path: String::new(),
            auto_detect_cfx: true,
            skip_cfx_verification: false,
            cfx_module_name: String::new(),
            project_name: default_project_name(),
            job_name: default_job_name(),
            base_path: default_base_path(),
            cfx_file_path: String::new(),
            initial_file: None,
            folder_prefix: default_folder_prefix(),
            def_file_prefix: String::new(),
            pressure_list: Vec::new(),
            pressure_unit: default_pressure_unit(),
            flow_analysis_name: default_flow_analysis_name(),
            domain_name: default_domain_name(),
            outlet_boundary_name: default_outlet_boundary_name(),
            outlet_location: default_outlet_location(),
            pressure_blend: default_pressure_blend(),
            ssh_host: String::new(),
            ssh_port: default_ssh_port(),
            ssh_user: String::new(),
            ssh_password: None,
            ssh_key: None,
            remote_base_path: String::new(),
            transfer_retry_times: default_retry_times(),
            transfer_timeout: default_transfer_timeout(),
            enable_checksum_verification: true,
            cluster_type: default_cluster_type(),
            scheduler_type: default_scheduler_type(),
            partition: default_partition(),
            queue: default_queue(),
            nodes: default_nodes(),
            tasks_per_node: default_tasks_per_node(),
            time_limit: default_time_limit(),
            walltime: default_walltime(),
            memory_per_node: default_memory_per_node(),
            memory: default_memory(),
            qos: String::new(),
            nodes_spec: String::new(),
            min_cores: default_min_cores(),
            ppn: default_ppn(),
            email: String::new(),
            email_events: default_email_events(),
            enable_node_detection: true,
            enable_node_allocation: true,
            node_allocation_strategy: default_strategy(),
            pbs_allocation_mode: default_pbs_mode(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_queue_jobs: default_max_queue_jobs(),
            exclude_nodes: String::new(),
            nodelist: String::new(),
            enable_monitoring: true,
            monitor_interval: default_monitor_interval(),
            auto_download_results: true,
            cleanup_remote_files: false,
            result_file_patterns: default_result_patterns(),
            job_submit_delay: default_job_submit_delay(),
        }
    }
}

impl RunConfig {
    pub fn from_yaml(path: &Path) -> Result<RunConfig> {
        let content = fs::read_to_string(path).map_err(|e| AppError::PathIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config: RunConfig = serde_yaml::from_str(&content)?;
        config.expand_paths();
        Ok(config)
    }

    pub fn to_yaml(&self, path: &Path) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(AppError::Yaml)?;
        fs::write(path, content).map_err(|e| AppError::PathIo {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(())
    }

    fn expand_paths(&mut self) {
        let base = shellexpand::tilde(&self.base_path.display().to_string()).into_owned();
        self.base_path = PathBuf::from(base);
        if !self.cfx_file_path.is_empty() {
            self.cfx_file_path = shellexpand::tilde(&self.cfx_file_path).into_owned();
        }
        if let Some(initial) = &self.initial_file {
            self.initial_file = Some(shellexpand::tilde(initial).into_owned());
        }
        if let Some(key) = &self.ssh_key {
            self.ssh_key = Some(shellexpand::tilde(key).into_owned());
        }
    }

    /// Collect every validation failure, one human-readable line each.
    /// An empty vector means the configuration can start a pipeline.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.ssh_host.is_empty() {
            errors.push("ssh_host: required".to_string());
        }
        if self.ssh_user.is_empty() {
            errors.push("ssh_user: required".to_string());
        }
        if self.remote_base_path.is_empty() {
            errors.push("remote_base_path: required".to_string());
        }

        let has_password = self.ssh_password.as_deref().is_some_and(|p| !p.is_empty());
        let has_key = self.ssh_key.as_deref().is_some_and(|k| !k.is_empty());
        match (has_password, has_key) {
            (false, false) => {
                errors.push("ssh_password/ssh_key: exactly one authentication method is required".to_string());
            }
            (true, true) => {
                errors.push("ssh_password/ssh_key: mutually exclusive, configure only one".to_string());
            }
            _ => {}
        }

        if self.pressure_list.is_empty() {
            errors.push("pressure_list: at least one back-pressure value is required".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.pressure_list {
            if !seen.insert(format_pressure(*p)) {
                errors.push(format!(
                    "pressure_list: duplicate value {}",
                    format_pressure(*p)
                ));
            }
        }

        if self.cfx_file_path.is_empty() {
            errors.push("cfx_file_path: required".to_string());
        }
        if self.tasks_per_node == 0 {
            errors.push("tasks_per_node: must be at least 1".to_string());
        }
        if self.nodes == 0 {
            errors.push("nodes: must be at least 1".to_string());
        }
        if self.min_cores == 0 {
            errors.push("min_cores: must be at least 1".to_string());
        }
        if self.monitor_interval == 0 {
            errors.push("monitor_interval: must be at least 1 second".to_string());
        }

        errors
    }

    /// Job-name stem with any trailing underscore trimmed, so the pressure
    /// suffix joins with exactly one separator.
    pub fn job_stem(&self) -> &str {
        self.job_name.trim_end_matches('_')
    }

    pub fn job_name_for(&self, pressure: f64) -> String {
        format!("{}_{}", self.job_stem(), format_pressure(pressure))
    }

    pub fn folder_for(&self, pressure: f64) -> String {
        format!("{}{}", self.folder_prefix, format_pressure(pressure))
    }

    pub fn def_file_for(&self, pressure: f64) -> String {
        format!("{}{}.def", self.def_file_prefix, format_pressure(pressure))
    }

    /// Expand the pressure list into ordered cases.
    pub fn cases(&self) -> Vec<Case> {
        let initial = self.initial_file.as_ref().map(|p| {
            Path::new(p)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| p.clone())
        });
        self.pressure_list
            .iter()
            .map(|&p| Case {
                pressure: p,
                pressure_unit: self.pressure_unit.clone(),
                folder_name: self.folder_for(p),
                def_file_name: self.def_file_for(p),
                job_name: self.job_name_for(p),
                initial_file: initial.clone(),
            })
            .collect()
    }

    pub fn local_cfx_executable(&self, name: &str) -> PathBuf {
        if !self.cfx_bin_path.is_empty() {
            Path::new(&self.cfx_bin_path).join(name)
        } else if !self.cfx_home.is_empty() {
            Path::new(&self.cfx_home).join("bin").join(name)
        } else {
            PathBuf::from(name)
        }
    }

    pub fn remote_cfx_executable(&self, name: &str) -> String {
        if !self.remote_cfx_bin_path.is_empty() {
            format!("{}/{}", self.remote_cfx_bin_path.trim_end_matches('/'), name)
        } else if !self.remote_cfx_home.is_empty() {
            format!("{}/bin/{}", self.remote_cfx_home.trim_end_matches('/'), name)
        } else {
            name.to_string()
        }
    }
}

/// Commented template written by `cfxbatch create-config`.
pub fn default_config_yaml() -> &'static str {
    r#"# cfxbatch run configuration.
# Edit the values below for your model, cluster, and credentials.

# --- CFX environment ---
# "local": .def files are produced on this machine with CFX-Pre.
# "server": the session script and .cfx model are uploaded and CFX-Pre runs
# on the cluster.
cfx_mode: local
auto_detect_cfx: true
cfx_home: ""
cfx_bin_path: ""
remote_cfx_home: "/opt/ansys_inc/v221/CFX"
remote_cfx_bin_path: "/opt/ansys_inc/v221/CFX/bin"
# Clusters with an environment-module system load CFX instead of installing
# it at a fixed path; name the module and skip the remote binary check.
skip_cfx_verification: false
cfx_module_name: ""

# --- Project and cases ---
project_name: CFX_Project
job_name: CFX_Job
base_path: "."
cfx_file_path: "model.cfx"
# Optional restart file copied into every case folder.
# initial_file: "steady_state.res"
folder_prefix: "P_Out_"
def_file_prefix: ""
pressure_list: [2187, 2189]
pressure_unit: Pa

# --- CFX model knobs (forwarded to the session template) ---
flow_analysis_name: "Flow Analysis 1"
domain_name: "S1"
outlet_boundary_name: "S1 Outlet"
outlet_location: "R2_OUTFLOW"
pressure_blend: "0.05"

# --- Transport ---
ssh_host: "cluster.example.com"
ssh_port: 22
ssh_user: "username"
# Exactly one of ssh_password / ssh_key.
ssh_password: ""
ssh_key: "~/.ssh/id_rsa"
remote_base_path: "/home/username/CFX_Jobs"
transfer_retry_times: 3
transfer_timeout: 300
enable_checksum_verification: true

# --- Cluster / scheduler ---
cluster_type: university        # university | group_new | group_old
scheduler_type: SLURM           # SLURM | PBS
partition: cpu-low
queue: batch
nodes: 1
tasks_per_node: 32
time_limit: "7-00:00:00"
walltime: "24:00:00"
memory_per_node: 64GB
memory: 32GB
qos: ""
nodes_spec: ""
min_cores: 28
ppn: 16
email: ""
email_events: abe

# --- Placement ---
enable_node_detection: true
enable_node_allocation: true
node_allocation_strategy: hybrid  # batch_allocation | node_reuse | smart_queue | hybrid
pbs_allocation_mode: hybrid       # single_node | multi_node | hybrid | auto
max_concurrent_jobs: 5
max_queue_jobs: 10
exclude_nodes: ""
nodelist: ""

# --- Monitoring ---
enable_monitoring: true
monitor_interval: 60
auto_download_results: true
cleanup_remote_files: false
result_file_patterns: ["*.res", "*.out", "*.log", "*.err"]
job_submit_delay: 2
"#
}
