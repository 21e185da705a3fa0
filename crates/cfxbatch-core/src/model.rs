use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Scheduler-assigned job identifier (`11122885`, `50197.hn`, ...).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        JobId(s)
    }
}

impl FromStr for JobId {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(JobId(s.to_string()))
    }
}

/// Render a back-pressure value the way it appears in folder and file names:
/// integral values print without a fractional part (`2187`, not `2187.0`).
pub fn format_pressure(pressure: f64) -> String {
    if pressure.fract() == 0.0 && pressure.abs() < 1e15 {
        format!("{}", pressure as i64)
    } else {
        format!("{}", pressure)
    }
}

/// One parametric run tied to a single back-pressure value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub pressure: f64,
    pub pressure_unit: String,
    /// `{folder_prefix}{pressure}`
    pub folder_name: String,
    /// `{def_prefix}{pressure}.def`
    pub def_file_name: String,
    /// `{job_stem}_{pressure}`
    pub job_name: String,
    /// Basename of the restart file staged into the case folder, if any.
    pub initial_file: Option<String>,
}

impl Case {
    /// CFX writes `{def_stem}_001.res` next to the def file.
    pub fn result_file_name(&self) -> String {
        let stem = self
            .def_file_name
            .strip_suffix(".def")
            .unwrap_or(&self.def_file_name);
        format!("{}_001.res", stem)
    }
}

/// Normalized node state across scheduler dialects.
///
/// The union of both dialect tables: SLURM contributes idle/allocated/mixed/
/// completing/draining/down/reserved, PBS adds busy and offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Idle,
    Allocated,
    Mixed,
    Busy,
    Down,
    Offline,
    Draining,
    Completing,
    Reserved,
    Unknown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Idle => "idle",
            NodeState::Allocated => "allocated",
            NodeState::Mixed => "mixed",
            NodeState::Busy => "busy",
            NodeState::Down => "down",
            NodeState::Offline => "offline",
            NodeState::Draining => "draining",
            NodeState::Completing => "completing",
            NodeState::Reserved => "reserved",
            NodeState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One cluster node, normalized from `sinfo` or `pbsnodes` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    /// The dialect's own state token, kept for diagnostics.
    pub raw_state: String,
    pub state: NodeState,
    /// True only for idle-like states (SLURM idle|mix, PBS free).
    pub available: bool,
    pub partition: String,
    pub features: String,
    pub query_time: DateTime<Local>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Unknown,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Timeout
        )
    }

    /// Pending and running jobs keep the monitor loop alive.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::Timeout => "timeout",
            JobState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle record of one submitted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub pressure: Option<f64>,
    pub case_folder: Option<String>,
    pub state: JobState,
    pub submitted_at: Option<DateTime<Local>>,
    pub started_at: Option<DateTime<Local>>,
    pub ended_at: Option<DateTime<Local>>,
    pub runtime_seconds: u64,
    pub downloaded: bool,
    pub result_files: Vec<PathBuf>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub consecutive_query_failures: u32,
}

impl JobRecord {
    pub fn new(id: JobId, name: String) -> Self {
        JobRecord {
            id,
            name,
            pressure: None,
            case_folder: None,
            state: JobState::Pending,
            submitted_at: Some(Local::now()),
            started_at: None,
            ended_at: None,
            runtime_seconds: 0,
            downloaded: false,
            result_files: Vec::new(),
            error_message: None,
            consecutive_query_failures: 0,
        }
    }

    /// Apply a state observation. Transitions are monotone forward: once a
    /// terminal state is recorded later observations are ignored, and a
    /// running job never drops back to pending.
    pub fn observe(&mut self, new_state: JobState, now: DateTime<Local>) -> bool {
        if self.state.is_terminal() || new_state == self.state {
            return false;
        }
        if self.state == JobState::Running && new_state == JobState::Pending {
            return false;
        }

        self.state = new_state;

        if new_state == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        if new_state.is_terminal() {
            if self.ended_at.is_none() {
                self.ended_at = Some(now);
            }
            if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
                self.runtime_seconds = (end - start).num_seconds().max(0) as u64;
            }
        }

        true
    }
}

/// Transfer counters aggregated over a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferStats {
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    pub bytes_uploaded: u64,
    pub bytes_downloaded: u64,
    pub failures: u64,
}

impl TransferStats {
    pub fn record_upload(&mut self, bytes: u64) {
        self.files_uploaded += 1;
        self.bytes_uploaded += bytes;
    }

    pub fn record_download(&mut self, bytes: u64) {
        self.files_downloaded += 1;
        self.bytes_downloaded += bytes;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pressure_integral() {
        assert_eq!(format_pressure(2187.0), "2187");
        assert_eq!(format_pressure(2300.0), "2300");
    }

    #[test]
    fn test_format_pressure_fractional() {
        assert_eq!(format_pressure(2187.5), "2187.5");
    }

    #[test]
    fn test_result_file_name_from_def_stem() {
        let case = Case {
            pressure: 2187.0,
            pressure_unit: "Pa".into(),
            folder_name: "P_Out_2187".into(),
            def_file_name: "2187.def".into(),
            job_name: "CFX_Job_2187".into(),
            initial_file: None,
        };
        assert_eq!(case.result_file_name(), "2187_001.res");
    }

    #[test]
    fn test_job_record_transitions_are_monotone() {
        let now = Local::now();
        let mut job = JobRecord::new(JobId("101".into()), "CFX_Job_2187".into());
        assert!(job.observe(JobState::Running, now));
        assert_eq!(job.started_at, Some(now));

        assert!(job.observe(JobState::Completed, now));
        assert!(job.state.is_terminal());

        // Terminal states never roll back.
        assert!(!job.observe(JobState::Running, now));
        assert_eq!(job.state, JobState::Completed);
    }

    #[test]
    fn test_running_job_never_regresses_to_pending() {
        let now = Local::now();
        let mut job = JobRecord::new(JobId("55".into()), "j".into());
        job.observe(JobState::Running, now);
        assert!(!job.observe(JobState::Pending, now));
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn test_job_record_runtime() {
        let start = Local::now();
        let end = start + chrono::Duration::seconds(90);
        let mut job = JobRecord::new(JobId("7".into()), "j".into());
        job.observe(JobState::Running, start);
        job.observe(JobState::Failed, end);
        assert_eq!(job.runtime_seconds, 90);
    }
}
