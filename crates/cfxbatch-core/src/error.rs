use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on path '{path}': {source}")]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to serialize JSON report: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: '{key}': {reason}")]
    Config { key: String, reason: String },

    #[error("CFX environment not found: {0}")]
    EnvNotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Failed to launch required command '{command_name}': {source}")]
    ProcessLaunchFailed {
        command_name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Case generation failed: {0}")]
    Generation(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Placement error: {0}")]
    Placement(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Workflow step '{step}' failed: {source}")]
    Workflow {
        step: String,
        #[source]
        source: Box<AppError>,
    },

    #[error("Unknown workflow step '{0}'. Valid steps: connect_server, verify_cfx, generate_pre, generate_def, query_cluster, generate_scripts, upload_files, submit_jobs, monitor_jobs")]
    UnknownStep(String),

    #[error("Operation aborted by user.")]
    UserAborted,
}

impl AppError {
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
