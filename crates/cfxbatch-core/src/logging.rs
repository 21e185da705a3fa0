use crate::error::AppError;
use chrono::Local;
use once_cell::sync::Lazy;
use std::env;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = AppError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            other => Err(AppError::config(
                "log_level",
                format!("unrecognized level '{}'", other),
            )),
        }
    }
}

static VERBOSITY: AtomicUsize = AtomicUsize::new(LogLevel::Info as usize);

/// None routes to stderr; init_logger swaps in an append-mode file.
static LOG_SINK: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));

pub fn set_log_level(level: LogLevel) {
    VERBOSITY.store(level as usize, Ordering::Relaxed);
}

pub fn set_log_level_from_env() {
    if let Ok(value) = env::var("CFXBATCH_LOG_LEVEL") {
        if let Ok(level) = value.parse::<LogLevel>() {
            set_log_level(level);
        }
    }
}

pub fn level_enabled(level: LogLevel) -> bool {
    level as usize <= VERBOSITY.load(Ordering::Relaxed)
}

/// Route log output to `log_path` in append mode. Without this, messages
/// go to stderr.
pub fn init_logger(log_path: &Path) -> Result<(), AppError> {
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    writeln!(
        file,
        "[{}] [INFO] logging to {}",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        log_path.display()
    )?;

    if let Ok(mut sink) = LOG_SINK.lock() {
        *sink = Some(file);
    }
    Ok(())
}

/// Sink for the level macros. The gate lives here so the macros stay
/// one-liners; `format_args!` defers formatting until the line is built.
pub fn emit(level: LogLevel, message: fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }

    let line = format!(
        "[{}] [{}] {}\n",
        Local::now().format("%Y-%m-%d %H:%M:%S"),
        level.tag(),
        message
    );

    let mut sink = match LOG_SINK.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    match sink.as_mut() {
        Some(file) => {
            let _ = file.write_all(line.as_bytes());
        }
        None => eprint!("{}", line),
    }
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => {
        $crate::logging::emit($crate::logging::LogLevel::Error, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => {
        $crate::logging::emit($crate::logging::LogLevel::Warn, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => {
        $crate::logging::emit($crate::logging::LogLevel::Info, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => {
        $crate::logging::emit($crate::logging::LogLevel::Debug, format_args!($($arg)+))
    };
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)+) => {
        $crate::logging::emit($crate::logging::LogLevel::Trace, format_args!($($arg)+))
    };
}

/// Render a subprocess invocation for the debug log, quoting arguments
/// the shell would otherwise split.
pub fn command_line(command: &Command) -> String {
    let mut rendered = command.get_program().to_string_lossy().into_owned();
    for arg in command.get_args() {
        let arg = arg.to_string_lossy();
        rendered.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            rendered.push('\'');
            rendered.push_str(&arg);
            rendered.push('\'');
        } else {
            rendered.push_str(&arg);
        }
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_level_gate_orders_by_severity() {
        set_log_level(LogLevel::Warn);
        assert!(level_enabled(LogLevel::Error));
        assert!(level_enabled(LogLevel::Warn));
        assert!(!level_enabled(LogLevel::Debug));
        set_log_level(LogLevel::Info);
    }

    #[test]
    fn test_command_line_rendering() {
        let mut cmd = Command::new("ssh");
        cmd.arg("cluster").arg("mkdir -p /scratch/run").arg("");
        assert_eq!(
            command_line(&cmd),
            "ssh cluster 'mkdir -p /scratch/run' ''"
        );
    }
}
