use crate::transport::Transport;
use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::{log_debug, log_info};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// How a local CFX installation was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMethod {
    Registry,
    Environment,
    ConventionalPath,
    PathLookup,
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionMethod::Registry => write!(f, "Windows registry"),
            DetectionMethod::Environment => write!(f, "environment variable"),
            DetectionMethod::ConventionalPath => write!(f, "conventional install root"),
            DetectionMethod::PathLookup => write!(f, "PATH lookup"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CfxInstall {
    pub cfx_home: PathBuf,
    pub bin_path: PathBuf,
    pub pre_exe: PathBuf,
    pub solve_exe: PathBuf,
    pub version: String,
    pub method: DetectionMethod,
}

const ENV_VARS: [&str; 4] = ["ANSYS_ROOT", "CFX_HOME", "ANSYSROOT", "ANSYS_INC_ROOT"];

#[cfg(windows)]
const CONVENTIONAL_ROOTS: [&str; 3] = [
    r"C:\Program Files\ANSYS Inc",
    r"C:\Program Files (x86)\ANSYS Inc",
    r"D:\ANSYS Inc",
];

#[cfg(not(windows))]
const CONVENTIONAL_ROOTS: [&str; 4] = [
    "/usr/ansys_inc",
    "/opt/ansys_inc",
    "/usr/local/ansys_inc",
    "/ansys_inc",
];

fn exe_name(base: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", base)
    } else {
        base.to_string()
    }
}

/// `v221` directory component -> `22.1`.
fn version_from_path(path: &Path) -> String {
    for component in path.components() {
        let name = component.as_os_str().to_string_lossy();
        if let Some(digits) = name.strip_prefix('v') {
            if digits.len() >= 3 && digits.chars().all(|c| c.is_ascii_digit()) {
                return format!("{}.{}", &digits[..2], &digits[2..]);
            }
        }
    }
    "unknown".to_string()
}

fn install_from_home(home: &Path, method: DetectionMethod) -> Option<CfxInstall> {
    let bin_path = home.join("bin");
    let pre_exe = bin_path.join(exe_name("cfx5pre"));
    let solve_exe = bin_path.join(exe_name("cfx5solve"));
    if pre_exe.exists() && solve_exe.exists() {
        Some(CfxInstall {
            cfx_home: home.to_path_buf(),
            bin_path,
            pre_exe,
            solve_exe,
            version: version_from_path(home),
            method,
        })
    } else {
        None
    }
}

/// ANSYS installers record their versions under `SOFTWARE\ANSYS Inc`
/// (or its WOW6432Node alias); `InstallDir` points at the version root
/// holding the `CFX` directory.
#[cfg(windows)]
fn detect_from_registry() -> Option<CfxInstall> {
    use winreg::enums::HKEY_LOCAL_MACHINE;
    use winreg::RegKey;

    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    for root in [r"SOFTWARE\ANSYS Inc", r"SOFTWARE\WOW6432Node\ANSYS Inc"] {
        let Ok(ansys) = hklm.open_subkey(root) else {
            continue;
        };
        let mut versions: Vec<String> = ansys.enum_keys().filter_map(|k| k.ok()).collect();
        // Newest installation first.
        versions.sort();
        versions.reverse();

        for version in versions {
            let Ok(entry) = ansys.open_subkey(&version) else {
                continue;
            };
            let Ok(install_dir) = entry.get_value::<String, _>("InstallDir") else {
                continue;
            };
            let home = Path::new(&install_dir).join("CFX");
            if let Some(install) = install_from_home(&home, DetectionMethod::Registry) {
                log_debug!("CFX found via registry {}\\{}", root, version);
                return Some(install);
            }
        }
    }
    None
}

#[cfg(not(windows))]
fn detect_from_registry() -> Option<CfxInstall> {
    None
}

fn detect_from_env() -> Option<CfxInstall> {
    for var in ENV_VARS {
        if let Ok(value) = env::var(var) {
            if value.is_empty() {
                continue;
            }
            let base = PathBuf::from(&value);
            for candidate in [base.clone(), base.join("CFX")] {
                if let Some(install) = install_from_home(&candidate, DetectionMethod::Environment)
                {
                    log_debug!("CFX found via ${}: {}", var, candidate.display());
                    return Some(install);
                }
            }
        }
    }
    None
}

fn detect_from_conventional_roots() -> Option<CfxInstall> {
    for root in CONVENTIONAL_ROOTS {
        let root = Path::new(root);
        if !root.exists() {
            continue;
        }
        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        let mut version_dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| {
                            n.starts_with('v') && n[1..].chars().all(|c| c.is_ascii_digit())
                        })
            })
            .collect();
        // Newest installation first.
        version_dirs.sort();
        version_dirs.reverse();

        for version_dir in version_dirs {
            if let Some(install) =
                install_from_home(&version_dir.join("CFX"), DetectionMethod::ConventionalPath)
            {
                return Some(install);
            }
        }
    }
    None
}

fn detect_from_path() -> Option<CfxInstall> {
    let path_var = env::var_os("PATH")?;
    for dir in env::split_paths(&path_var) {
        if dir.join(exe_name("cfx5pre")).exists() && dir.join(exe_name("cfx5solve")).exists() {
            let home = dir.parent().unwrap_or(&dir).to_path_buf();
            return Some(CfxInstall {
                cfx_home: home.clone(),
                bin_path: dir.clone(),
                pre_exe: dir.join(exe_name("cfx5pre")),
                solve_exe: dir.join(exe_name("cfx5solve")),
                version: version_from_path(&home),
                method: DetectionMethod::PathLookup,
            });
        }
    }
    None
}

/// Discover a local ANSYS CFX installation: the Windows registry (a
/// no-op elsewhere), then environment variables, conventional install
/// roots, and finally PATH.
pub fn detect_local_cfx() -> Result<CfxInstall> {
    if let Some(install) = detect_from_registry()
        .or_else(detect_from_env)
        .or_else(detect_from_conventional_roots)
        .or_else(detect_from_path)
    {
        log_info!(
            "detected CFX {} at {} ({})",
            install.version,
            install.cfx_home.display(),
            install.method
        );
        return Ok(install);
    }

    Err(AppError::EnvNotFound(format!(
        "ANSYS CFX was not found via the registry, {}, conventional install roots, or PATH",
        ENV_VARS.join("/")
    )))
}

/// Resolve the local CFX-Pre executable: configured paths first, detection
/// as a fallback when `auto_detect_cfx` is on.
pub fn resolve_local_pre_executable(config: &RunConfig) -> Result<PathBuf> {
    let configured = config.local_cfx_executable(&exe_name("cfx5pre"));
    if configured.exists() {
        return Ok(configured);
    }
    if config.auto_detect_cfx {
        return Ok(detect_local_cfx()?.pre_exe);
    }
    Err(AppError::EnvNotFound(format!(
        "local CFX-Pre not found at {} and auto_detect_cfx is disabled",
        configured.display()
    )))
}

/// Probe the cluster for CFX binaries: `test -x` on the configured paths,
/// then `which`. Returns the executables that were found.
pub fn verify_remote_cfx(
    transport: &mut Transport,
    config: &RunConfig,
) -> Result<Vec<(String, String)>> {
    let mut found = Vec::new();

    for exe in ["cfx5pre", "cfx5solve"] {
        let configured = config.remote_cfx_executable(exe);
        let check = transport.exec(&format!("test -x '{}' && echo FOUND", configured))?;
        if check.success() && check.stdout.trim() == "FOUND" {
            log_debug!("remote {} at {}", exe, configured);
            found.push((exe.to_string(), configured));
            continue;
        }

        let which = transport.exec(&format!("which {} 2>/dev/null", exe))?;
        let located = which.stdout.trim();
        if which.success() && !located.is_empty() {
            log_debug!("remote {} via which: {}", exe, located);
            found.push((exe.to_string(), located.to_string()));
        }
    }

    if found.is_empty() {
        return Err(AppError::EnvNotFound(format!(
            "no CFX executables on the cluster; checked {} and {} plus PATH",
            config.remote_cfx_executable("cfx5pre"),
            config.remote_cfx_executable("cfx5solve"),
        )));
    }

    log_info!("remote CFX environment verified ({} executables)", found.len());
    Ok(found)
}
