use crate::template::render;
use crate::transport::{remote_join, Transport, TransferItem};
use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::logging;
use cfxbatch_core::model::{format_pressure, Case};
use cfxbatch_core::{log_debug, log_info, log_warn};
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub const SESSION_FILE_NAME: &str = "create_def_batch.pre";
const CFX_PRE_TIMEOUT: Duration = Duration::from_secs(300);

const SESSION_HEADER: &str = "\
# CFX-Pre session: write one solver input file per back pressure.
COMMAND FILE:
  CFX Pre Version = ${cfx_version}
END

>load filename=${cfx_file_path}, mode=cfx
";

const SESSION_CASE_BLOCK: &str = "
# ---- ${pressure} [${pressure_unit}] ----
FLOW: ${flow_analysis_name}
  DOMAIN: ${domain_name}
    BOUNDARY: ${outlet_boundary_name}
      Boundary Type = OUTLET
      Location = ${outlet_location}
      BOUNDARY CONDITIONS:
        MASS AND MOMENTUM:
          Option = Average Static Pressure
          Relative Pressure = ${pressure} [${pressure_unit}]
          Pressure Profile Blend = ${pressure_blend}
        END
      END
    END
  END
END
>update
>writeCaseFile filename=${def_path}, operation=write def file
";

/// Outcome of a case-generation step: where the solver inputs landed and
/// which cases actually produced one.
#[derive(Debug, Clone)]
pub struct CaseGeneration {
    pub session_script: PathBuf,
    /// Expected `.def` locations, in pressure order. Local paths in local
    /// mode, remote paths in server mode.
    pub def_files: Vec<String>,
    /// folder name -> whether its `.def` exists.
    pub validity: BTreeMap<String, bool>,
}

impl CaseGeneration {
    pub fn valid_count(&self) -> usize {
        self.validity.values().filter(|v| **v).count()
    }
}

/// Render the consolidated session script covering every case.
pub fn render_session_script(config: &RunConfig, cases: &[Case], output_root: &str) -> String {
    let mut vars = BTreeMap::new();
    vars.insert("cfx_version", "22.1".to_string());
    vars.insert("cfx_file_path", config.cfx_file_path.clone());
    let mut script = render(SESSION_HEADER, &vars);

    for case in cases {
        let mut vars = BTreeMap::new();
        vars.insert("pressure", format_pressure(case.pressure));
        vars.insert("pressure_unit", case.pressure_unit.clone());
        vars.insert("flow_analysis_name", config.flow_analysis_name.clone());
        vars.insert("domain_name", config.domain_name.clone());
        vars.insert("outlet_boundary_name", config.outlet_boundary_name.clone());
        vars.insert("outlet_location", config.outlet_location.clone());
        vars.insert("pressure_blend", config.pressure_blend.clone());
        vars.insert(
            "def_path",
            format!(
                "{}/{}/{}",
                output_root.trim_end_matches('/'),
                case.folder_name,
                case.def_file_name
            ),
        );
        script.push_str(&render(SESSION_CASE_BLOCK, &vars));
    }

    script
}

/// Write the session script into the staging root with LF endings.
pub fn write_session_script(config: &RunConfig, cases: &[Case]) -> Result<PathBuf> {
    let output_root = config.base_path.display().to_string().replace('\\', "/");
    let script = render_session_script(config, cases, &output_root);
    fs_err::create_dir_all(&config.base_path)?;
    let path = config.base_path.join(SESSION_FILE_NAME);
    fs_err::write(&path, script.replace("\r\n", "\n"))?;
    log_info!("session script written: {}", path.display());
    Ok(path)
}

fn run_cfx_pre_with_timeout(mut command: Command) -> Result<(i32, String, String)> {
    let mut stdout_file = tempfile::tempfile()?;
    let mut stderr_file = tempfile::tempfile()?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file.try_clone()?))
        .stderr(Stdio::from(stderr_file.try_clone()?));

    log_debug!("[cmd] {}", logging::command_line(&command));
    let mut child = command.spawn().map_err(|e| AppError::ProcessLaunchFailed {
        command_name: "cfx5pre".to_string(),
        source: e,
    })?;

    let deadline = Instant::now() + CFX_PRE_TIMEOUT;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(AppError::Generation(format!(
                "CFX-Pre exceeded the {} s timeout",
                CFX_PRE_TIMEOUT.as_secs()
            )));
        }
        std::thread::sleep(Duration::from_millis(200));
    };

    let mut stdout = String::new();
    stdout_file.seek(SeekFrom::Start(0))?;
    stdout_file.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    stderr_file.seek(SeekFrom::Start(0))?;
    stderr_file.read_to_string(&mut stderr)?;

    Ok((status.code().unwrap_or(-1), stdout, stderr))
}

/// Local mode: run CFX-Pre in batch mode against the session script, then
/// collect the expected per-case `.def` files. A missing individual file
/// is reported, not fatal; a failing CFX-Pre run is.
pub fn generate_local(
    config: &RunConfig,
    cases: &[Case],
    pre_executable: &Path,
) -> Result<CaseGeneration> {
    let session_script = write_session_script(config, cases)?;

    log_info!(
        "running CFX-Pre for {} cases ({})",
        cases.len(),
        pre_executable.display()
    );
    let mut command = Command::new(pre_executable);
    command
        .arg("-batch")
        .arg(&session_script)
        .current_dir(&config.base_path);

    let (exit_code, stdout, stderr) = run_cfx_pre_with_timeout(command)?;
    if exit_code != 0 {
        return Err(AppError::Generation(format!(
            "CFX-Pre exited with {}: {}",
            exit_code,
            if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            }
        )));
    }

    let mut def_files = Vec::new();
    let mut validity = BTreeMap::new();
    for case in cases {
        let def_path = config
            .base_path
            .join(&case.folder_name)
            .join(&case.def_file_name);
        let exists = def_path.exists();
        if !exists {
            log_warn!("expected solver input missing: {}", def_path.display());
        }
        validity.insert(case.folder_name.clone(), exists);
        def_files.push(def_path.display().to_string());
    }

    log_info!(
        "case generation finished: {}/{} def files present",
        validity.values().filter(|v| **v).count(),
        cases.len()
    );

    Ok(CaseGeneration {
        session_script,
        def_files,
        validity,
    })
}

/// Server mode: stage the session script and the `.cfx` model, run
/// CFX-Pre on the cluster, and check the remote `.def` paths.
pub fn generate_remote(
    config: &RunConfig,
    cases: &[Case],
    transport: &mut Transport,
) -> Result<CaseGeneration> {
    let session_script = write_session_script(config, cases)?;

    let cfx_model = Path::new(&config.cfx_file_path);
    let model_name = cfx_model
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            AppError::Generation(format!("invalid cfx_file_path '{}'", config.cfx_file_path))
        })?;

    let uploads = vec![
        TransferItem {
            local: session_script.clone(),
            relative: SESSION_FILE_NAME.to_string(),
        },
        TransferItem {
            local: cfx_model.to_path_buf(),
            relative: model_name,
        },
    ];
    let report = transport.upload(&uploads, &config.remote_base_path)?;
    if !report.all_ok() {
        return Err(AppError::Generation(format!(
            "failed to stage case-generation inputs: {:?}",
            report.failed
        )));
    }

    let remote_pre = config.remote_cfx_executable("cfx5pre");
    let command = format!(
        "cd '{}' && '{}' -batch {}",
        config.remote_base_path, remote_pre, SESSION_FILE_NAME
    );
    let output = transport.exec(&command)?;
    if !output.success() {
        return Err(AppError::Generation(format!(
            "remote CFX-Pre exited with {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }

    let mut def_files = Vec::new();
    let mut validity = BTreeMap::new();
    for case in cases {
        let remote_def = remote_join(
            &config.remote_base_path,
            &format!("{}/{}", case.folder_name, case.def_file_name),
        );
        let exists = transport.remote_file_exists(&remote_def)?;
        if !exists {
            log_warn!("expected remote solver input missing: {}", remote_def);
        }
        validity.insert(case.folder_name.clone(), exists);
        def_files.push(remote_def);
    }

    Ok(CaseGeneration {
        session_script,
        def_files,
        validity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RunConfig {
        let mut config = RunConfig::default();
        config.cfx_file_path = "pump.cfx".to_string();
        config.pressure_list = vec![2187.0, 2189.0];
        config
    }

    #[test]
    fn test_session_script_covers_every_pressure() {
        let config = test_config();
        let cases = config.cases();
        let script = render_session_script(&config, &cases, "/stage");
        assert!(script.contains(">load filename=pump.cfx"));
        assert!(script.contains("Relative Pressure = 2187 [Pa]"));
        assert!(script.contains("Relative Pressure = 2189 [Pa]"));
        assert!(script.contains("filename=/stage/P_Out_2187/2187.def"));
        assert!(script.contains("filename=/stage/P_Out_2189/2189.def"));
    }

    #[test]
    fn test_session_script_order_follows_pressure_list() {
        let config = test_config();
        let cases = config.cases();
        let script = render_session_script(&config, &cases, "/stage");
        let first = script.find("P_Out_2187").unwrap();
        let second = script.find("P_Out_2189").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_write_session_script_uses_lf() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.base_path = dir.path().to_path_buf();
        let path = write_session_script(&config, &config.cases()).unwrap();
        let content = fs_err::read_to_string(path).unwrap();
        assert!(!content.contains('\r'));
    }
}
