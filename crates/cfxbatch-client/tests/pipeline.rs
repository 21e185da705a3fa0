//! End-to-end pipeline tests over an in-memory remote session.

use cfxbatch_client::transport::{ExecOutput, RemoteSession, Transport, TransferItem};
use cfxbatch_client::workflow::{Step, Workflow};
use cfxbatch_client::{inventory, scripts};
use cfxbatch_core::config::{CfxMode, ClusterKind, RunConfig, SchedulerKind};
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::JobState;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A canned response for remote commands matching `needle`. Responses are
/// consumed in order; the last one repeats. Matched rules may also drop
/// files into the fake remote filesystem, standing in for work the real
/// command would have done.
#[derive(Clone)]
struct Rule {
    needle: String,
    outputs: VecDeque<(i32, String, String)>,
    create_files: Vec<String>,
}

impl Rule {
    fn new(needle: &str, exit_code: i32, stdout: &str) -> Self {
        Rule {
            needle: needle.to_string(),
            outputs: VecDeque::from([(exit_code, stdout.to_string(), String::new())]),
            create_files: Vec::new(),
        }
    }

    fn with_stderr(needle: &str, exit_code: i32, stderr: &str) -> Self {
        Rule {
            needle: needle.to_string(),
            outputs: VecDeque::from([(exit_code, String::new(), stderr.to_string())]),
            create_files: Vec::new(),
        }
    }

    fn creating(mut self, files: &[&str]) -> Self {
        self.create_files = files.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[derive(Default)]
struct FakeState {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    exec_log: Vec<String>,
    rules: Vec<Rule>,
}

#[derive(Clone)]
struct FakeSession(Arc<Mutex<FakeState>>);

impl FakeSession {
    fn new(rules: Vec<Rule>) -> Self {
        FakeSession(Arc::new(Mutex::new(FakeState {
            rules,
            ..FakeState::default()
        })))
    }

    fn seed_file(&self, path: &str, data: &[u8]) {
        self.0.lock().unwrap().files.insert(path.to_string(), data.to_vec());
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.0.lock().unwrap().files.get(path).cloned()
    }

    fn exec_log(&self) -> Vec<String> {
        self.0.lock().unwrap().exec_log.clone()
    }
}

fn quoted_path(command: &str) -> Option<String> {
    let start = command.find('\'')?;
    let rest = &command[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl RemoteSession for FakeSession {
    fn exec(&mut self, command: &str, _timeout: Duration) -> Result<ExecOutput> {
        let mut guard = self.0.lock().unwrap();
        let state = &mut *guard;
        state.exec_log.push(command.to_string());

        if command.starts_with("sha256sum ") {
            let path = quoted_path(command).unwrap_or_default();
            return Ok(match state.files.get(&path) {
                Some(data) => ExecOutput {
                    stdout: format!("{}  {}\n", sha256_hex(data), path),
                    stderr: String::new(),
                    exit_code: 0,
                },
                None => ExecOutput {
                    stdout: String::new(),
                    stderr: format!("sha256sum: {}: No such file or directory", path),
                    exit_code: 1,
                },
            });
        }

        if command.starts_with("ls -1 ") {
            let dir = quoted_path(command).unwrap_or_default();
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let names: Vec<String> = state
                .files
                .keys()
                .filter_map(|path| path.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(String::from)
                .collect();
            return Ok(ExecOutput {
                stdout: names.join("\n"),
                stderr: String::new(),
                exit_code: 0,
            });
        }

        for rule in state.rules.iter_mut() {
            if command.contains(&rule.needle) {
                let (exit_code, stdout, stderr) = if rule.outputs.len() > 1 {
                    rule.outputs.pop_front().unwrap()
                } else {
                    rule.outputs.front().cloned().unwrap_or((0, String::new(), String::new()))
                };
                let to_create = rule.create_files.clone();
                for file in to_create {
                    state.files.entry(file).or_insert_with(|| b"DEF".to_vec());
                }
                return Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code,
                });
            }
        }

        Ok(ExecOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    fn put(&mut self, data: &[u8], remote: &str) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .files
            .insert(remote.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&mut self, remote: &str) -> Result<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| AppError::Transport(format!("no such remote file: {}", remote)))
    }

    fn stat(&mut self, remote: &str) -> Result<Option<u64>> {
        let state = self.0.lock().unwrap();
        if let Some(data) = state.files.get(remote) {
            return Ok(Some(data.len() as u64));
        }
        if state.dirs.contains(remote) {
            return Ok(Some(0));
        }
        Ok(None)
    }

    fn mkdir(&mut self, remote: &str) -> Result<()> {
        self.0.lock().unwrap().dirs.insert(remote.to_string());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn workflow_with(config: RunConfig, session: FakeSession, cancel: Arc<AtomicBool>) -> Workflow {
    Workflow::with_connector(
        config,
        cancel,
        Box::new(move |_| Ok(Box::new(session.clone()) as Box<dyn RemoteSession>)),
    )
    .unwrap()
}

fn base_config(dir: &Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.base_path = dir.to_path_buf();
    config.cfx_mode = CfxMode::Server;
    config.skip_cfx_verification = true;
    config.cfx_file_path = dir.join("pump.cfx").display().to_string();
    config.ssh_host = "hpc.example.edu".to_string();
    config.ssh_user = "alice".to_string();
    config.ssh_key = Some("/home/alice/.ssh/id_rsa".to_string());
    config.remote_base_path = "/scratch/run".to_string();
    config.monitor_interval = 1;
    config.job_submit_delay = 0;
    std::fs::write(dir.join("pump.cfx"), b"model").unwrap();
    config
}

const SINFO_TWO_IDLE: &str = "n01 32 64000 idle cpu-low (null)\nn02 32 64000 idle cpu-low (null)\n";

#[test]
fn tiny_slurm_run_reaches_completion_and_downloads_results() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.pressure_list = vec![2187.0, 2189.0];

    let session = FakeSession::new(vec![
        Rule::new("which sinfo", 0, "/usr/bin/sinfo"),
        Rule::new("sinfo -N", 0, SINFO_TWO_IDLE),
        Rule::new("cfx5pre", 0, "").creating(&[
            "/scratch/run/P_Out_2187/2187.def",
            "/scratch/run/P_Out_2189/2189.def",
        ]),
        Rule::new(
            "./Submit_All.sh",
            0,
            "submitting P_Out_2187/CFX_Job_2187.slurm\n\
             Submitted batch job 101\n\
             submitting P_Out_2189/CFX_Job_2189.slurm\n\
             Submitted batch job 102\n\
             all jobs submitted\n",
        ),
        Rule::new("sacct -j 101", 0, "101|COMPLETED|T1|T2|0:0\n"),
        Rule::new("sacct -j 102", 0, "102|COMPLETED|T1|T2|0:0\n"),
    ]);
    session.seed_file("/scratch/run/P_Out_2187/2187_001.res", b"RESULT-2187");
    session.seed_file("/scratch/run/P_Out_2189/2189_001.res", b"RESULT-2189");

    let cancel = Arc::new(AtomicBool::new(false));
    let mut workflow = workflow_with(config, session.clone(), cancel);
    let report = workflow.run(false).unwrap();

    let completed = &report.execution_summary.completed_steps;
    for step in Step::ALL {
        assert!(
            completed.contains(&step.name().to_string()),
            "step {} missing from {:?}",
            step,
            completed
        );
    }
    assert!(report.execution_summary.failed_steps.is_empty());

    // Two idle nodes, two jobs: parallel submission.
    assert_eq!(report.generated_files.queue_strategy, "parallel");

    let jobs = &workflow.artifacts().jobs;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id.0, "101");
    assert_eq!(jobs[0].name, "CFX_Job_2187");
    assert_eq!(jobs[1].id.0, "102");
    assert_eq!(jobs[1].name, "CFX_Job_2189");
    assert!(jobs.iter().all(|j| j.state == JobState::Completed));
    assert!(jobs.iter().all(|j| j.downloaded));

    // Downloaded result bytes are identical to the remote ones.
    let local_res = dir
        .path()
        .join("results")
        .join("CFX_Job_2187")
        .join("2187_001.res");
    assert_eq!(std::fs::read(local_res).unwrap(), b"RESULT-2187");

    // The uploaded job script reached the fake cluster with LF endings.
    let remote_script = session
        .file("/scratch/run/P_Out_2187/CFX_Job_2187.slurm")
        .expect("job script staged");
    assert!(!remote_script.contains(&b'\r'));

    // An execution report landed under base_path/report.
    let report_dir = dir.path().join("report");
    assert!(report_dir.read_dir().unwrap().next().is_some());
}

#[test]
fn pbs_dense_pack_submits_sequentially_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.scheduler_type = SchedulerKind::Pbs;
    config.cluster_type = ClusterKind::GroupOld;
    config.pressure_list = vec![2200.0, 2300.0, 2400.0, 2500.0, 2600.0];
    config.min_cores = 28;

    let pbsnodes = "\
node41
     state = free
     np = 28
     status = rectime=1,ncpus=28,totmem=66000000kb
";
    let qsub_output = "\
50197.hn\n50198.hn\n50199.hn\n50200.hn\n50201.hn\n";

    let session = FakeSession::new(vec![
        Rule::new("which sinfo", 1, ""),
        Rule::new("which pbsnodes", 0, "/usr/bin/pbsnodes"),
        Rule::new("pbsnodes -a", 0, pbsnodes),
        Rule::new("cfx5pre", 0, "").creating(&[
            "/scratch/run/P_Out_2200/2200.def",
            "/scratch/run/P_Out_2300/2300.def",
            "/scratch/run/P_Out_2400/2400.def",
            "/scratch/run/P_Out_2500/2500.def",
            "/scratch/run/P_Out_2600/2600.def",
        ]),
        Rule::new("./Submit_All.sh", 0, qsub_output),
        Rule::with_stderr("qstat -f", 1, "qstat: Unknown Job Id"),
    ]);

    let cancel = Arc::new(AtomicBool::new(false));
    let mut workflow = workflow_with(config, session.clone(), cancel);
    let report = workflow.run(false).unwrap();

    // One free node, five jobs: strictly one at a time.
    assert_eq!(report.generated_files.queue_strategy, "sequential");

    let jobs = &workflow.artifacts().jobs;
    assert_eq!(jobs.len(), 5);
    let names: Vec<&str> = jobs.iter().map(|j| j.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "CFX_Job_2200",
            "CFX_Job_2300",
            "CFX_Job_2400",
            "CFX_Job_2500",
            "CFX_Job_2600"
        ]
    );
    assert!(jobs.iter().all(|j| j.state == JobState::Completed));

    // Every job script pins the single free node.
    let script = session
        .file("/scratch/run/P_Out_2400/CFX_Job_2400.pbs")
        .expect("job script staged");
    let script = String::from_utf8(script).unwrap();
    assert!(script.contains("#PBS -l nodes=n41:ppn=28"));

    // The driver waits on each job id before the next submission.
    let driver = session.file("/scratch/run/Submit_All.sh").unwrap();
    let driver = String::from_utf8(driver).unwrap();
    assert!(driver.contains("while qstat \"$JOB_ID\""));
}

#[cfg(unix)]
#[test]
fn local_generation_failure_aborts_with_generation_error() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("fakecfx");
    std::fs::create_dir_all(&bin_dir).unwrap();
    let pre = bin_dir.join("cfx5pre");
    std::fs::write(&pre, "#!/bin/sh\necho boom >&2\nexit 1\n").unwrap();
    let mut perms = std::fs::metadata(&pre).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&pre, perms).unwrap();

    let mut config = base_config(dir.path());
    config.cfx_mode = CfxMode::Local;
    config.auto_detect_cfx = false;
    config.cfx_bin_path = bin_dir.display().to_string();
    config.pressure_list = vec![2187.0];

    let session = FakeSession::new(vec![Rule::new("which sinfo", 0, "/usr/bin/sinfo")]);
    let cancel = Arc::new(AtomicBool::new(false));
    let mut workflow = workflow_with(config, session, cancel);

    let err = workflow.run(false).unwrap_err();
    match err {
        AppError::Workflow { step, source } => {
            assert_eq!(step, "generate_def");
            assert!(matches!(*source, AppError::Generation(_)));
        }
        other => panic!("expected a workflow error, got {}", other),
    }

    let state = workflow.state();
    let completed: Vec<&str> = state.completed.iter().map(|s| s.name()).collect();
    assert!(completed.contains(&"connect_server"));
    assert!(completed.contains(&"verify_cfx"));
    let failed: Vec<&str> = state.failed.iter().map(|s| s.name()).collect();
    assert_eq!(failed, vec!["generate_def"]);

    // The failure still leaves an execution report behind.
    assert!(dir
        .path()
        .join("report")
        .read_dir()
        .unwrap()
        .next()
        .is_some());
}

#[test]
fn interrupted_monitoring_stops_at_the_poll_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.pressure_list = vec![2187.0];
    config.auto_download_results = false;

    let session = FakeSession::new(vec![
        Rule::new("which sinfo", 0, "/usr/bin/sinfo"),
        Rule::new("sinfo -N", 0, "n01 32 64000 idle cpu-low (null)\n"),
        Rule::new("cfx5pre", 0, "").creating(&["/scratch/run/P_Out_2187/2187.def"]),
        Rule::new("./Submit_All.sh", 0, "Submitted batch job 101\n"),
        // The job never finishes on its own.
        Rule::new("sacct -j 101", 0, "101|RUNNING||\n"),
    ]);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            cancel.store(true, Ordering::Relaxed);
        });
    }

    let mut workflow = workflow_with(config, session, cancel);
    let err = workflow.run(false).unwrap_err();
    match err {
        AppError::Workflow { step, source } => {
            assert_eq!(step, "monitor_jobs");
            assert!(matches!(*source, AppError::UserAborted));
        }
        other => panic!("expected an aborted monitor step, got {}", other),
    }

    // The monitor still produced a report with the last known state.
    let monitor_report = workflow.artifacts().monitor_report.as_ref().unwrap();
    assert_eq!(monitor_report.jobs[0].state, JobState::Running);
    let wrote_monitor_report = dir
        .path()
        .read_dir()
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("monitoring_report_")
        });
    assert!(wrote_monitor_report);
}

#[test]
fn upload_normalizes_scripts_and_round_trips_binaries() {
    let dir = tempfile::tempdir().unwrap();
    let config = {
        let mut config = base_config(dir.path());
        config.pressure_list = vec![2187.0];
        config
    };

    let session = FakeSession::new(Vec::new());
    let mut transport = Transport::new(Box::new(session.clone()), &config);

    let script_path = dir.path().join("Submit_All.sh");
    std::fs::write(&script_path, b"#!/bin/bash\r\necho hi\r\n").unwrap();
    let data_path = dir.path().join("2187.def");
    let payload: Vec<u8> = (0u8..=255).collect();
    std::fs::write(&data_path, &payload).unwrap();

    let items = vec![
        TransferItem {
            local: script_path,
            relative: "Submit_All.sh".to_string(),
        },
        TransferItem {
            local: data_path,
            relative: "P_Out_2187/2187.def".to_string(),
        },
    ];
    let report = transport.upload(&items, "/scratch/run").unwrap();
    assert!(report.all_ok());

    // The script was rewritten to LF on the wire.
    assert_eq!(
        session.file("/scratch/run/Submit_All.sh").unwrap(),
        b"#!/bin/bash\necho hi\n"
    );
    // The checksum of the script was never queried; the binary's was.
    let log = session.exec_log().join("\n");
    assert!(!log.contains("sha256sum '/scratch/run/Submit_All.sh'"));
    assert!(log.contains("sha256sum '/scratch/run/P_Out_2187/2187.def'"));

    // Round trip: download the binary and compare bytes.
    let back = dir.path().join("back.def");
    transport
        .download_file("/scratch/run/P_Out_2187/2187.def", &back)
        .unwrap();
    assert_eq!(std::fs::read(back).unwrap(), payload);

    let stats = transport.stats();
    assert_eq!(stats.files_uploaded, 2);
    assert_eq!(stats.files_downloaded, 1);
    assert_eq!(stats.failures, 0);
}

#[test]
fn regenerating_scripts_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.pressure_list = vec![2187.0, 2189.0];
    let cases = config.cases();

    let nodes = inventory::parse_sinfo_output(SINFO_TWO_IDLE);
    let first = scripts::generate(&config, &cases, &nodes, &BTreeMap::new()).unwrap();
    let first_driver = std::fs::read_to_string(&first.submit_script).unwrap();
    let first_job = std::fs::read_to_string(&first.job_scripts[0]).unwrap();

    let second = scripts::generate(&config, &cases, &nodes, &BTreeMap::new()).unwrap();
    assert_eq!(first.job_scripts, second.job_scripts);
    assert_eq!(
        std::fs::read_to_string(&second.submit_script).unwrap(),
        first_driver
    );
    assert_eq!(
        std::fs::read_to_string(&second.job_scripts[0]).unwrap(),
        first_job
    );
}

#[test]
fn eight_node_inventory_survives_one_malformed_entry() {
    let mut output = String::new();
    for i in 41..48 {
        output.push_str(&format!(
            "node{}\n     state = free\n     np = 28\n     status = ncpus=28,totmem=66000000kb\n\n",
            i
        ));
    }
    output.push_str(
        "node48\n     state = free\n     np = 28\n     status = ncpus=28,totmem=bogus\n\n",
    );

    let nodes = inventory::parse_pbsnodes_output(&output);
    assert_eq!(nodes.len(), 7);
    assert!(nodes.iter().all(|n| n.name != "node48"));
}
