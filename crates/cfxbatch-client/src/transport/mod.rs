pub mod retry;
pub mod ssh;

use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::model::TransferStats;
use cfxbatch_core::{log_debug, log_info, log_warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use wildmatch::WildMatch;

pub use retry::RetryPolicy;
pub use ssh::SshSession;

/// Captured result of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The narrow seam between the pipeline and the wire. One implementation
/// speaks SSH/SFTP; tests drive the whole pipeline through an in-memory
/// fake.
pub trait RemoteSession {
    /// `timeout` of zero means unbounded.
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput>;
    /// Write `data` to `remote` (parent directory must exist).
    fn put(&mut self, data: &[u8], remote: &str) -> Result<()>;
    fn get(&mut self, remote: &str) -> Result<Vec<u8>>;
    /// Size of the remote file, or None if it does not exist.
    fn stat(&mut self, remote: &str) -> Result<Option<u64>>;
    /// Create a single directory level; an already-existing directory is
    /// not an error.
    fn mkdir(&mut self, remote: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Join remote POSIX paths without doubling separators.
pub fn remote_join(base: &str, rest: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rest.trim_start_matches('/')
    )
}

fn parent_of(path: &str) -> Option<String> {
    path.rsplit_once('/')
        .map(|(dir, _)| dir.to_string())
        .filter(|d| !d.is_empty())
}

/// Rewrite CRLF and bare CR to LF. Submitted scripts execute on POSIX
/// hosts; carriage returns break the interpreter line.
pub fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        match data[i] {
            b'\r' => {
                out.push(b'\n');
                if i + 1 < data.len() && data[i + 1] == b'\n' {
                    i += 1;
                }
            }
            byte => out.push(byte),
        }
        i += 1;
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// One file scheduled for transfer: local path plus the path, relative to
/// the transfer root, it lands under.
#[derive(Debug, Clone)]
pub struct TransferItem {
    pub local: PathBuf,
    pub relative: String,
}

/// Per-step success/fail aggregation. A file that exhausts its retries is
/// recorded here; it does not abort the remaining files.
#[derive(Debug, Clone, Default)]
pub struct TransferReport {
    pub transferred: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TransferReport {
    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

fn attempt_upload(
    session: &mut dyn RemoteSession,
    payload: &[u8],
    remote_path: &str,
    expected_sha: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    session.put(payload, remote_path)?;
    if let Some(expected) = expected_sha {
        let output = session.exec(&format!("sha256sum '{}'", remote_path), timeout)?;
        if !output.success() {
            log_warn!(
                "checksum verification unavailable for {}: {}",
                remote_path,
                output.stderr.trim()
            );
            return Ok(());
        }
        let actual = output.stdout.split_whitespace().next().unwrap_or("");
        if actual != expected {
            return Err(AppError::Transport(format!(
                "checksum mismatch after upload of {}: local {}, remote {}",
                remote_path, expected, actual
            )));
        }
    }
    Ok(())
}

fn attempt_download(
    session: &mut dyn RemoteSession,
    remote_path: &str,
    verify: bool,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let data = session.get(remote_path)?;
    if verify {
        let output = session.exec(&format!("sha256sum '{}'", remote_path), timeout)?;
        if output.success() {
            let remote_sha = output.stdout.split_whitespace().next().unwrap_or("");
            let local_sha = sha256_hex(&data);
            if remote_sha != local_sha {
                return Err(AppError::Transport(format!(
                    "checksum mismatch after download of {}: remote {}, local {}",
                    remote_path, remote_sha, local_sha
                )));
            }
        } else {
            log_warn!(
                "checksum verification unavailable for {}: {}",
                remote_path,
                output.stderr.trim()
            );
        }
    }
    Ok(data)
}

/// File-staging front end over a [`RemoteSession`]: directory walks,
/// retried uploads and downloads with verification, result collection, and
/// transfer statistics. Owns the remote session for the run.
pub struct Transport {
    session: Box<dyn RemoteSession>,
    retry: RetryPolicy,
    command_timeout: Duration,
    /// Extensions rewritten to LF on upload because the remote target runs
    /// them with POSIX tools. Verification is skipped for rewritten files.
    script_extensions: Vec<String>,
    verify_checksums: bool,
    stats: TransferStats,
}

impl Transport {
    pub fn new(session: Box<dyn RemoteSession>, config: &RunConfig) -> Self {
        Transport {
            session,
            retry: RetryPolicy::new(config.transfer_retry_times, Duration::from_secs(1)),
            command_timeout: Duration::from_secs(config.transfer_timeout),
            script_extensions: vec!["sh".to_string(), "slurm".to_string(), "pbs".to_string()],
            verify_checksums: config.enable_checksum_verification,
            stats: TransferStats::default(),
        }
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn exec(&mut self, command: &str) -> Result<ExecOutput> {
        log_debug!("[remote] {}", command);
        self.session.exec(command, self.command_timeout)
    }

    /// For commands expected to block for the lifetime of the batch, such
    /// as a sequential submit driver.
    pub fn exec_unbounded(&mut self, command: &str) -> Result<ExecOutput> {
        log_debug!("[remote, unbounded] {}", command);
        self.session.exec(command, Duration::ZERO)
    }

    /// Exec that treats a non-zero exit code as a transport error.
    pub fn exec_checked(&mut self, command: &str) -> Result<ExecOutput> {
        let output = self.exec(command)?;
        if !output.success() {
            return Err(AppError::Transport(format!(
                "remote command '{}' exited with {}: {}",
                command,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    /// mkdir-p walk over the session's single-level mkdir.
    pub fn ensure_remote_dir(&mut self, path: &str) -> Result<()> {
        let mut current = if path.starts_with('/') {
            "/".to_string()
        } else {
            String::new()
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() && !current.ends_with('/') {
                current.push('/');
            }
            current.push_str(component);
            if self.session.stat(&current)?.is_none() {
                self.session.mkdir(&current)?;
            }
        }
        Ok(())
    }

    fn is_script(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| self.script_extensions.iter().any(|s| s == ext))
    }

    /// Upload one file under `remote_root`, creating remote directories as
    /// needed. Retries with backoff; errors only after the attempt budget
    /// is spent.
    pub fn upload_file(&mut self, item: &TransferItem, remote_root: &str) -> Result<u64> {
        let data = fs_err::read(&item.local)?;
        let is_script = self.is_script(&item.relative);
        let payload = if is_script {
            normalize_line_endings(&data)
        } else {
            data
        };
        let remote_path = remote_join(remote_root, &item.relative);
        if let Some(parent) = parent_of(&remote_path) {
            self.ensure_remote_dir(&parent)?;
        }

        let expected = (self.verify_checksums && !is_script).then(|| sha256_hex(&payload));
        let bytes = payload.len() as u64;
        let retry = self.retry.clone();
        let timeout = self.command_timeout;
        let session = self.session.as_mut();
        retry.run(&format!("upload of {}", item.relative), || {
            attempt_upload(&mut *session, &payload, &remote_path, expected.as_deref(), timeout)
        })?;

        self.stats.record_upload(bytes);
        Ok(bytes)
    }

    /// Upload a file list, continuing past per-file failures.
    pub fn upload(&mut self, items: &[TransferItem], remote_root: &str) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        for item in items {
            match self.upload_file(item, remote_root) {
                Ok(bytes) => {
                    log_info!("uploaded {} ({} bytes)", item.relative, bytes);
                    report.transferred.push(item.relative.clone());
                }
                Err(e) => {
                    log_warn!("giving up on {}: {}", item.relative, e);
                    self.stats.record_failure();
                    report.failed.push((item.relative.clone(), e.to_string()));
                }
            }
        }
        log_info!(
            "upload finished: {} ok, {} failed",
            report.transferred.len(),
            report.failed.len()
        );
        Ok(report)
    }

    pub fn download_file(&mut self, remote_path: &str, local: &Path) -> Result<u64> {
        let verify = self.verify_checksums && !self.is_script(remote_path);
        let retry = self.retry.clone();
        let timeout = self.command_timeout;
        let session = self.session.as_mut();
        let data = retry.run(&format!("download of {}", remote_path), || {
            attempt_download(&mut *session, remote_path, verify, timeout)
        })?;

        if let Some(parent) = local.parent() {
            fs_err::create_dir_all(parent)?;
        }
        fs_err::write(local, &data)?;
        let bytes = data.len() as u64;
        self.stats.record_download(bytes);
        Ok(bytes)
    }

    /// Download `(remote, local)` pairs, continuing past per-file failures.
    pub fn download(&mut self, items: &[(String, PathBuf)]) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        for (remote, local) in items {
            match self.download_file(remote, local) {
                Ok(bytes) => {
                    log_info!("downloaded {} ({} bytes)", remote, bytes);
                    report.transferred.push(remote.clone());
                }
                Err(e) => {
                    log_warn!("giving up on {}: {}", remote, e);
                    self.stats.record_failure();
                    report.failed.push((remote.clone(), e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Collect result files for one job: list the remote case directory,
    /// match the configured patterns (with `{job_name}` substituted), and
    /// download hits into `local_dir`.
    pub fn collect_results(
        &mut self,
        job_name: &str,
        remote_dir: &str,
        patterns: &[String],
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let listing = self.exec(&format!("ls -1 '{}' 2>/dev/null", remote_dir))?;
        if !listing.success() {
            log_warn!("result listing failed for {}", remote_dir);
            return Ok(Vec::new());
        }

        let matchers: Vec<WildMatch> = patterns
            .iter()
            .map(|p| WildMatch::new(&p.replace("{job_name}", job_name)))
            .collect();

        let names: Vec<String> = listing
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter(|l| matchers.iter().any(|m| m.matches(l)))
            .map(String::from)
            .collect();

        let mut downloaded = Vec::new();
        for name in names {
            let remote_path = remote_join(remote_dir, &name);
            let local_path = local_dir.join(&name);
            match self.download_file(&remote_path, &local_path) {
                Ok(_) => downloaded.push(local_path),
                Err(e) => {
                    log_warn!("result download failed for {}: {}", remote_path, e);
                    self.stats.record_failure();
                }
            }
        }
        Ok(downloaded)
    }

    pub fn remote_file_exists(&mut self, path: &str) -> Result<bool> {
        Ok(self.session.stat(path)?.is_some())
    }

    pub fn cleanup_remote(&mut self, path: &str) -> Result<()> {
        log_info!("removing remote staging directory {}", path);
        self.exec_checked(&format!("rm -rf '{}'", path))?;
        Ok(())
    }

    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }
}
