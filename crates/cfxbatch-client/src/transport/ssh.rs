use super::{ExecOutput, RemoteSession};
use cfxbatch_core::config::RunConfig;
use cfxbatch_core::error::{AppError, Result};
use cfxbatch_core::{log_debug, log_info};
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn ssh_err(e: ssh2::Error) -> AppError {
    AppError::Transport(e.to_string())
}

fn timeout_ms(timeout: Duration) -> u32 {
    if timeout.is_zero() {
        0
    } else {
        timeout.as_millis().min(u32::MAX as u128).max(1) as u32
    }
}

/// SSH/SFTP session for one run. Authentication is password or key,
/// exclusively, as configured.
pub struct SshSession {
    session: Session,
    sftp: ssh2::Sftp,
}

impl SshSession {
    pub fn connect(config: &RunConfig) -> Result<SshSession> {
        let addr_str = format!("{}:{}", config.ssh_host, config.ssh_port);
        log_info!("connecting to {}", addr_str);

        let addr = addr_str
            .to_socket_addrs()
            .map_err(|e| AppError::Transport(format!("cannot resolve {}: {}", addr_str, e)))?
            .next()
            .ok_or_else(|| {
                AppError::Transport(format!("no address found for {}", addr_str))
            })?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| AppError::Transport(format!("connect to {} failed: {}", addr_str, e)))?;

        let mut session = Session::new().map_err(ssh_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(ssh_err)?;

        let key = config.ssh_key.as_deref().filter(|k| !k.is_empty());
        let password = config.ssh_password.as_deref().filter(|p| !p.is_empty());
        match (key, password) {
            (Some(key), _) => {
                session
                    .userauth_pubkey_file(&config.ssh_user, None, Path::new(key), None)
                    .map_err(|e| {
                        AppError::Transport(format!("key authentication failed: {}", e))
                    })?;
            }
            (None, Some(password)) => {
                session
                    .userauth_password(&config.ssh_user, password)
                    .map_err(|e| {
                        AppError::Transport(format!("password authentication failed: {}", e))
                    })?;
            }
            (None, None) => {
                return Err(AppError::Transport(
                    "no SSH authentication configured".to_string(),
                ));
            }
        }

        if !session.authenticated() {
            return Err(AppError::Transport(format!(
                "authentication rejected for {}@{}",
                config.ssh_user, config.ssh_host
            )));
        }

        let sftp = session.sftp().map_err(ssh_err)?;
        log_info!("connected to {}@{}", config.ssh_user, config.ssh_host);
        Ok(SshSession { session, sftp })
    }
}

impl RemoteSession for SshSession {
    fn exec(&mut self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.session.set_timeout(timeout_ms(timeout));

        let mut channel = self.session.channel_session().map_err(ssh_err)?;
        channel.exec(command).map_err(ssh_err)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close().map_err(ssh_err)?;
        let exit_code = channel.exit_status().map_err(ssh_err)?;

        log_debug!("exit {} for: {}", exit_code, command);
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn put(&mut self, data: &[u8], remote: &str) -> Result<()> {
        let mut file = self.sftp.create(Path::new(remote)).map_err(ssh_err)?;
        file.write_all(data)?;
        Ok(())
    }

    fn get(&mut self, remote: &str) -> Result<Vec<u8>> {
        let mut file = self.sftp.open(Path::new(remote)).map_err(ssh_err)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Ok(data)
    }

    fn stat(&mut self, remote: &str) -> Result<Option<u64>> {
        match self.sftp.stat(Path::new(remote)) {
            Ok(stat) => Ok(Some(stat.size.unwrap_or(0))),
            Err(_) => Ok(None),
        }
    }

    fn mkdir(&mut self, remote: &str) -> Result<()> {
        let path = Path::new(remote);
        match self.sftp.mkdir(path, 0o755) {
            Ok(()) => Ok(()),
            // Racing a concurrent mkdir or an existing directory is fine.
            Err(e) => {
                if self.sftp.stat(path).is_ok() {
                    Ok(())
                } else {
                    Err(ssh_err(e))
                }
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        self.session
            .disconnect(None, "cfxbatch run finished", None)
            .map_err(ssh_err)
    }
}
