//! SSH sessions backed by the system `ssh` binary.
//!
//! Like the rest of the tool this relies on the user's OpenSSH setup rather
//! than an SSH library: `~/.ssh/config`, ssh-agent, ProxyJump and known hosts
//! all keep working. Each dial starts one ControlMaster process; streams
//! (`ssh -W`) and commands are multiplexed over its control socket.

use super::session::{Dialer, RemoteSession, RemoteStream};
use crate::tunnel::signal::{Signal, Trigger, signal};
use anyhow::{Context, Result};
use async_lock::Mutex;
use async_trait::async_trait;
use futures::StreamExt;
use smol::future::FutureExt;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::process::{Child, Command, Stdio};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How long a terminated master gets to exit after SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Poll interval while waiting for the control socket to come up.
const READY_POLL: Duration = Duration::from_millis(100);

/// Options passed to every `ssh` invocation.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub program: String,
    pub connect_timeout: Duration,
    pub server_alive_interval: Duration,
    pub server_alive_count_max: u32,
    /// Additional arguments placed before the destination.
    pub extra_args: Vec<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            server_alive_interval: Duration::from_secs(30),
            server_alive_count_max: 3,
            extra_args: Vec::new(),
        }
    }
}

/// Dials hosts by starting an OpenSSH ControlMaster.
#[derive(Debug, Clone, Default)]
pub struct SystemSshDialer {
    options: SshOptions,
}

impl SystemSshDialer {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn master_command(&self, host: &str, control_path: &Path) -> Command {
        let mut cmd = Command::new(&self.options.program);

        // Kill the master if the dial is abandoned half way
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        cmd.args(["-M", "-N"]);
        cmd.args(["-o", "ControlMaster=yes"]);
        cmd.arg("-o")
            .arg(format!("ControlPath={}", control_path.display()));
        // Never prompt: there is no terminal to prompt on
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.options.connect_timeout.as_secs().max(1)
        ));
        cmd.arg("-o").arg(format!(
            "ServerAliveInterval={}",
            self.options.server_alive_interval.as_secs().max(1)
        ));
        cmd.arg("-o").arg(format!(
            "ServerAliveCountMax={}",
            self.options.server_alive_count_max
        ));

        for arg in &self.options.extra_args {
            cmd.arg(arg);
        }
        cmd.arg(host);
        cmd
    }
}

#[async_trait]
impl Dialer for SystemSshDialer {
    async fn dial(&self, host: &str) -> Result<Arc<dyn RemoteSession>> {
        let temp_dir = tempfile::Builder::new()
            .prefix("drillbit-ssh-")
            .tempdir()
            .context("Failed to create temp directory for control socket")?;
        let control_path = temp_dir.path().join("control.sock");

        let mut cmd = self.master_command(host, &control_path);
        tracing::debug!("Starting ssh master: {:?}", cmd);
        let mut master = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn ssh for {}", host))?;

        let last_error = Arc::new(Mutex::new(String::new()));
        if let Some(stderr) = master.stderr.take() {
            smol::spawn(watch_stderr(host.to_string(), stderr, last_error.clone())).detach();
        }

        let session = SystemSshSession {
            host: host.to_string(),
            program: self.options.program.clone(),
            control_path,
            exited: Signal::fired(),
            kill: signal().0,
            _temp_dir: temp_dir,
        };

        loop {
            if let Some(status) = master.try_status()? {
                let stderr = last_error.lock().await.clone();
                anyhow::bail!(
                    "ssh to {} exited with {}: {}",
                    host,
                    status,
                    if stderr.is_empty() { "no output" } else { stderr.as_str() }
                );
            }
            if session.check().await.is_ok() {
                break;
            }
            smol::Timer::after(READY_POLL).await;
        }

        let (exited_tx, exited) = signal();
        let (kill, kill_rx) = signal();
        smol::spawn(supervise_master(host.to_string(), master, kill_rx, exited_tx)).detach();

        tracing::info!("SSH connection to {} established", host);
        Ok(Arc::new(SystemSshSession {
            exited,
            kill,
            ..session
        }))
    }
}

/// Log the master's stderr and remember the most recent line for errors.
async fn watch_stderr(
    host: String,
    stderr: smol::process::ChildStderr,
    last_error: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Some(result) = lines.next().await {
        match result {
            Ok(line) => {
                let lower = line.to_lowercase();
                if lower.contains("permission denied") || lower.contains("authentication failed") {
                    tracing::error!("SSH authentication failed for {}: {}", host, line);
                } else if lower.contains("connection refused") || lower.contains("timed out") {
                    tracing::error!("SSH connection error for {}: {}", host, line);
                } else {
                    tracing::debug!("ssh {} stderr: {}", host, line);
                }
                *last_error.lock().await = line;
            }
            Err(e) => {
                tracing::debug!("ssh {} stderr read error: {}", host, e);
                break;
            }
        }
    }
}

/// Own the master process until it exits or is asked to stop.
async fn supervise_master(host: String, mut master: Child, kill: Signal, exited: Trigger) {
    let killed = async {
        let _ = master.status().await;
        false
    }
    .or(async {
        kill.wait().await;
        true
    })
    .await;

    if killed {
        terminate(&mut master).await;
        tracing::debug!("SSH connection to {} closed", host);
    } else {
        tracing::warn!("SSH connection to {} terminated", host);
    }
    exited.fire();
}

/// SIGTERM first so ssh can remove its control socket, SIGKILL if it lingers.
async fn terminate(master: &mut Child) {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) on our own child's pid has no memory-safety impact.
        unsafe {
            libc::kill(master.id() as i32, libc::SIGTERM);
        }
    }

    let exited = async {
        let _ = master.status().await;
        true
    }
    .or(async {
        smol::Timer::after(TERMINATE_GRACE).await;
        false
    })
    .await;

    if !exited {
        let _ = master.kill();
        let _ = master.status().await;
    }
}

struct SystemSshSession {
    host: String,
    program: String,
    control_path: PathBuf,
    exited: Signal,
    /// Dropping the session drops this, which also stops the master.
    kill: Trigger,
    _temp_dir: TempDir,
}

impl SystemSshSession {
    /// An ssh invocation that goes through the master's control socket.
    fn mux_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true);
        cmd.arg("-S").arg(&self.control_path);
        cmd.args(["-o", "ControlMaster=no"]);
        cmd.args(["-o", "BatchMode=yes"]);
        cmd
    }

    async fn check(&self) -> Result<()> {
        let output = self
            .mux_command()
            .args(["-O", "check"])
            .arg(&self.host)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run ssh -O check")?;

        if output.status.success() {
            Ok(())
        } else {
            anyhow::bail!(
                "control master for {} not responding: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }
}

#[async_trait]
impl RemoteSession for SystemSshSession {
    async fn open_stream(&self, host: &str, port: u16) -> Result<RemoteStream> {
        if self.exited.is_fired() {
            anyhow::bail!("ssh connection to {} is closed", self.host);
        }

        let mut child = self
            .mux_command()
            .arg("-W")
            .arg(format!("{}:{}", host, port))
            .arg(&self.host)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to open stream to {}:{}", host, port))?;

        let stdin = child.stdin.take().context("ssh -W stdin unavailable")?;
        let stdout = child.stdout.take().context("ssh -W stdout unavailable")?;
        Ok(RemoteStream::new(stdout, stdin).with_guard(child))
    }

    async fn exec(&self, command: &str) -> Result<String> {
        if self.exited.is_fired() {
            anyhow::bail!("ssh connection to {} is closed", self.host);
        }

        let output = self
            .mux_command()
            .arg(&self.host)
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run remote command")?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            anyhow::bail!(
                "remote command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
    }

    async fn keepalive(&self) -> Result<()> {
        self.check().await
    }

    async fn closed(&self) {
        self.exited.wait().await;
    }

    async fn close(&self) {
        self.kill.fire();
        self.exited.wait().await;
    }
}
