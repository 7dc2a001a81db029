//! Build worker invocation.
//!
//! The worker is an opaque subprocess: it reads the build packet on
//! standard input and may create, edit, and read files inside the
//! workspace. Its capability set is constrained by explicit allow-list
//! flags; no shell tool is enabled. Invocation is bounded by a
//! wall-clock timeout, enforced SIGTERM-first with a kill after a grace
//! period.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::warn;

use crate::config::SandboxConfig;
use crate::error::{KilnError, Result};

/// Captured result of a worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerOutput {
    /// Exit code; `None` when the worker was killed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl WorkerOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Capability interface for invoking the build worker.
///
/// Injectable so the build pipeline is fully deterministic under test.
pub trait BuildWorker {
    /// Run the worker in `workspace` with the packet on stdin.
    fn invoke(&self, workspace: &Path, packet: &str) -> Result<WorkerOutput>;

    /// Command line description, recorded in the build log.
    fn describe(&self) -> String;
}

/// Production worker: spawns the configured binary as a subprocess.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    bin: String,
    allowed_tools: Vec<String>,
    timeout: Duration,
    kill_grace: Duration,
}

impl CommandWorker {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            bin: config.worker_bin.clone(),
            allowed_tools: config.allowed_tools.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            kill_grace: Duration::from_secs(config.kill_grace_secs),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        for tool in &self.allowed_tools {
            args.push("--allowedTools".to_string());
            args.push(tool.clone());
        }
        args
    }
}

impl BuildWorker for CommandWorker {
    fn invoke(&self, workspace: &Path, packet: &str) -> Result<WorkerOutput> {
        let bin = which::which(&self.bin).map_err(|_| {
            KilnError::ToolFailure(format!("worker binary '{}' not found on PATH", self.bin))
        })?;

        let mut child = Command::new(&bin)
            .args(self.args())
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| KilnError::ToolFailure(format!("spawn worker: {err}")))?;

        // Feed the packet from a thread so a worker that never reads
        // stdin cannot deadlock the supervisor.
        let mut stdin = child.stdin.take().expect("stdin was piped");
        let packet_bytes = packet.as_bytes().to_vec();
        let writer = std::thread::spawn(move || {
            let _ = stdin.write_all(&packet_bytes);
        });

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf);
            buf
        });
        let stderr_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf);
            buf
        });

        let deadline = Instant::now() + self.timeout;
        let mut timed_out = false;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    timed_out = true;
                    let pid = Pid::from_raw(child.id() as i32);
                    if kill(pid, Signal::SIGTERM).is_err() {
                        warn!("SIGTERM failed, escalating to kill");
                    }
                    let grace_deadline = Instant::now() + self.kill_grace;
                    let status = loop {
                        if let Some(status) = child.try_wait()? {
                            break Some(status);
                        }
                        if Instant::now() >= grace_deadline {
                            let _ = child.kill();
                            break child.wait().ok();
                        }
                        std::thread::sleep(Duration::from_millis(50));
                    };
                    break status;
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        };

        let _ = writer.join();
        let stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        Ok(WorkerOutput {
            exit_code: status.and_then(|s| s.code()),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            timed_out,
        })
    }

    fn describe(&self) -> String {
        format!("{} {}", self.bin, self.args().join(" "))
    }
}
