// Instrument installation
//
// External commands run once with a timeout (no retries), optional stdin redirection from a file, and
// a fixed working directory. Secrets in arguments are masked before logging.

pub mod capability;
pub mod files;
pub mod orchestrator;
pub mod tools;

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use crate::utils::logging::mask_command_arg;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, for operator logs.
    pub fn combined_output(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }
}

/// One external program invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// File fed to the child's stdin (`program < file`).
    pub stdin_file: Option<PathBuf>,
    pub timeout: Duration,
    /// Label used in log lines.
    pub operation: String,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            stdin_file: None,
            timeout: Duration::from_secs(300),
            operation: operation.into(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn stdin_from(mut self, file: &Path) -> Self {
        self.stdin_file = Some(file.to_path_buf());
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = dur;
        self
    }

    fn masked_args(&self) -> String {
        self.args
            .iter()
            .map(|a| mask_command_arg(a))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Run an external command once, bounded by `spec.timeout`.
///
/// Returns captured stdout/stderr even when the exit code is non-zero (caller decides success).
/// Spawn failures and timeouts are errors; the child is killed on timeout.
pub async fn run_command(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    debug!(
        "[PHASE: installation] [STEP: cmd] run_command entered (operation={}, program={}, args=[{}], stdin={:?}, cwd={:?}, timeout_ms={})",
        spec.operation,
        spec.program,
        spec.masked_args(),
        spec.stdin_file,
        spec.working_dir,
        spec.timeout.as_millis()
    );

    let stdin = match &spec.stdin_file {
        Some(path) => {
            let file = std::fs::File::open(path).with_context(|| {
                format!(
                    "Failed to open stdin file {:?} (operation={})",
                    path, spec.operation
                )
            })?;
            Stdio::from(file)
        }
        None => Stdio::null(),
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            spec.program, spec.operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", spec.operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", spec.operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(spec.timeout, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    spec.operation, spec.program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: installation] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); killing process",
                spec.operation,
                spec.program,
                spec.timeout.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: installation] [STEP: cmd] Failed to kill timed-out process (operation={}): {}",
                    spec.operation, e
                );
            }
            anyhow::bail!(
                "Command timed out after {}ms (operation={}, program={})",
                spec.timeout.as_millis(),
                spec.operation,
                spec.program
            );
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: installation] [STEP: cmd] run_command exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        spec.operation,
        spec.program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}
