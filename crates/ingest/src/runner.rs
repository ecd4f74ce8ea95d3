use std::path::{Path, PathBuf};
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// One external program call
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Ask the OS to schedule the process with reduced priority
    pub low_priority: bool,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            low_priority: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn low_priority(mut self, low: bool) -> Self {
        self.low_priority = low;
        self
    }

    /// Command line as it would be typed, for logs
    pub fn display(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Result of running an external program
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr
    pub fn combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.stdout.len() + self.stderr.len());
        out.extend_from_slice(&self.stdout);
        out.extend_from_slice(&self.stderr);
        out
    }

    /// Turn a non-zero exit into an error carrying the tail of the output
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let combined = self.combined();
        let text = String::from_utf8_lossy(&combined);
        Err(anyhow!(
            "{} failed (exit code {}):\n{}",
            what,
            self.exit_code.unwrap_or(-1),
            tail(&text, 20)
        ))
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Executes external programs. Every ffmpeg and ffprobe call goes through this seam.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs programs on the local machine
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }

    fn build(program: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(false);
        cmd
    }

    /// `nice` wrapper on Unix, plain command elsewhere
    fn prioritized(invocation: &Invocation) -> Option<Command> {
        if !invocation.low_priority || !cfg!(unix) {
            return None;
        }
        let mut args = vec![
            "-n".to_string(),
            "19".to_string(),
            invocation.program.to_string_lossy().into_owned(),
        ];
        args.extend(invocation.args.iter().cloned());
        Some(Self::build(Path::new("nice"), &args))
    }

    async fn collect(mut cmd: Command) -> std::io::Result<CommandOutput> {
        let mut child = cmd.spawn()?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        // Drain both pipes concurrently so neither can fill up and stall the child
        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut out) = stdout {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(ref mut err) = stderr {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = child.wait().await?;
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr = stderr_handle.await.unwrap_or_default();

        Ok(CommandOutput {
            success: status.success(),
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!("Executing: {}", invocation.display());

        if let Some(cmd) = Self::prioritized(invocation) {
            match Self::collect(cmd).await {
                Ok(output) => return Ok(output),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!("nice is not available, running {} at normal priority", invocation.program.display());
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to spawn: {}", invocation.display()));
                }
            }
        }

        Self::collect(Self::build(&invocation.program, &invocation.args))
            .await
            .with_context(|| format!("Failed to spawn: {}", invocation.display()))
    }
}
