use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Context, Result};
use tracing::debug;

pub const SUDO: &str = "/usr/bin/sudo";

/// An external command, optionally run with elevated privilege and fed stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemCommand {
    pub program: String,
    pub args: Vec<String>,
    pub sudo: bool,
    pub input: Option<Vec<u8>>,
}

impl SystemCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            sudo: false,
            input: None,
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

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn input(mut self, input: Vec<u8>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        if self.sudo {
            parts.push(SUDO.to_string());
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait SystemExecutor: Send + Sync {
    fn run(&self, command: &SystemCommand) -> Result<CommandOutput>;

    /// Runs `command` and fails unless it exits successfully.
    fn run_checked(&self, command: &SystemCommand) -> Result<String> {
        let output = self.run(command)?;
        if output.success {
            return Ok(output.stdout);
        }
        Err(anyhow!(
            "command failed: {}: stdout='{}' stderr='{}'",
            command.display(),
            output.stdout.trim(),
            output.stderr.trim()
        ))
    }
}

/// Spawns real processes. With `use_sudo` off, elevated commands run as the
/// current user.
#[derive(Debug, Clone, Copy)]
pub struct ProcessExecutor {
    use_sudo: bool,
}

impl ProcessExecutor {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SystemExecutor for ProcessExecutor {
    fn run(&self, command: &SystemCommand) -> Result<CommandOutput> {
        let mut process = if command.sudo && self.use_sudo {
            let mut process = Command::new(SUDO);
            process.arg("-E").arg("--").arg(&command.program);
            process
        } else {
            Command::new(&command.program)
        };
        process.args(&command.args);
        process.stdout(Stdio::piped()).stderr(Stdio::piped());
        if command.input.is_some() {
            process.stdin(Stdio::piped());
        }

        debug!(command = %command.display(), "running");
        let mut child = process
            .spawn()
            .with_context(|| format!("failed to start {}", command.display()))?;
        if let Some(input) = &command.input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin unavailable for {}", command.display()))?;
            stdin
                .write_all(input)
                .with_context(|| format!("failed writing stdin of {}", command.display()))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed waiting for {}", command.display()))?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn run_command(command: &mut Command, context_message: &str) -> Result<()> {
    let output = command
        .output()
        .with_context(|| format!("{context_message}: command failed to start"))?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    Err(anyhow!(
        "{context_message}: status={} stdout='{}' stderr='{}'",
        output.status,
        stdout.trim(),
        stderr.trim()
    ))
}
