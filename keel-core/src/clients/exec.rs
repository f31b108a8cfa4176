//! Thin runner around provider command line tools.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// A provider CLI (hcloud, az, op, ssh-keygen).
#[derive(Debug, Clone)]
pub struct Tool {
    program: String,
    service: &'static str,
}

impl Tool {
    pub fn new(program: impl Into<String>, service: &'static str) -> Self {
        Self {
            program: program.into(),
            service,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    fn command<I, S>(&self, args: I) -> (Command, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|a| a.as_ref().to_string()).collect();
        let mut cmd = Command::new(&self.program);
        cmd.args(&args).kill_on_drop(true);
        (cmd, args)
    }

    /// Run the tool; a non-zero exit is returned, not turned into an error.
    pub async fn run<I, S>(&self, args: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (mut cmd, args) = self.command(args);
        debug!("Running {} {}", self.program, args.join(" "));

        let output = cmd
            .output()
            .await
            .map_err(|e| self.error(format!("failed to run {}: {}", self.program, e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run the tool with `input` piped to stdin. Keeps secrets out of argv.
    pub async fn run_with_stdin<I, S>(&self, args: I, input: &str) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (mut cmd, args) = self.command(args);
        debug!("Running {} {} (stdin payload)", self.program, args.join(" "));

        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.error(format!("failed to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| self.error(format!("failed to write stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.error(format!("failed to wait for {}: {}", self.program, e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run the tool and fail on a non-zero exit. Returns stdout.
    pub async fn run_checked<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let output = self.run(args).await?;
        self.check(output)
    }

    /// Run the tool and decode its stdout as JSON.
    pub async fn run_json<T, I, S>(&self, args: I) -> Result<T>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stdout = self.run_checked(args).await?;
        self.parse_json(&stdout)
    }

    pub fn check(&self, output: CommandOutput) -> Result<String> {
        if !output.success {
            return Err(self.error(output.stderr.trim().to_string()));
        }
        Ok(output.stdout)
    }

    pub fn parse_json<T: DeserializeOwned>(&self, stdout: &str) -> Result<T> {
        if stdout.trim().is_empty() {
            return Err(self.error("empty response"));
        }
        serde_json::from_str(stdout).map_err(|e| self.error(format!("malformed response: {}", e)))
    }

    pub fn error(&self, message: impl Into<String>) -> ProvisionError {
        ProvisionError::external(self.service, message)
    }
}
