//! Subprocess execution abstraction.
//!
//! The local enforcement plane mutates nftables state through the `nft`
//! binary. Wrapping the invocation in a trait lets unit tests script
//! subsystem responses (exit codes, stderr idempotency markers) without
//! touching the host firewall.

use anyhow::Result;
use std::process::{Command, Stdio};

#[cfg(test)]
use mockall::automock;

/// Output from a finished subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code 0.
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    /// Build a successful output carrying `stdout`; test scaffolding.
    #[cfg(test)]
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
            code: Some(0),
        }
    }

    /// Build a failed output carrying `stderr`; test scaffolding.
    #[cfg(test)]
    pub fn fail(stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
            code: Some(1),
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
///
/// Arguments are `&[String]` rather than `&[&str]` because mockall cannot
/// express the nested lifetimes of the latter.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Executor that runs real system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
            code: output.status.code(),
        })
    }
}

/// Convert a borrowed argument list into the owned form the trait takes.
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
