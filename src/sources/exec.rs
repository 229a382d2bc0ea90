//! Command execution seam.
//!
//! Everything the mirror does over the network goes through an external tool
//! (`ssh`, `rsync`, `scp`). The engine never spawns processes directly; it asks
//! a [`CommandRunner`], which lets tests substitute a fake remote.

use std::process::{Command, Stdio};

use thiserror::Error;

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Why a command did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The executable could not be started at all (missing binary, permissions).
    #[error("failed to execute {executable}: {message}")]
    Spawn { executable: String, message: String },

    /// The command ran and exited non-zero.
    #[error("{executable} exited with code {exit_code}: {stderr}")]
    Failed {
        executable: String,
        args: Vec<String>,
        stderr: String,
        exit_code: i32,
    },
}

impl CommandError {
    pub fn executable(&self) -> &str {
        match self {
            Self::Spawn { executable, .. } | Self::Failed { executable, .. } => executable,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { exit_code, .. } => Some(*exit_code),
            Self::Spawn { .. } => None,
        }
    }

    /// One-line description naming the tool, its stderr and its exit code.
    pub fn describe(&self) -> String {
        match self {
            Self::Spawn {
                executable,
                message,
            } => format!("{executable} could not be started: {message}"),
            Self::Failed {
                executable,
                stderr,
                exit_code,
                ..
            } => {
                let stderr = stderr.trim();
                if stderr.is_empty() {
                    format!("{executable} failed (exit code {exit_code})")
                } else {
                    format!("{executable} failed (exit code {exit_code}): {stderr}")
                }
            }
        }
    }
}

/// Runs an external program to completion.
///
/// Implementations block until the program exits. There is no timeout: a hung
/// remote tool holds the calling refresh until it returns.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        tracing::debug!(program, args = ?args, "running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CommandError::Spawn {
                executable: program.to_string(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // Killed by a signal: no code, report -1.
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(CommandError::Failed {
                executable: program.to_string(),
                args: args.to_vec(),
                stderr: stderr.trim().to_string(),
                exit_code,
            });
        }

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}
