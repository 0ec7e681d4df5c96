//! External renewal tool invocation.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::RenewalError;

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Something that refreshes certificate files on disk.
#[async_trait]
pub trait RenewalTool: Send + Sync {
    /// Run once. Success means the files on disk are ready to be reloaded.
    async fn run(&self) -> Result<ToolOutput, RenewalError>;
}

/// Runs an external program such as `certbot renew`.
#[derive(Debug, Clone)]
pub struct CommandTool {
    program: String,
    args: Vec<String>,
}

impl CommandTool {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line with POSIX shell quoting rules.
    ///
    /// No shell is involved; quotes only group words.
    pub fn from_command_line(line: &str) -> Result<Self, RenewalError> {
        let words = shell_words::split(line).map_err(|e| RenewalError::InvalidCommand {
            message: e.to_string(),
        })?;

        let mut words = words.into_iter();
        let program = words.next().ok_or_else(|| RenewalError::InvalidCommand {
            message: "command is empty".to_string(),
        })?;
        Ok(Self::new(program, words))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl RenewalTool for CommandTool {
    async fn run(&self) -> Result<ToolOutput, RenewalError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| RenewalError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(RenewalError::ExitStatus {
                code: output.status.code(),
                stderr,
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}
