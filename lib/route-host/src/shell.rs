//! External command execution

use async_trait::async_trait;
use std::process::Output;
use tokio::process::Command;

use route_core::{CoreError, Result};

/// Output of one external command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> Self {
        Self {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: &str) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit into an error naming the command
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(CoreError::CommandFailed(format!("<{}>: {}", command, self.combined())))
        }
    }
}

/// Runs external commands (allows mocking in tests)
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion. Only a failure to spawn is an error;
    /// exit status is reported in the output.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands on the local host
#[derive(Clone, Debug, Default)]
pub struct ShellRunner {
    sudo: bool,
}

impl ShellRunner {
    /// Run every command through `sudo`
    pub fn sudo() -> Self {
        Self { sudo: true }
    }

    pub fn direct() -> Self {
        Self { sudo: false }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut cmd = if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        };
        let output = cmd
            .args(args)
            .output()
            .await
            .map_err(|e| CoreError::CommandFailed(format!("failed to run {}: {}", program, e)))?;
        Ok(CommandOutput::from(output))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Records command lines and replays canned outputs (success when none is queued)
    #[derive(Default)]
    pub struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        outputs: Mutex<VecDeque<CommandOutput>>,
    }

    impl RecordingRunner {
        pub fn with_outputs(outputs: Vec<CommandOutput>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                outputs: Mutex::new(outputs.into()),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let mut line = vec![program.to_string()];
            line.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(line.join(" "));
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok("")))
        }
    }
}
