use std::process::Stdio;
use std::time::{Duration, Instant};

use crate::errors::WatchdogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Timeout,
    Error,
}

#[derive(Debug, Clone)]
pub struct CommandReport {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

/// A user supplied program run on every switch attempt.
///
/// The command line is split shell-style but never handed to a shell.
#[derive(Debug, Clone)]
pub struct CustomCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CustomCommand {
    pub fn parse(command: &str, timeout: Duration) -> Result<Self, WatchdogError> {
        let mut words = shell_words::split(command)
            .map_err(|e| WatchdogError::InvalidCommand(format!("{command}: {e}")))?
            .into_iter();
        let program = words
            .next()
            .ok_or_else(|| WatchdogError::InvalidCommand("command is empty".to_string()))?;
        Ok(Self {
            program,
            args: words.collect(),
            timeout,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command to completion, killing it once the timeout passes.
    pub async fn run(&self) -> CommandReport {
        let started = Instant::now();
        let report = |status, exit_code, stdout: String, stderr: String| CommandReport {
            status,
            exit_code,
            stdout,
            stderr,
            runtime: started.elapsed(),
        };

        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => return report(CommandStatus::Error, None, String::new(), e.to_string()),
        };

        // Dropping the output future on timeout drops the child, which kills it
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let status = if output.status.success() {
                    CommandStatus::Success
                } else {
                    CommandStatus::Error
                };
                report(
                    status,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stdout).trim().to_string(),
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                )
            }
            Ok(Err(e)) => report(CommandStatus::Error, None, String::new(), e.to_string()),
            Err(_) => report(CommandStatus::Timeout, None, String::new(), String::new()),
        }
    }

    /// Launch the command in the background and log how it went.
    pub fn fire(&self, stream_id: &str) {
        let command = self.clone();
        let stream_id = stream_id.to_string();
        log::info!("[{}] Executing custom command: {}", stream_id, command.program);
        tokio::spawn(async move {
            let report = command.run().await;
            match report.status {
                CommandStatus::Success => {
                    log::info!(
                        "[{}] Custom command finished in {:.2}s: {}",
                        stream_id,
                        report.runtime.as_secs_f64(),
                        report.stdout
                    );
                }
                CommandStatus::Timeout => {
                    log::warn!(
                        "[{}] Custom command killed after {}s timeout",
                        stream_id,
                        command.timeout.as_secs()
                    );
                }
                CommandStatus::Error => {
                    log::error!(
                        "[{}] Custom command failed (exit code {:?}): {}",
                        stream_id,
                        report.exit_code,
                        report.stderr
                    );
                }
            }
        });
    }
}
