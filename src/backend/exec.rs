use crate::error::{Error, Result};
use async_trait::async_trait;
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

#[cfg_attr(any(test, feature = "mockall"), automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion and return its stdout.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runs commands on the host, killing them once `timeout` elapses.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn redact(args: &[String]) -> String {
    args.iter()
        .map(|a| if a.starts_with("--key=") { "--key=***" } else { a.as_str() })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!("Executing command: {} {}", program, redact(args));
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(Error::DeadlineExceeded(format!(
                    "{} did not finish within {:?}",
                    program, self.timeout
                )));
            }
        };

        if !output.status.success() {
            return Err(Error::Backend(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
