//! Hand-off to the tester's test code

use crate::firmware::FirmwareArtifact;
use crate::process::{self, CommandSpec};
use crate::tentacle::Capabilities;
use crate::types::{TentacleId, UsbPortPath};
use crate::RigResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Everything a test needs to reach a running tentacle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorContext {
    pub run_id: Uuid,
    pub role: String,
    pub tentacle: TentacleId,
    pub infra_tty: Option<PathBuf>,
    pub dut_tty: Option<PathBuf>,
    pub dut_port: Option<UsbPortPath>,
    /// Artifact flashed for this run, `None` when the installed firmware was kept
    pub firmware: Option<FirmwareArtifact>,
    pub capabilities: Capabilities,
}

/// What the test code reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub log: String,
}

impl ExecutorReport {
    pub fn pass(summary: impl Into<String>) -> Self {
        Self {
            passed: true,
            summary: summary.into(),
            log: String::new(),
        }
    }

    pub fn fail(summary: impl Into<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            log: String::new(),
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// Runs tests against a flashed, running tentacle.
///
/// An `Err` means the test could not be run at all; a test that ran and
/// failed is `Ok` with `passed == false`.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, context: &ExecutorContext) -> RigResult<ExecutorReport>;
}

/// Runs a host command per role; exit status 0 is a pass.
///
/// The tentacle is described through `TENTACLE_SERIAL`, `TENTACLE_ROLE`,
/// `DUT_TTY`, `INFRA_TTY`, `FIRMWARE_PATH` and `RUN_ID`.
#[derive(Debug, Clone)]
pub struct CommandTestExecutor {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    timeout: Duration,
}

impl CommandTestExecutor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            cwd: None,
            timeout,
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

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn command(&self, context: &ExecutorContext) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program, self.timeout)
            .args(self.args.iter().cloned())
            .env("TENTACLE_SERIAL", context.tentacle.as_str())
            .env("TENTACLE_ROLE", &context.role)
            .env("RUN_ID", context.run_id.to_string());
        if let Some(tty) = &context.dut_tty {
            spec = spec.env("DUT_TTY", tty.display().to_string());
        }
        if let Some(tty) = &context.infra_tty {
            spec = spec.env("INFRA_TTY", tty.display().to_string());
        }
        if let Some(firmware) = &context.firmware {
            spec = spec.env("FIRMWARE_PATH", firmware.path.display().to_string());
        }
        if let Some(dir) = &self.cwd {
            spec = spec.cwd(dir);
        }
        spec
    }
}

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn execute(&self, context: &ExecutorContext) -> RigResult<ExecutorReport> {
        let spec = self.command(context);
        let output = process::run(&spec).await?;
        let summary = match output.exit_code {
            Some(0) => format!("{} passed", self.program),
            Some(code) => format!("{} exited with {code}", self.program),
            None => format!("{} was killed", self.program),
        };
        let mut log = output.stdout;
        if !output.stderr.is_empty() {
            log.push_str(&output.stderr);
        }
        Ok(ExecutorReport {
            passed: output.exit_code == Some(0),
            summary,
            log,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> ExecutorContext {
        ExecutorContext {
            run_id: Uuid::nil(),
            role: "dut".to_string(),
            tentacle: TentacleId::new("e46340474b4c1331").unwrap(),
            infra_tty: None,
            dut_tty: Some(PathBuf::from("/dev/ttyACM3")),
            dut_port: None,
            firmware: None,
            capabilities: Capabilities::Unknown,
        }
    }

    #[tokio::test]
    async fn test_command_executor_pass() {
        let executor = CommandTestExecutor::new("sh", Duration::from_secs(10))
            .args(["-c", "echo $TENTACLE_ROLE $DUT_TTY"]);
        let report = executor.execute(&context()).await.unwrap();
        assert!(report.passed);
        assert_eq!(report.log.trim(), "dut /dev/ttyACM3");
    }

    #[tokio::test]
    async fn test_command_executor_fail() {
        let executor = CommandTestExecutor::new("sh", Duration::from_secs(10))
            .args(["-c", "echo broken >&2; exit 2"]);
        let report = executor.execute(&context()).await.unwrap();
        assert!(!report.passed);
        assert_eq!(report.summary, "sh exited with 2");
        assert_eq!(report.log.trim(), "broken");
    }
}
