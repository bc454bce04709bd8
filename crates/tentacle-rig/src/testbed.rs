//! Testbeds, run requests and run results

use crate::executor::{ExecutorReport, TestExecutor};
use crate::firmware::{FirmwareArtifact, FlashMode, FlashStrategy};
use crate::tentacle::CapabilitySet;
use crate::types::TentacleId;
use crate::{RigError, RigResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// What a role needs from the tentacle that fills it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub board: Option<String>,
    #[serde(default)]
    pub gadgets: BTreeSet<String>,
}

impl RequiredCapabilities {
    pub fn mcu(mcu: impl Into<String>) -> Self {
        Self {
            mcu: Some(mcu.into()),
            ..Default::default()
        }
    }

    pub fn board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    pub fn gadget(mut self, gadget: impl Into<String>) -> Self {
        self.gadgets.insert(gadget.into());
        self
    }

    pub fn satisfied_by(&self, caps: &CapabilitySet) -> bool {
        self.mcu
            .as_ref()
            .is_none_or(|mcu| caps.mcu.as_ref().is_some_and(|m| m.eq_ignore_ascii_case(mcu)))
            && self.board.as_ref().is_none_or(|b| caps.boards.contains(b))
            && self.gadgets.is_subset(&caps.gadgets)
    }

    /// Satisfied without extra gadgets the role does not use
    pub fn exactly_matches(&self, caps: &CapabilitySet) -> bool {
        self.satisfied_by(caps) && self.gadgets == caps.gadgets
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(mcu) = &self.mcu {
            parts.push(format!("mcu={mcu}"));
        }
        if let Some(board) = &self.board {
            parts.push(format!("board={board}"));
        }
        for gadget in &self.gadgets {
            parts.push(format!("gadget={gadget}"));
        }
        if parts.is_empty() {
            "any tentacle".to_string()
        } else {
            parts.join(",")
        }
    }
}

/// One named slot of a testbed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestbedRoleSpec {
    pub role_name: String,
    #[serde(default)]
    pub required: RequiredCapabilities,
    /// A failing critical role fails the whole run
    #[serde(default)]
    pub critical: bool,
}

impl TestbedRoleSpec {
    pub fn new(role_name: impl Into<String>, required: RequiredCapabilities) -> Self {
        Self {
            role_name: role_name.into(),
            required,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

/// Named set of roles a test run needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestbedDefinition {
    pub name: String,
    pub roles: Vec<TestbedRoleSpec>,
}

impl TestbedDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: vec![],
        }
    }

    pub fn role(mut self, role: TestbedRoleSpec) -> Self {
        self.roles.push(role);
        self
    }

    pub fn validate(&self) -> RigResult<()> {
        if self.roles.is_empty() {
            return Err(RigError::config(format!("testbed '{}' has no roles", self.name)));
        }
        let mut seen = BTreeSet::new();
        for role in &self.roles {
            if !seen.insert(role.role_name.as_str()) {
                return Err(RigError::config(format!(
                    "testbed '{}' names role '{}' twice",
                    self.name, role.role_name
                )));
            }
        }
        Ok(())
    }
}

/// Everything needed to run a testbed once
#[derive(Clone)]
pub struct RunRequest {
    pub testbed: TestbedDefinition,
    /// Firmware per role; roles without an entry run what is already flashed
    pub firmware: BTreeMap<String, FirmwareArtifact>,
    pub executor: Arc<dyn TestExecutor>,
    pub flash_mode: FlashMode,
    /// Overrides the orchestrator's executor bound
    pub executor_timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(testbed: TestbedDefinition, executor: Arc<dyn TestExecutor>) -> Self {
        Self {
            testbed,
            firmware: BTreeMap::new(),
            executor,
            flash_mode: FlashMode::Auto,
            executor_timeout: None,
        }
    }

    pub fn firmware(mut self, role: impl Into<String>, artifact: FirmwareArtifact) -> Self {
        self.firmware.insert(role.into(), artifact);
        self
    }

    pub fn flash_mode(mut self, mode: FlashMode) -> Self {
        self.flash_mode = mode;
        self
    }

    pub fn executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = Some(timeout);
        self
    }
}

/// Overall verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pass,
    Partial,
    Fail,
    InfraError,
}

/// Verdict of one role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleStatus {
    Pass,
    Fail,
    InfraError,
}

/// What happened to a role's firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FlashReport {
    /// No firmware requested for the role
    Skipped,
    Flashed {
        attempts: u32,
        strategy: FlashStrategy,
        duration_ms: u64,
    },
    Failed {
        attempts: u32,
        cause: String,
    },
}

/// Result of one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOutcome {
    pub role: String,
    pub tentacle: TentacleId,
    pub status: RoleStatus,
    pub flash: FlashReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<ExecutorReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl RoleOutcome {
    pub fn infra_error(role: &str, tentacle: &TentacleId, cause: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            tentacle: tentacle.clone(),
            status: RoleStatus::InfraError,
            flash: FlashReport::Skipped,
            executor: None,
            cause: Some(cause.into()),
        }
    }
}

/// Result of a whole run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub testbed: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Role to tentacle, empty when allocation failed
    pub assignments: BTreeMap<String, TentacleId>,
    pub roles: BTreeMap<String, RoleOutcome>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl RunResult {
    /// Overall status from role outcomes.
    ///
    /// All pass is PASS. A failed critical role is FAIL. No role passing is
    /// FAIL, or INFRA_ERROR when every role failed on infrastructure.
    /// Anything else is PARTIAL.
    pub fn summarize(roles: &BTreeMap<String, RoleOutcome>, critical: &BTreeSet<String>) -> RunStatus {
        if roles.is_empty() {
            return RunStatus::InfraError;
        }
        let passed = roles.values().filter(|r| r.status == RoleStatus::Pass).count();
        if passed == roles.len() {
            return RunStatus::Pass;
        }
        let critical_failed = roles
            .values()
            .any(|r| r.status != RoleStatus::Pass && critical.contains(&r.role));
        if passed == 0 {
            let all_infra = roles.values().all(|r| r.status == RoleStatus::InfraError);
            return if all_infra {
                RunStatus::InfraError
            } else {
                RunStatus::Fail
            };
        }
        if critical_failed {
            RunStatus::Fail
        } else {
            RunStatus::Partial
        }
    }

    pub fn to_json(&self) -> RigResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
