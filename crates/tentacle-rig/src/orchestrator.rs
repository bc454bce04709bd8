//! Run orchestrator
//!
//! Allocates tentacles for every role of a testbed, drives each one through
//! bootloader, flash and test execution in its own task, and hands every
//! tentacle back powered to idle whatever happened.

use crate::bootmode::BootModeSequencer;
use crate::config::OrchestratorSettings;
use crate::executor::{ExecutorContext, TestExecutor};
use crate::firmware::{FirmwareArtifact, FirmwareFlasher, FlashMode};
use crate::inventory::{Inventory, TentacleFilter};
use crate::tentacle::{BootState, Tentacle, TentacleLease};
use crate::testbed::{
    FlashReport, RoleOutcome, RoleStatus, RunRequest, RunResult, RunStatus, TestbedDefinition,
    TestbedRoleSpec,
};
use crate::topology::UsbDevice;
use crate::types::TentacleId;
use crate::{RigError, RigResult};
use chrono::Utc;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Flash attempts per role, counting the first
    pub flash_attempts: u32,
    /// Bound on a whole run
    pub run_timeout: Option<Duration>,
    /// Bound on one executor call unless the request sets its own
    pub executor_timeout: Option<Duration>,
    /// Rescan USB before allocating
    pub refresh_before_allocation: bool,
    /// Event channel buffer size
    pub event_buffer_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&OrchestratorSettings::default())
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &OrchestratorSettings) -> Self {
        Self {
            flash_attempts: settings.flash_attempts,
            run_timeout: settings.run_timeout_ms.map(Duration::from_millis),
            executor_timeout: settings.executor_timeout_ms.map(Duration::from_millis),
            refresh_before_allocation: settings.refresh_before_allocation,
            event_buffer_size: 1000,
        }
    }
}

/// Progress of runs, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        testbed: String,
    },
    RoleAllocated {
        run_id: Uuid,
        role: String,
        tentacle: TentacleId,
    },
    BootloaderEntered {
        run_id: Uuid,
        role: String,
        state: BootState,
    },
    FlashAttemptFailed {
        run_id: Uuid,
        role: String,
        attempt: u32,
        cause: String,
    },
    Flashed {
        run_id: Uuid,
        role: String,
        attempts: u32,
    },
    ExecutorFinished {
        run_id: Uuid,
        role: String,
        passed: bool,
    },
    RoleReleased {
        run_id: Uuid,
        role: String,
        tentacle: TentacleId,
    },
    RunFinished {
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Executes testbed runs against the inventory
pub struct RunOrchestrator {
    config: OrchestratorConfig,
    inventory: Arc<Inventory>,
    sequencer: Arc<BootModeSequencer>,
    flasher: Arc<FirmwareFlasher>,
    event_tx: broadcast::Sender<RunEvent>,
}

impl RunOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        inventory: Arc<Inventory>,
        sequencer: Arc<BootModeSequencer>,
        flasher: Arc<FirmwareFlasher>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_buffer_size);
        Self {
            config,
            inventory,
            sequencer,
            flasher,
            event_tx,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Arc<Inventory> {
        &self.inventory
    }

    /// Subscribe to run events
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: RunEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    /// Pick a tentacle for every role without leasing anything.
    ///
    /// Candidates are available tentacles with known capabilities. Exact
    /// matches are preferred over tentacles carrying unused gadgets, then
    /// ascending id.
    pub fn allocate(&self, testbed: &TestbedDefinition) -> RigResult<BTreeMap<String, TentacleId>> {
        let candidates = self.inventory.query(&TentacleFilter::available());
        allocate_roles(&testbed.roles, &candidates)
    }

    /// Run a testbed once.
    ///
    /// Fails only for an invalid testbed. Allocation and infrastructure
    /// problems come back as an `INFRA_ERROR` result.
    pub async fn execute(&self, request: RunRequest) -> RigResult<RunResult> {
        request.testbed.validate()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, testbed = %request.testbed.name);
        self.execute_run(run_id, request).instrument(span).await
    }

    async fn execute_run(&self, run_id: Uuid, request: RunRequest) -> RigResult<RunResult> {
        let started_at = Utc::now();
        info!(roles = request.testbed.roles.len(), "run started");
        self.emit(RunEvent::RunStarted {
            run_id,
            testbed: request.testbed.name.clone(),
        });

        let (assignments, leases) = match self.allocate_and_lease(&request.testbed).await {
            Ok(allocated) => allocated,
            Err(err) => {
                warn!(%err, "allocation failed");
                let result = RunResult {
                    run_id,
                    testbed: request.testbed.name.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    assignments: BTreeMap::new(),
                    roles: BTreeMap::new(),
                    status: RunStatus::InfraError,
                    cause: Some(err.to_string()),
                };
                self.emit(RunEvent::RunFinished {
                    run_id,
                    status: result.status,
                });
                return Ok(result);
            }
        };

        let mut leases: BTreeMap<TentacleId, TentacleLease> =
            leases.into_iter().map(|lease| (lease.id().clone(), lease)).collect();
        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(assignments.len());
        for role in &request.testbed.roles {
            let Some(id) = assignments.get(&role.role_name) else {
                continue;
            };
            let Some(lease) = leases.remove(id) else {
                continue;
            };
            self.emit(RunEvent::RoleAllocated {
                run_id,
                role: role.role_name.clone(),
                tentacle: id.clone(),
            });
            let job = RoleJob {
                run_id,
                role: role.role_name.clone(),
                firmware: request.firmware.get(&role.role_name).cloned(),
                flash_mode: request.flash_mode,
                executor: request.executor.clone(),
                executor_timeout: request.executor_timeout.or(self.config.executor_timeout),
            };
            let span = info_span!("role", role = %job.role, tentacle = %id);
            handles.push(tokio::spawn(
                self.worker().run(job, lease, cancel.clone()).instrument(span),
            ));
        }

        let joined = join_all(handles);
        let finished = match self.config.run_timeout {
            Some(limit) => {
                tokio::pin!(joined);
                tokio::select! {
                    finished = &mut joined => finished,
                    _ = tokio::time::sleep(limit) => {
                        warn!(timeout = ?limit, "run timed out, cancelling pending roles");
                        cancel.cancel();
                        joined.await
                    }
                }
            }
            None => joined.await,
        };

        let mut roles = BTreeMap::new();
        for joined in finished {
            match joined {
                Ok(outcome) => {
                    roles.insert(outcome.role.clone(), outcome);
                }
                Err(err) => error!(%err, "role task failed"),
            }
        }
        // A role whose task died outright still gets a verdict
        for (role, id) in &assignments {
            roles
                .entry(role.clone())
                .or_insert_with(|| RoleOutcome::infra_error(role, id, "role task failed"));
        }

        let critical: BTreeSet<String> = request
            .testbed
            .roles
            .iter()
            .filter(|r| r.critical)
            .map(|r| r.role_name.clone())
            .collect();
        let status = RunResult::summarize(&roles, &critical);
        info!(?status, "run finished");
        self.emit(RunEvent::RunFinished { run_id, status });

        Ok(RunResult {
            run_id,
            testbed: request.testbed.name.clone(),
            started_at,
            finished_at: Utc::now(),
            assignments,
            roles,
            status,
            cause: None,
        })
    }

    async fn allocate_and_lease(
        &self,
        testbed: &TestbedDefinition,
    ) -> RigResult<(BTreeMap<String, TentacleId>, Vec<TentacleLease>)> {
        if self.config.refresh_before_allocation {
            self.inventory.refresh().await?;
        }
        let assignments = self.allocate(testbed)?;
        let ids: Vec<TentacleId> = assignments.values().cloned().collect();
        let leases = self.inventory.acquire_all(&ids)?;
        Ok((assignments, leases))
    }

    fn worker(&self) -> RoleWorker {
        RoleWorker {
            inventory: self.inventory.clone(),
            sequencer: self.sequencer.clone(),
            flasher: self.flasher.clone(),
            event_tx: self.event_tx.clone(),
            flash_attempts: self.config.flash_attempts.max(1),
        }
    }
}

/// Backtracking search over roles in definition order
fn allocate_roles(
    roles: &[TestbedRoleSpec],
    candidates: &[Tentacle],
) -> RigResult<BTreeMap<String, TentacleId>> {
    fn search<'a>(
        roles: &[TestbedRoleSpec],
        options: &[Vec<&'a TentacleId>],
        used: &mut BTreeSet<&'a TentacleId>,
        chosen: &mut Vec<&'a TentacleId>,
    ) -> bool {
        let index = chosen.len();
        if index == roles.len() {
            return true;
        }
        for &id in &options[index] {
            if !used.insert(id) {
                continue;
            }
            chosen.push(id);
            if search(roles, options, used, chosen) {
                return true;
            }
            chosen.pop();
            used.remove(id);
        }
        false
    }

    let mut options = Vec::with_capacity(roles.len());
    for role in roles {
        let mut matching: Vec<(bool, &TentacleId)> = candidates
            .iter()
            .filter_map(|t| {
                let caps = t.capabilities.known()?;
                role.required
                    .satisfied_by(caps)
                    .then(|| (!role.required.exactly_matches(caps), &t.id))
            })
            .collect();
        if matching.is_empty() {
            return Err(RigError::unsatisfiable(
                &role.role_name,
                format!("no available tentacle with {}", role.required.describe()),
            ));
        }
        matching.sort();
        options.push(matching.into_iter().map(|(_, id)| id).collect::<Vec<_>>());
    }

    let mut chosen = Vec::with_capacity(roles.len());
    if !search(roles, &options, &mut BTreeSet::new(), &mut chosen) {
        let role = roles.last().map(|r| r.role_name.as_str()).unwrap_or_default();
        return Err(RigError::unsatisfiable(
            role,
            "not enough distinct tentacles for all roles",
        ));
    }
    Ok(roles
        .iter()
        .zip(chosen)
        .map(|(role, id)| (role.role_name.clone(), id.clone()))
        .collect())
}

struct RoleJob {
    run_id: Uuid,
    role: String,
    firmware: Option<FirmwareArtifact>,
    flash_mode: FlashMode,
    executor: Arc<dyn TestExecutor>,
    executor_timeout: Option<Duration>,
}

/// Hands its lease back to the inventory when dropped, also on unwind or abort
struct HeldLease {
    inventory: Arc<Inventory>,
    lease: TentacleLease,
}

impl HeldLease {
    fn new(inventory: Arc<Inventory>, lease: TentacleLease) -> Self {
        Self { inventory, lease }
    }
}

impl Deref for HeldLease {
    type Target = TentacleLease;

    fn deref(&self) -> &TentacleLease {
        &self.lease
    }
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        self.inventory.release_in_place(&mut self.lease);
    }
}

/// Everything one role task needs, detached from the orchestrator
struct RoleWorker {
    inventory: Arc<Inventory>,
    sequencer: Arc<BootModeSequencer>,
    flasher: Arc<FirmwareFlasher>,
    event_tx: broadcast::Sender<RunEvent>,
    flash_attempts: u32,
}

impl RoleWorker {
    fn emit(&self, event: RunEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Drive one role, then power down and release no matter what
    async fn run(self, job: RoleJob, lease: TentacleLease, cancel: CancellationToken) -> RoleOutcome {
        let lease = HeldLease::new(self.inventory.clone(), lease);
        let outcome = {
            let work = AssertUnwindSafe(self.drive(&job, &lease)).catch_unwind();
            tokio::select! {
                finished = work => finished.unwrap_or_else(|_| {
                    error!("role task panicked");
                    RoleOutcome::infra_error(&job.role, lease.id(), "role task panicked")
                }),
                _ = cancel.cancelled() => {
                    warn!("role cancelled by run timeout");
                    RoleOutcome::infra_error(&job.role, lease.id(), "cancelled by run timeout")
                }
            }
        };

        self.power_down(&lease).await;
        let tentacle = lease.id().clone();
        drop(lease);
        self.emit(RunEvent::RoleReleased {
            run_id: job.run_id,
            role: job.role,
            tentacle,
        });
        info!(status = ?outcome.status, "role finished");
        outcome
    }

    async fn power_down(&self, lease: &TentacleLease) {
        let powered_off = match self.sequencer.begin(lease) {
            Ok(mut session) => session.force_power_off().await,
            Err(err) => Err(err),
        };
        if let Err(err) = powered_off {
            error!(%err, "could not power tentacle to idle");
        }
    }

    async fn drive(&self, job: &RoleJob, lease: &TentacleLease) -> RoleOutcome {
        let mut outcome = RoleOutcome {
            role: job.role.clone(),
            tentacle: lease.id().clone(),
            status: RoleStatus::Fail,
            flash: FlashReport::Skipped,
            executor: None,
            cause: None,
        };

        let dut = match &job.firmware {
            Some(artifact) => match self.flash_with_retry(job, lease, artifact).await {
                Ok((dut, report)) => {
                    outcome.flash = report;
                    dut
                }
                Err((err, attempts)) => {
                    outcome.flash = FlashReport::Failed {
                        attempts,
                        cause: err.to_string(),
                    };
                    return failed(outcome, &err);
                }
            },
            None => match self.boot_installed(lease).await {
                Ok(dut) => dut,
                Err(err) => return failed(outcome, &err),
            },
        };

        let context = ExecutorContext {
            run_id: job.run_id,
            role: job.role.clone(),
            tentacle: lease.id().clone(),
            infra_tty: lease.port().and_then(|p| p.infra_tty.clone()),
            dut_tty: dut.tty.clone(),
            dut_port: Some(dut.port.clone()),
            firmware: job.firmware.clone(),
            capabilities: lease.capabilities().clone(),
        };
        info!(executor = job.executor.name(), "handing over to executor");
        let executed = match job.executor_timeout {
            Some(limit) => tokio::time::timeout(limit, job.executor.execute(&context))
                .await
                .unwrap_or_else(|_| Err(RigError::timeout(format!("executor for role {}", job.role), limit))),
            None => job.executor.execute(&context).await,
        };

        match executed {
            Ok(report) => {
                self.emit(RunEvent::ExecutorFinished {
                    run_id: job.run_id,
                    role: job.role.clone(),
                    passed: report.passed,
                });
                if report.passed {
                    outcome.status = RoleStatus::Pass;
                } else {
                    outcome.cause = Some(report.summary.clone());
                }
                outcome.executor = Some(report);
                outcome
            }
            Err(err) => failed(outcome, &err),
        }
    }

    /// Bootloader plus flash, retried on transient failures
    async fn flash_with_retry(
        &self,
        job: &RoleJob,
        lease: &TentacleLease,
        artifact: &FirmwareArtifact,
    ) -> Result<(UsbDevice, FlashReport), (RigError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut session = self.sequencer.begin(lease).map_err(|err| (err, attempt))?;
            let flashed = match session.enter_bootloader().await {
                Ok(state) => {
                    self.emit(RunEvent::BootloaderEntered {
                        run_id: job.run_id,
                        role: job.role.clone(),
                        state,
                    });
                    self.flasher.flash(&mut session, artifact, job.flash_mode).await
                }
                Err(err) => Err(err),
            };
            match flashed {
                Ok(flashed) => {
                    self.emit(RunEvent::Flashed {
                        run_id: job.run_id,
                        role: job.role.clone(),
                        attempts: attempt,
                    });
                    let report = FlashReport::Flashed {
                        attempts: attempt,
                        strategy: flashed.strategy,
                        duration_ms: flashed.duration_ms,
                    };
                    return Ok((flashed.device, report));
                }
                Err(err) if err.is_transient() && attempt < self.flash_attempts => {
                    warn!(attempt, %err, "flash attempt failed, retrying");
                    self.emit(RunEvent::FlashAttemptFailed {
                        run_id: job.run_id,
                        role: job.role.clone(),
                        attempt,
                        cause: err.to_string(),
                    });
                }
                Err(err) => return Err((err, attempt)),
            }
        }
    }

    /// Power up into whatever firmware is installed
    async fn boot_installed(&self, lease: &TentacleLease) -> RigResult<UsbDevice> {
        let mut session = self.sequencer.begin(lease)?;
        session.exit_bootloader().await
    }
}

fn failed(mut outcome: RoleOutcome, err: &RigError) -> RoleOutcome {
    outcome.status = if err.is_infra() {
        RoleStatus::InfraError
    } else {
        RoleStatus::Fail
    };
    outcome.cause = Some(err.to_string());
    outcome
}

/// Builder for RunOrchestrator
pub struct RunOrchestratorBuilder {
    config: OrchestratorConfig,
    inventory: Option<Arc<Inventory>>,
    sequencer: Option<Arc<BootModeSequencer>>,
    flasher: Option<Arc<FirmwareFlasher>>,
}

impl RunOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            inventory: None,
            sequencer: None,
            flasher: None,
        }
    }

    /// Take bounds and policies from configuration
    pub fn settings(mut self, settings: &OrchestratorSettings) -> Self {
        let buffer = self.config.event_buffer_size;
        self.config = OrchestratorConfig::from_settings(settings);
        self.config.event_buffer_size = buffer;
        self
    }

    pub fn flash_attempts(mut self, attempts: u32) -> Self {
        self.config.flash_attempts = attempts;
        self
    }

    pub fn run_timeout(mut self, timeout: Duration) -> Self {
        self.config.run_timeout = Some(timeout);
        self
    }

    pub fn executor_timeout(mut self, timeout: Duration) -> Self {
        self.config.executor_timeout = Some(timeout);
        self
    }

    pub fn refresh_before_allocation(mut self, enabled: bool) -> Self {
        self.config.refresh_before_allocation = enabled;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn inventory(mut self, inventory: Arc<Inventory>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    pub fn sequencer(mut self, sequencer: Arc<BootModeSequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn flasher(mut self, flasher: Arc<FirmwareFlasher>) -> Self {
        self.flasher = Some(flasher);
        self
    }

    pub fn build(self) -> RigResult<RunOrchestrator> {
        let inventory = self
            .inventory
            .ok_or_else(|| RigError::config("inventory required"))?;
        let sequencer = self
            .sequencer
            .ok_or_else(|| RigError::config("boot mode sequencer required"))?;
        let flasher = self
            .flasher
            .ok_or_else(|| RigError::config("firmware flasher required"))?;
        if self.config.event_buffer_size == 0 {
            return Err(RigError::config("event buffer size must be positive"));
        }
        Ok(RunOrchestrator::new(self.config, inventory, sequencer, flasher))
    }
}

impl Default for RunOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
