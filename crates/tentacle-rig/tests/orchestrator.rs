//! Testbed runs end to end on the simulated rig

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tentacle_rig::testbed::FlashReport;
use tentacle_rig::testing::{DutMode, Harness, ScriptedExecutor, SimBootloader, SimRig, SimTentacle, artifact};
use tentacle_rig::{
    FlashStrategy, RequiredCapabilities, RigError, RoleStatus, RunEvent, RunRequest, RunStatus,
    TentacleFilter, TentacleId, TestbedDefinition, TestbedRoleSpec,
};
use tokio::sync::broadcast;

const PYB: &str = "e46340474b4c1331";
const ESP: &str = "de646cc20b92c22f";

fn id(serial: &str) -> TentacleId {
    TentacleId::new(serial).unwrap()
}

fn rig() -> SimRig {
    SimRig::new()
        .with(
            SimTentacle::new(PYB, "1-2")
                .tags("mcu=stm32,boards=PYBV11,programmer=dfu-util")
                .bootloader(SimBootloader::Programming),
        )
        .with(SimTentacle::new(ESP, "1-3").tags("mcu=esp32,boards=ESP32_GENERIC,programmer=esptool"))
}

fn pair() -> TestbedDefinition {
    TestbedDefinition::new("pyb-esp")
        .role(TestbedRoleSpec::new("pyb", RequiredCapabilities::mcu("stm32")))
        .role(TestbedRoleSpec::new("esp", RequiredCapabilities::mcu("esp32")))
}

fn drain(events: &mut broadcast::Receiver<RunEvent>) -> Vec<RunEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn released(events: &[RunEvent]) -> Vec<String> {
    let mut roles: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::RoleReleased { role, .. } => Some(role.clone()),
            _ => None,
        })
        .collect();
    roles.sort();
    roles
}

fn all_idle(harness: &Harness) {
    for serial in [PYB, ESP] {
        let tentacle = harness.inventory.get(&id(serial)).unwrap();
        assert!(!tentacle.leased, "{serial} still leased");
        assert_eq!(harness.rig.dut_mode(&id(serial)), Some(DutMode::Off));
    }
}

#[tokio::test(start_paused = true)]
async fn test_failing_secondary_role_is_partial() {
    let harness = Harness::new(rig());
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = harness.orchestrator().build().unwrap();
    let mut events = orchestrator.subscribe();

    let executor = Arc::new(ScriptedExecutor::new().fail("esp", "wifi scan found nothing"));
    let request = RunRequest::new(pair(), executor.clone())
        .firmware("pyb", artifact(dir.path(), "pyb.dfu", "stm32").await)
        .firmware("esp", artifact(dir.path(), "esp.bin", "esp32").await);
    let result = orchestrator.execute(request).await.unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.assignments["pyb"], id(PYB));
    assert_eq!(result.assignments["esp"], id(ESP));

    let pyb = &result.roles["pyb"];
    assert_eq!(pyb.status, RoleStatus::Pass);
    match &pyb.flash {
        FlashReport::Flashed { attempts, strategy, .. } => {
            assert_eq!(*attempts, 1);
            assert_eq!(
                strategy,
                &FlashStrategy::ProgrammingTool {
                    programmer: "dfu-util".to_string()
                }
            );
        }
        other => panic!("unexpected flash report: {other:?}"),
    }

    let esp = &result.roles["esp"];
    assert_eq!(esp.status, RoleStatus::Fail);
    assert_eq!(esp.cause.as_deref(), Some("wifi scan found nothing"));
    assert!(matches!(
        &esp.flash,
        FlashReport::Flashed {
            strategy: FlashStrategy::MassStorageCopy,
            ..
        }
    ));

    all_idle(&harness);
    let seen = drain(&mut events);
    assert_eq!(released(&seen), vec!["esp".to_string(), "pyb".to_string()]);
    assert!(matches!(seen.first(), Some(RunEvent::RunStarted { .. })));
    assert!(matches!(
        seen.last(),
        Some(RunEvent::RunFinished {
            status: RunStatus::Partial,
            ..
        })
    ));
    assert_eq!(harness.rig.flashes().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failing_critical_role_fails_run() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();
    let testbed = TestbedDefinition::new("pyb-esp")
        .role(TestbedRoleSpec::new("pyb", RequiredCapabilities::mcu("stm32")))
        .role(TestbedRoleSpec::new("esp", RequiredCapabilities::mcu("esp32")).critical());

    let executor = Arc::new(ScriptedExecutor::new().fail("esp", "no response"));
    let result = orchestrator
        .execute(RunRequest::new(testbed, executor))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Fail);
    assert_eq!(result.roles["pyb"].status, RoleStatus::Pass);
    all_idle(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_all_roles_pass() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());

    let result = orchestrator
        .execute(RunRequest::new(pair(), executor.clone()))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Pass);
    assert_eq!(result.cause, None);
    assert!(result.finished_at >= result.started_at);

    let mut contexts = executor.contexts();
    contexts.sort_by(|a, b| a.role.cmp(&b.role));
    assert_eq!(contexts.len(), 2);
    assert_eq!(contexts[0].role, "esp");
    assert_eq!(contexts[0].tentacle, id(ESP));
    assert!(contexts[0].dut_tty.is_some());
    assert!(contexts[0].infra_tty.is_some());
    assert_eq!(contexts[1].run_id, result.run_id);

    let json: serde_json::Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(json["status"], "PASS");
    assert_eq!(json["roles"]["pyb"]["flash"]["result"], "skipped");
    all_idle(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_unsatisfiable_testbed_holds_no_leases() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();
    let testbed = pair().role(TestbedRoleSpec::new("second-esp", RequiredCapabilities::mcu("esp32")));

    let result = orchestrator
        .execute(RunRequest::new(testbed, Arc::new(ScriptedExecutor::new())))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::InfraError);
    assert!(result.roles.is_empty());
    assert!(result.cause.is_some());
    assert_eq!(
        harness.inventory.query(&TentacleFilter::available()).len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_flash_failure_is_retried() {
    let harness = Harness::new(rig());
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = harness.orchestrator().build().unwrap();
    let mut events = orchestrator.subscribe();
    harness.rig.fail_copy(1);

    let testbed = TestbedDefinition::new("esp")
        .role(TestbedRoleSpec::new("esp", RequiredCapabilities::mcu("esp32")));
    let request = RunRequest::new(testbed, Arc::new(ScriptedExecutor::new()))
        .firmware("esp", artifact(dir.path(), "esp.bin", "esp32").await);
    let result = orchestrator.execute(request).await.unwrap();

    assert_eq!(result.status, RunStatus::Pass);
    assert!(matches!(
        result.roles["esp"].flash,
        FlashReport::Flashed { attempts: 2, .. }
    ));
    let retries: Vec<u32> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            RunEvent::FlashAttemptFailed { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_flash_attempts_exhausted() {
    let harness = Harness::new(rig());
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = harness.orchestrator().flash_attempts(2).build().unwrap();
    harness.rig.fail_copy(5);

    let testbed = TestbedDefinition::new("esp")
        .role(TestbedRoleSpec::new("esp", RequiredCapabilities::mcu("esp32")));
    let executor = Arc::new(ScriptedExecutor::new());
    let request = RunRequest::new(testbed, executor.clone())
        .firmware("esp", artifact(dir.path(), "esp.bin", "esp32").await);
    let result = orchestrator.execute(request).await.unwrap();

    assert_eq!(result.status, RunStatus::Fail);
    let esp = &result.roles["esp"];
    assert_eq!(esp.status, RoleStatus::Fail);
    assert!(matches!(esp.flash, FlashReport::Failed { attempts: 2, .. }));
    assert!(executor.contexts().is_empty());
    assert!(!harness.inventory.get(&id(ESP)).unwrap().leased);
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_hung_role() {
    let harness = Harness::new(rig());
    let orchestrator = harness
        .orchestrator()
        .run_timeout(Duration::from_secs(120))
        .build()
        .unwrap();
    let mut events = orchestrator.subscribe();

    let executor = Arc::new(ScriptedExecutor::new().hang("esp"));
    let result = orchestrator
        .execute(RunRequest::new(pair(), executor))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.roles["pyb"].status, RoleStatus::Pass);
    let esp = &result.roles["esp"];
    assert_eq!(esp.status, RoleStatus::InfraError);
    assert_eq!(esp.cause.as_deref(), Some("cancelled by run timeout"));

    all_idle(&harness);
    assert_eq!(released(&drain(&mut events)), vec!["esp".to_string(), "pyb".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_executor_timeout_fails_role() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();
    let testbed = TestbedDefinition::new("esp")
        .role(TestbedRoleSpec::new("esp", RequiredCapabilities::mcu("esp32")));

    let request = RunRequest::new(testbed, Arc::new(ScriptedExecutor::new().hang("esp")))
        .executor_timeout(Duration::from_secs(30));
    let result = orchestrator.execute(request).await.unwrap();

    assert_eq!(result.status, RunStatus::Fail);
    let esp = &result.roles["esp"];
    assert_eq!(esp.status, RoleStatus::Fail);
    assert!(esp.cause.as_deref().unwrap_or_default().contains("executor for role esp"));
    assert!(!harness.inventory.get(&id(ESP)).unwrap().leased);
}

#[tokio::test(start_paused = true)]
async fn test_executor_error_is_infra() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();

    let executor = Arc::new(ScriptedExecutor::new().error("pyb", "serial port vanished"));
    let result = orchestrator
        .execute(RunRequest::new(pair(), executor))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.roles["pyb"].status, RoleStatus::InfraError);
    assert_eq!(result.roles["esp"].status, RoleStatus::Pass);
}

#[tokio::test(start_paused = true)]
async fn test_without_firmware_runs_installed_application() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());

    let result = orchestrator
        .execute(RunRequest::new(pair(), executor.clone()))
        .await
        .unwrap();
    for role in ["pyb", "esp"] {
        assert_eq!(result.roles[role].flash, FlashReport::Skipped);
    }
    assert!(harness.rig.flashes().is_empty());
    assert!(executor.contexts().iter().all(|c| c.firmware.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_roles_execute_in_parallel() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();

    let started = tokio::time::Instant::now();
    let result = orchestrator
        .execute(RunRequest::new(pair(), Arc::new(ScriptedExecutor::new())))
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Pass);
    let baseline = started.elapsed();

    let executor = Arc::new(ScriptedExecutor::new().delay(Duration::from_secs(10)));
    let started = tokio::time::Instant::now();
    let result = orchestrator
        .execute(RunRequest::new(pair(), executor.clone()))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(result.status, RunStatus::Pass);
    assert_eq!(executor.contexts().len(), 2);
    // Two 10s roles back to back would add 20s on top of the baseline
    assert!(elapsed >= Duration::from_secs(10), "{elapsed:?}");
    assert!(elapsed < baseline + Duration::from_secs(15), "{elapsed:?} vs {baseline:?}");
    all_idle(&harness);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_testbed_is_rejected() {
    let harness = Harness::new(rig());
    let orchestrator = harness.orchestrator().build().unwrap();

    let empty = TestbedDefinition::new("empty");
    let err = orchestrator
        .execute(RunRequest::new(empty, Arc::new(ScriptedExecutor::new())))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Config(_)));

    let duplicate = TestbedDefinition::new("dup")
        .role(TestbedRoleSpec::new("dut", RequiredCapabilities::mcu("esp32")))
        .role(TestbedRoleSpec::new("dut", RequiredCapabilities::mcu("stm32")));
    let err = orchestrator
        .execute(RunRequest::new(duplicate, Arc::new(ScriptedExecutor::new())))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::Config(_)));
}
