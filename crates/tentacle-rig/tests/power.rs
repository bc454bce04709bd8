//! Rail switching against the simulated rig

use pretty_assertions::assert_eq;
use std::time::Duration;
use tentacle_rig::rail::{BoardId, RailAddress};
use tentacle_rig::testing::{DutMode, Harness, SimRig, SimTentacle};
use tentacle_rig::{HardwareRevision, Rail, RelayAssignment, RigError, TentacleId};

const T1: &str = "e46340474b4c1331";
const T2: &str = "de646cc20b92c22f";

fn id(serial: &str) -> TentacleId {
    TentacleId::new(serial).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_set_rails_is_idempotent() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();
    let before = harness.rig.batches().len();

    harness.power.set_rails(&lease, &[(Rail::Dut, true)]).await.unwrap();
    harness.power.set_rails(&lease, &[(Rail::Dut, true)]).await.unwrap();

    let batches = harness.rig.batches();
    assert_eq!(batches.len(), before + 1);
    assert_eq!(batches[before], (BoardId::Hub(id(T1)), vec![(3, true)]));
    assert_eq!(harness.power.rail_states(&id(T1))[&Rail::Dut], true);

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_rail_name_touches_nothing() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();
    let before = harness.rig.batches().len();

    let err = harness
        .power
        .set_rails_by_name(&lease, &[("dut", true), ("vbus", true)])
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::UnknownRail(name) if name == "vbus"));
    assert_eq!(harness.rig.batches().len(), before);

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_rail_missing_on_revision() {
    let tentacle = SimTentacle::new(T1, "1-2").revision(HardwareRevision::V03);
    let harness = Harness::new(SimRig::new().with(tentacle));
    let lease = harness.lease(&id(T1)).await.unwrap();

    let err = harness
        .power
        .set_rails(&lease, &[(Rail::ProbeRun, true)])
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::UnknownRail(_)));

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_board_leaves_batch_unapplied() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();
    assert_eq!(harness.rig.channel(&BoardId::Hub(id(T1)), 3), Some(false));

    harness.rig.disconnect_board(BoardId::Infra(id(T1)));
    let err = harness
        .power
        .set_rails(&lease, &[(Rail::Dut, true), (Rail::Relay(2), true)])
        .await
        .unwrap_err();
    assert!(err.is_infra());

    // The hub half of the batch went out first and was undone
    assert_eq!(harness.rig.channel(&BoardId::Hub(id(T1)), 3), Some(false));
    assert_eq!(harness.rig.channel(&BoardId::Infra(id(T1)), 2), Some(false));
    assert_eq!(harness.power.rail_states(&id(T1))[&Rail::Dut], false);

    harness.rig.reconnect_board(&BoardId::Infra(id(T1)));
    harness
        .power
        .set_rails(&lease, &[(Rail::Dut, true), (Rail::Relay(2), true)])
        .await
        .unwrap();
    assert_eq!(harness.rig.channel(&BoardId::Hub(id(T1)), 3), Some(true));
    assert_eq!(harness.rig.channel(&BoardId::Infra(id(T1)), 2), Some(true));

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_idle_preset() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();

    harness
        .power
        .set_rails(&lease, &[(Rail::Dut, true), (Rail::Relay(1), true), (Rail::Leds, true)])
        .await
        .unwrap();
    harness.power.idle(&lease).await.unwrap();

    let hub = BoardId::Hub(id(T1));
    let infra = BoardId::Infra(id(T1));
    // v0.4: probe on port 1, infra on 2, DUT on 3, infra boot on 4 (active low)
    assert_eq!(harness.rig.channel(&hub, 1), Some(true));
    assert_eq!(harness.rig.channel(&hub, 2), Some(true));
    assert_eq!(harness.rig.channel(&hub, 3), Some(false));
    assert_eq!(harness.rig.channel(&hub, 4), Some(true));
    assert_eq!(harness.rig.channel(&infra, 1), Some(false));
    assert_eq!(harness.rig.channel(&infra, 0), Some(false));

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_batches_on_separate_tentacles() {
    let rig = SimRig::new()
        .with(SimTentacle::new(T1, "1-2"))
        .with(SimTentacle::new(T2, "1-3"));
    let harness = Harness::new(rig);
    harness.inventory.refresh().await.unwrap();
    let leases = harness.inventory.acquire_all(&[id(T2), id(T1)]).unwrap();
    assert_eq!(leases[0].id(), &id(T2));

    let (a, b) = tokio::join!(
        harness.power.set_rails(&leases[0], &[(Rail::Dut, true), (Rail::Relay(3), true)]),
        harness.power.set_rails(&leases[1], &[(Rail::Dut, true), (Rail::Relay(3), true)]),
    );
    a.unwrap();
    b.unwrap();
    for serial in [T1, T2] {
        assert_eq!(harness.rig.channel(&BoardId::Hub(id(serial)), 3), Some(true));
        assert_eq!(harness.rig.channel(&BoardId::Infra(id(serial)), 3), Some(true));
    }

    for lease in leases {
        harness.inventory.release(lease);
    }
}

#[tokio::test(start_paused = true)]
async fn test_all_off_drops_tentacle_from_usb() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();

    harness.power.all_off(&lease).await.unwrap();
    let hub = BoardId::Hub(id(T1));
    assert_eq!(harness.rig.channel(&hub, 2), Some(false));
    assert_eq!(harness.rig.channel(&hub, 3), Some(false));

    let report = harness.inventory.refresh().await.unwrap();
    assert_eq!(report.missing, vec![id(T1)]);

    harness.power.idle(&lease).await.unwrap();
    let report = harness.inventory.refresh().await.unwrap();
    assert_eq!(report.visible, vec![id(T1)]);

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_idle_after_hub_reset_cuts_dut_again() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();
    let hub = BoardId::Hub(id(T1));

    harness.power.idle(&lease).await.unwrap();
    assert_eq!(harness.rig.channel(&hub, 3), Some(false));
    assert_eq!(harness.rig.dut_mode(&id(T1)), Some(DutMode::Off));

    // Hub power-cycled outside the controller
    harness.rig.reset_hub(&id(T1));
    assert_eq!(harness.rig.channel(&hub, 3), Some(true));
    assert_eq!(harness.rig.dut_mode(&id(T1)), Some(DutMode::Application));

    harness.power.idle(&lease).await.unwrap();
    assert_eq!(harness.rig.channel(&hub, 3), Some(false));
    assert_eq!(harness.rig.dut_mode(&id(T1)), Some(DutMode::Off));

    harness.inventory.release(lease);
}

#[tokio::test(start_paused = true)]
async fn test_vanished_tentacle_rail_states_dropped() {
    let harness = Harness::new(SimRig::new().with(SimTentacle::new(T1, "1-2")));
    let lease = harness.lease(&id(T1)).await.unwrap();
    harness.power.set_rails(&lease, &[(Rail::Dut, true)]).await.unwrap();
    harness.inventory.release(lease);
    assert!(!harness.power.rail_states(&id(T1)).is_empty());

    harness.rig.unplug(&id(T1));
    let report = harness.inventory.refresh().await.unwrap();
    assert_eq!(report.missing, vec![id(T1)]);
    assert!(harness.power.rail_states(&id(T1)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shared_board_batches_do_not_interleave() {
    let bench = |channel| RailAddress::shared("bench", channel);
    let assignment = RelayAssignment::standard()
        .with_override(HardwareRevision::V04, Rail::Relay(5), bench(1))
        .with_override(HardwareRevision::V04, Rail::Relay(6), bench(2))
        .with_override(HardwareRevision::V03, Rail::Relay(5), bench(3))
        .with_override(HardwareRevision::V03, Rail::Relay(6), bench(4));
    let rig = SimRig::new()
        .with(SimTentacle::new(T1, "1-2"))
        .with(SimTentacle::new(T2, "1-3").revision(HardwareRevision::V03));
    let harness = Harness::with_assignment(rig, assignment);
    harness.inventory.refresh().await.unwrap();
    let leases = harness.inventory.acquire_all(&[id(T2), id(T1)]).unwrap();
    let shared = BoardId::Shared("bench".to_string());
    assert_eq!(harness.rig.channel(&shared, 1), Some(false));
    assert_eq!(harness.rig.channel(&shared, 3), Some(false));

    harness.rig.write_delay(Duration::from_millis(100));
    let before = harness.rig.writes().len();
    let on = [(Rail::Relay(5), true), (Rail::Relay(6), true)];
    let (a, b) = tokio::join!(
        harness.power.set_rails(&leases[0], &on),
        harness.power.set_rails(&leases[1], &on),
    );
    a.unwrap();
    b.unwrap();

    let channels: Vec<u8> = harness.rig.writes()[before..]
        .iter()
        .filter(|(board, _, _)| board == &shared)
        .map(|(_, channel, _)| *channel)
        .collect();
    assert!(
        channels == [1, 2, 3, 4] || channels == [3, 4, 1, 2],
        "batches interleaved: {channels:?}"
    );
    for channel in 1..=4 {
        assert_eq!(harness.rig.channel(&shared, channel), Some(true));
    }

    for lease in leases {
        harness.inventory.release(lease);
    }
}
