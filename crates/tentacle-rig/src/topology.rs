//! USB topology resolution
//!
//! A tentacle is a four port hub carrying an infra controller, a DUT and,
//! depending on revision, a debug probe. The resolver walks a USB snapshot,
//! finds every infra controller that sits on a tentacle hub, and derives
//! where that tentacle's DUT must appear.

use crate::types::{BusAddress, DeviceClass, HardwareRevision, TentacleId, UsbId, UsbPortPath};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, warn};

/// One enumerated USB device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDevice {
    pub id: UsbId,
    pub port: UsbPortPath,
    pub class: DeviceClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<BusAddress>,
    /// Serial console node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<PathBuf>,
    /// Where a mass storage bootloader volume is mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<PathBuf>,
}

impl UsbDevice {
    pub fn new(id: UsbId, port: UsbPortPath, class: DeviceClass) -> Self {
        Self {
            id,
            port,
            class,
            serial: None,
            address: None,
            tty: None,
            mount_point: None,
        }
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn address(mut self, bus: u8, device: u8) -> Self {
        self.address = Some(BusAddress { bus, device });
        self
    }

    pub fn tty(mut self, tty: impl Into<PathBuf>) -> Self {
        self.tty = Some(tty.into());
        self
    }

    pub fn mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(path.into());
        self
    }
}

/// Every device visible at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbSnapshot {
    devices: Vec<UsbDevice>,
}

impl UsbSnapshot {
    pub fn new(devices: Vec<UsbDevice>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[UsbDevice] {
        &self.devices
    }

    pub fn push(&mut self, device: UsbDevice) {
        self.devices.push(device);
    }

    pub fn device_at(&self, port: &UsbPortPath) -> Option<&UsbDevice> {
        self.devices.iter().find(|d| &d.port == port)
    }
}

/// Source of USB snapshots
#[async_trait]
pub trait UsbEnumerator: Send + Sync {
    /// Human-readable name for this enumerator
    fn name(&self) -> &'static str;

    /// Take a snapshot of everything currently enumerated
    async fn scan(&self) -> RigResult<UsbSnapshot>;
}

/// What the DUT position of a tentacle currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutPresence {
    Absent,
    Application,
    MassStorageBootloader,
    ProgrammingBootloader,
}

/// Where one tentacle sits on the USB tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub revision: HardwareRevision,
    pub hub_port: UsbPortPath,
    pub infra_port: UsbPortPath,
    pub dut_port: UsbPortPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infra_tty: Option<PathBuf>,
    /// Device at `dut_port`, if one is enumerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dut: Option<UsbDevice>,
}

impl PortInfo {
    pub fn dut_presence(&self) -> DutPresence {
        match self.dut.as_ref().map(|d| d.class) {
            None => DutPresence::Absent,
            Some(DeviceClass::MassStorage) => DutPresence::MassStorageBootloader,
            Some(DeviceClass::VendorBootloader) => DutPresence::ProgrammingBootloader,
            Some(_) => DutPresence::Application,
        }
    }
}

/// Resolved rig topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub tentacles: BTreeMap<TentacleId, PortInfo>,
    /// Tentacle hubs with no infra controller enumerated
    pub unpowered_hubs: Vec<UsbPortPath>,
    /// Infra controllers stuck in their own bootloader
    pub infra_in_bootloader: Vec<UsbPortPath>,
}

impl Topology {
    pub fn get(&self, id: &TentacleId) -> Option<&PortInfo> {
        self.tentacles.get(id)
    }

    /// Tentacles whose serial matches any pattern; all of them when empty
    pub fn select(&self, patterns: &[&str]) -> Vec<(&TentacleId, &PortInfo)> {
        self.tentacles
            .iter()
            .filter(|(id, _)| patterns.is_empty() || patterns.iter().any(|p| id.matches(p)))
            .collect()
    }
}

/// Maps a USB snapshot onto tentacles
#[derive(Debug, Clone)]
pub struct TopologyResolver {
    hub: UsbId,
    infra_application: UsbId,
    infra_bootloader: UsbId,
}

impl Default for TopologyResolver {
    fn default() -> Self {
        Self {
            hub: UsbId::TENTACLE_HUB,
            infra_application: UsbId::INFRA_APPLICATION,
            infra_bootloader: UsbId::INFRA_BOOTLOADER,
        }
    }
}

impl TopologyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognize infra controllers by a different id
    pub fn infra_ids(mut self, application: UsbId, bootloader: UsbId) -> Self {
        self.infra_application = application;
        self.infra_bootloader = bootloader;
        self
    }

    /// Recognize tentacle hubs by a different id
    pub fn hub_id(mut self, hub: UsbId) -> Self {
        self.hub = hub;
        self
    }

    /// Resolve a snapshot. The result only depends on the snapshot contents.
    pub fn resolve(&self, snapshot: &UsbSnapshot) -> RigResult<Topology> {
        let hubs: BTreeSet<&UsbPortPath> = snapshot
            .devices()
            .iter()
            .filter(|d| d.id == self.hub)
            .map(|d| &d.port)
            .collect();

        let mut tentacles: BTreeMap<TentacleId, PortInfo> = BTreeMap::new();
        let mut claimed: BTreeSet<UsbPortPath> = BTreeSet::new();
        let mut infra_in_bootloader = Vec::new();

        let mut infras: Vec<&UsbDevice> = snapshot
            .devices()
            .iter()
            .filter(|d| d.id == self.infra_application || d.id == self.infra_bootloader)
            .collect();
        infras.sort_by(|a, b| a.port.cmp(&b.port));

        for device in infras {
            let Some(hub_port) = device.port.parent().filter(|p| hubs.contains(p)) else {
                continue;
            };
            let Some(revision) = device
                .port
                .last_port()
                .and_then(HardwareRevision::from_infra_port)
            else {
                // Port 3 carries the DUT, which may be an RP2 itself
                debug!(port = %device.port, "ignoring RP2 on a non-infra hub port");
                continue;
            };

            if device.id == self.infra_bootloader {
                claimed.insert(hub_port);
                infra_in_bootloader.push(device.port.clone());
                continue;
            }

            let Some(serial) = device.serial.as_deref() else {
                warn!(port = %device.port, "infra controller without serial");
                continue;
            };
            let id = match TentacleId::new(serial) {
                Ok(id) => id,
                Err(err) => {
                    warn!(port = %device.port, %err, "skipping infra controller");
                    continue;
                }
            };

            if let Some(existing) = tentacles.get(&id) {
                return Err(RigError::DuplicateSerial {
                    serial: id.to_string(),
                    first: existing.infra_port.to_string(),
                    second: device.port.to_string(),
                });
            }

            let dut_port = hub_port.child(revision.dut_port());
            let info = PortInfo {
                revision,
                hub_port: hub_port.clone(),
                infra_port: device.port.clone(),
                dut: snapshot.device_at(&dut_port).cloned(),
                dut_port,
                infra_tty: device.tty.clone(),
            };
            claimed.insert(hub_port);
            tentacles.insert(id, info);
        }

        let unpowered_hubs = hubs
            .into_iter()
            .filter(|hub| !claimed.contains(*hub))
            .cloned()
            .collect();

        Ok(Topology {
            tentacles,
            unpowered_hubs,
            infra_in_bootloader,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path(s: &str) -> UsbPortPath {
        s.parse().unwrap()
    }

    fn hub(at: &str) -> UsbDevice {
        UsbDevice::new(UsbId::TENTACLE_HUB, path(at), DeviceClass::Hub)
    }

    fn infra(at: &str, serial: &str) -> UsbDevice {
        UsbDevice::new(UsbId::INFRA_APPLICATION, path(at), DeviceClass::Serial).serial(serial)
    }

    #[test]
    fn test_resolve_v04_tentacle() {
        let dut = UsbDevice::new(UsbId::new(0x2E8A, 0x0003), path("1-2.3"), DeviceClass::MassStorage);
        let snapshot = UsbSnapshot::new(vec![
            hub("1-2"),
            infra("1-2.2", "e46340474b4c1331"),
            dut,
        ]);

        let topology = TopologyResolver::new().resolve(&snapshot).unwrap();
        let id = TentacleId::new("e46340474b4c1331").unwrap();
        let info = topology.get(&id).unwrap();
        assert_eq!(info.revision, HardwareRevision::V04);
        assert_eq!(info.dut_port, path("1-2.3"));
        assert_eq!(info.dut_presence(), DutPresence::MassStorageBootloader);
        assert!(topology.unpowered_hubs.is_empty());
    }

    #[test]
    fn test_rp2_dut_not_mistaken_for_infra() {
        let snapshot = UsbSnapshot::new(vec![
            hub("1-2"),
            infra("1-2.1", "e46340474b4c1331"),
            infra("1-2.3", "de646cc20b92c22f"),
        ]);

        let topology = TopologyResolver::new().resolve(&snapshot).unwrap();
        assert_eq!(topology.tentacles.len(), 1);
        let info = topology.tentacles.values().next().unwrap();
        assert_eq!(info.revision, HardwareRevision::V03);
        assert_eq!(info.dut_presence(), DutPresence::Application);
    }

    #[test]
    fn test_infra_off_the_hub_is_ignored() {
        let snapshot = UsbSnapshot::new(vec![infra("1-4", "e46340474b4c1331")]);
        let topology = TopologyResolver::new().resolve(&snapshot).unwrap();
        assert!(topology.tentacles.is_empty());
    }

    #[test]
    fn test_duplicate_serial() {
        let snapshot = UsbSnapshot::new(vec![
            hub("1-2"),
            hub("1-3"),
            infra("1-2.2", "e46340474b4c1331"),
            infra("1-3.2", "e46340474b4c1331"),
        ]);
        let err = TopologyResolver::new().resolve(&snapshot).unwrap_err();
        assert!(matches!(err, RigError::DuplicateSerial { .. }));
    }

    #[test]
    fn test_unpowered_and_bootloader_hubs() {
        let snapshot = UsbSnapshot::new(vec![
            hub("1-2"),
            hub("1-3"),
            hub("1-4"),
            infra("1-2.2", "e46340474b4c1331"),
            UsbDevice::new(UsbId::INFRA_BOOTLOADER, path("1-3.2"), DeviceClass::MassStorage),
        ]);
        let topology = TopologyResolver::new().resolve(&snapshot).unwrap();
        assert_eq!(topology.unpowered_hubs, vec![path("1-4")]);
        assert_eq!(topology.infra_in_bootloader, vec![path("1-3.2")]);
    }

    #[test]
    fn test_resolve_is_order_independent() {
        let devices = vec![
            hub("1-3"),
            infra("1-3.2", "aaaaaaaaaaaa0001"),
            hub("1-2"),
            infra("1-2.1", "bbbbbbbbbbbb0002"),
        ];
        let mut reversed = devices.clone();
        reversed.reverse();

        let resolver = TopologyResolver::new();
        let a = resolver.resolve(&UsbSnapshot::new(devices)).unwrap();
        let b = resolver.resolve(&UsbSnapshot::new(reversed)).unwrap();
        assert_eq!(a, b);

        let ids: Vec<String> = a.tentacles.keys().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["aaaaaaaaaaaa0001", "bbbbbbbbbbbb0002"]);
    }

    #[test]
    fn test_select_by_short_serial() {
        let snapshot = UsbSnapshot::new(vec![
            hub("1-3"),
            infra("1-3.2", "aaaaaaaaaaaa0001"),
            hub("1-2"),
            infra("1-2.2", "bbbbbbbbbbbb0002"),
        ]);
        let topology = TopologyResolver::new().resolve(&snapshot).unwrap();
        assert_eq!(topology.select(&["0002"]).len(), 1);
        assert_eq!(topology.select(&[]).len(), 2);
    }
}
