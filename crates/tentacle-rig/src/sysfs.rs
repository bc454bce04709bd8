//! Linux sysfs backends: USB enumeration and hub port power
//!
//! Devices are read from `/sys/bus/usb/devices`, mount points from
//! `/proc/mounts`. Hub port power goes through the per-port `disable`
//! attribute, where `0` powers the port and `1` cuts it.

use crate::power::RelayBus;
use crate::rail::{BoardAddress, BoardId};
use crate::topology::{UsbDevice, UsbEnumerator, UsbSnapshot};
use crate::types::{BusAddress, DeviceClass, UsbId, UsbPortPath};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// Ports on the tentacle hub
const HUB_PORTS: std::ops::RangeInclusive<u8> = 1..=4;

/// Enumerates USB devices from sysfs
#[derive(Debug, Clone)]
pub struct SysfsUsbEnumerator {
    devices: PathBuf,
    mounts: PathBuf,
}

impl Default for SysfsUsbEnumerator {
    fn default() -> Self {
        Self::new(SYSFS_USB_DEVICES, PROC_MOUNTS)
    }
}

impl SysfsUsbEnumerator {
    pub fn new(devices: impl Into<PathBuf>, mounts: impl Into<PathBuf>) -> Self {
        Self {
            devices: devices.into(),
            mounts: mounts.into(),
        }
    }
}

#[async_trait]
impl UsbEnumerator for SysfsUsbEnumerator {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    async fn scan(&self) -> RigResult<UsbSnapshot> {
        let devices = self.devices.clone();
        let mounts = self.mounts.clone();
        tokio::task::spawn_blocking(move || scan_blocking(&devices, &mounts)).await?
    }
}

fn scan_blocking(root: &Path, mounts: &Path) -> RigResult<UsbSnapshot> {
    let mount_table = read_mounts(mounts);
    let entries = fs::read_dir(root)
        .map_err(|e| RigError::infra(format!("cannot list {}: {e}", root.display())))?;

    let mut snapshot = UsbSnapshot::default();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        // Interfaces carry a ':'; root hubs are named usbN
        if name.contains(':') || name.starts_with("usb") {
            continue;
        }
        let Ok(port) = name.parse::<UsbPortPath>() else {
            continue;
        };
        match read_device(&entry.path(), &name, port, &mount_table) {
            Some(device) => snapshot.push(device),
            None => debug!(device = %name, "skipping unreadable device"),
        }
    }
    Ok(snapshot)
}

fn read_device(
    dir: &Path,
    name: &str,
    port: UsbPortPath,
    mount_table: &HashMap<PathBuf, PathBuf>,
) -> Option<UsbDevice> {
    let vendor = read_hex(&dir.join("idVendor"))?;
    let product = read_hex(&dir.join("idProduct"))?;

    let interfaces: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().starts_with(&format!("{name}:")))
        .map(|e| e.path())
        .collect();

    let mut device = UsbDevice::new(
        UsbId::new(vendor, product),
        port,
        classify(dir, &interfaces),
    );
    device.serial = read_attr(&dir.join("serial"));
    if let (Some(bus), Some(dev)) = (
        read_attr(&dir.join("busnum")).and_then(|v| v.parse().ok()),
        read_attr(&dir.join("devnum")).and_then(|v| v.parse().ok()),
    ) {
        device.address = Some(BusAddress { bus, device: dev });
    }

    for interface in &interfaces {
        for entry in WalkDir::new(interface).max_depth(6).into_iter().flatten() {
            let file_name = entry.file_name().to_string_lossy();
            if device.tty.is_none()
                && (file_name.starts_with("ttyACM") || file_name.starts_with("ttyUSB"))
            {
                device.tty = Some(Path::new("/dev").join(&*file_name));
            }
            if device.mount_point.is_none() && entry.path().parent().is_some_and(|p| p.ends_with("block")) {
                // Partitions show up as sdb1, sdb2 under the sdb node
                let node = format!("/dev/{file_name}");
                let mut candidates: Vec<(&PathBuf, &PathBuf)> = mount_table
                    .iter()
                    .filter(|(source, _)| source.to_string_lossy().starts_with(&node))
                    .collect();
                candidates.sort();
                device.mount_point = candidates.first().map(|(_, target)| (*target).clone());
            }
        }
    }
    Some(device)
}

fn classify(dir: &Path, interfaces: &[PathBuf]) -> DeviceClass {
    if read_attr(&dir.join("bDeviceClass")).as_deref() == Some("09") {
        return DeviceClass::Hub;
    }
    let classes: Vec<String> = interfaces
        .iter()
        .filter_map(|i| read_attr(&i.join("bInterfaceClass")))
        .collect();
    let has = |code: &str| classes.iter().any(|c| c == code);
    if has("02") || has("0a") {
        DeviceClass::Serial
    } else if has("08") {
        DeviceClass::MassStorage
    } else if has("fe") || has("ff") {
        DeviceClass::VendorBootloader
    } else {
        DeviceClass::Other
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_hex(path: &Path) -> Option<u16> {
    read_attr(path).and_then(|v| u16::from_str_radix(&v, 16).ok())
}

/// Block device node to mount point
fn read_mounts(path: &Path) -> HashMap<PathBuf, PathBuf> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            source
                .starts_with("/dev/")
                .then(|| (PathBuf::from(source), PathBuf::from(target.replace("\\040", " "))))
        })
        .collect()
}

/// Hub port power switching through sysfs
#[derive(Debug, Clone)]
pub struct SysfsHubBus {
    devices: PathBuf,
}

impl Default for SysfsHubBus {
    fn default() -> Self {
        Self::new(SYSFS_USB_DEVICES)
    }
}

impl SysfsHubBus {
    pub fn new(devices: impl Into<PathBuf>) -> Self {
        Self {
            devices: devices.into(),
        }
    }

    fn port_file(&self, board: &BoardAddress, port: u8) -> RigResult<PathBuf> {
        let BoardId::Hub(_) = &board.id else {
            return Err(RigError::infra(format!("{} is not a hub", board.id)));
        };
        let hub = board
            .hub
            .as_ref()
            .ok_or_else(|| RigError::infra(format!("{} has no USB location", board.id)))?;
        Ok(self
            .devices
            .join(format!("{hub}:1.0"))
            .join(format!("{hub}-port{port}"))
            .join("disable"))
    }

    async fn write_port(&self, board: &BoardAddress, port: u8, powered: bool) -> RigResult<()> {
        let file = self.port_file(board, port)?;
        tokio::fs::write(&file, if powered { "0" } else { "1" })
            .await
            .map_err(|e| RigError::infra(format!("cannot write {}: {e}", file.display())))
    }
}

#[async_trait]
impl RelayBus for SysfsHubBus {
    fn name(&self) -> &'static str {
        "sysfs-hub"
    }

    async fn levels(&self, board: &BoardAddress) -> RigResult<BTreeMap<u8, bool>> {
        let mut levels = BTreeMap::new();
        for port in HUB_PORTS {
            let file = self.port_file(board, port)?;
            if let Ok(value) = tokio::fs::read_to_string(&file).await {
                levels.insert(port, value.trim() == "0");
            }
        }
        Ok(levels)
    }

    async fn apply(&self, board: &BoardAddress, batch: &[(u8, bool)]) -> RigResult<()> {
        let before = self.levels(board).await?;
        for (index, (port, powered)) in batch.iter().enumerate() {
            if let Err(err) = self.write_port(board, *port, *powered).await {
                // Undo this batch's earlier writes
                for (done, _) in batch[..index].iter().rev() {
                    if let Some(level) = before.get(done) {
                        if let Err(undo) = self.write_port(board, *done, *level).await {
                            warn!(board = %board.id, port = done, %undo, "undo failed");
                        }
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }
}
