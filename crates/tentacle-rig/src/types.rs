//! Identity and USB addressing types

use crate::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Serial number of a tentacle's infrastructure controller.
///
/// Serials are 16 word characters. The delimited form `xxxxxxxxxxxx-xxxx`
/// printed on labels is accepted as input and normalized.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TentacleId(String);

impl TentacleId {
    /// Length of a serial without delimiter
    pub const LEN: usize = 16;

    const SHORT_LEN: usize = 4;

    /// Parse a serial, accepting the delimited label form
    pub fn new(serial: impl AsRef<str>) -> RigResult<Self> {
        let raw = serial.as_ref().trim();
        let compact = match raw.split_once('-') {
            Some((head, tail)) if head.len() == Self::LEN - Self::SHORT_LEN => {
                format!("{head}{tail}")
            }
            _ => raw.to_string(),
        };

        let valid = compact.len() == Self::LEN
            && compact
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(RigError::InvalidSerial(raw.to_string()));
        }
        Ok(Self(compact.to_ascii_lowercase()))
    }

    /// The compact serial
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label form `xxxxxxxxxxxx-xxxx`
    pub fn delimited(&self) -> String {
        let (head, tail) = self.0.split_at(Self::LEN - Self::SHORT_LEN);
        format!("{head}-{tail}")
    }

    /// Last four characters, as printed on the short label
    pub fn short(&self) -> &str {
        &self.0[Self::LEN - Self::SHORT_LEN..]
    }

    /// Whether `pattern` names this tentacle by full serial, prefix or short suffix
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.trim().to_ascii_lowercase().replace('-', "");
        !pattern.is_empty() && (self.0.starts_with(&pattern) || self.0.ends_with(&pattern))
    }
}

impl fmt::Display for TentacleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TentacleId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TentacleId {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TentacleId> for String {
    fn from(id: TentacleId) -> Self {
        id.0
    }
}

/// Physical position of a USB device: bus number plus the chain of hub ports,
/// written the way sysfs names devices (`3-1.4.2`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbPortPath {
    bus: u8,
    ports: Vec<u8>,
}

impl UsbPortPath {
    pub fn new(bus: u8, ports: impl Into<Vec<u8>>) -> Self {
        Self {
            bus,
            ports: ports.into(),
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn ports(&self) -> &[u8] {
        &self.ports
    }

    /// Port number on the parent hub
    pub fn last_port(&self) -> Option<u8> {
        self.ports.last().copied()
    }

    /// Path of the hub this device hangs off; `None` under the root hub
    pub fn parent(&self) -> Option<Self> {
        if self.ports.len() < 2 {
            return None;
        }
        Some(Self {
            bus: self.bus,
            ports: self.ports[..self.ports.len() - 1].to_vec(),
        })
    }

    /// Path of the device on `port` of this hub
    pub fn child(&self, port: u8) -> Self {
        let mut ports = self.ports.clone();
        ports.push(port);
        Self {
            bus: self.bus,
            ports,
        }
    }

    pub fn is_descendant_of(&self, other: &UsbPortPath) -> bool {
        self.bus == other.bus
            && self.ports.len() > other.ports.len()
            && self.ports.starts_with(&other.ports)
    }
}

impl fmt::Display for UsbPortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.bus)?;
        for (i, port) in self.ports.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

impl FromStr for UsbPortPath {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RigError::InvalidPortPath(s.to_string());
        let (bus, chain) = s.trim().split_once('-').ok_or_else(invalid)?;
        let bus = bus.parse::<u8>().map_err(|_| invalid())?;
        let ports = chain
            .split('.')
            .map(|p| p.parse::<u8>().map_err(|_| invalid()))
            .collect::<RigResult<Vec<_>>>()?;
        if ports.is_empty() {
            return Err(invalid());
        }
        Ok(Self { bus, ports })
    }
}

impl TryFrom<String> for UsbPortPath {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbPortPath> for String {
    fn from(path: UsbPortPath) -> Self {
        path.to_string()
    }
}

/// USB vendor and product id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UsbId {
    pub vendor: u16,
    pub product: u16,
}

impl UsbId {
    /// RP2 infra controller running its application firmware
    pub const INFRA_APPLICATION: UsbId = UsbId::new(0x2E8A, 0x0005);
    /// RP2 infra controller in its own bootloader
    pub const INFRA_BOOTLOADER: UsbId = UsbId::new(0x2E8A, 0x0003);
    /// Four port hub on every tentacle
    pub const TENTACLE_HUB: UsbId = UsbId::new(0x0424, 0x2514);

    pub const fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Bus number and device address, as programming tools expect them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    pub bus: u8,
    pub device: u8,
}

/// Coarse function of an enumerated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Hub,
    /// CDC serial port, the usual application mode
    Serial,
    /// Bootloader exposing a copy-to-flash volume
    MassStorage,
    /// Bootloader spoken to by a programming tool
    VendorBootloader,
    Other,
}

impl DeviceClass {
    pub fn is_bootloader(&self) -> bool {
        matches!(self, DeviceClass::MassStorage | DeviceClass::VendorBootloader)
    }
}

/// PCB revision of a tentacle, which fixes what sits on each hub port
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HardwareRevision {
    #[serde(rename = "v0.3")]
    V03,
    #[serde(rename = "v0.4")]
    V04,
}

impl HardwareRevision {
    pub const ALL: [HardwareRevision; 2] = [HardwareRevision::V03, HardwareRevision::V04];

    /// Hub port of the infra controller
    pub fn infra_port(&self) -> u8 {
        match self {
            HardwareRevision::V03 => 1,
            HardwareRevision::V04 => 2,
        }
    }

    /// Hub port of the DUT
    pub fn dut_port(&self) -> u8 {
        3
    }

    /// Hub port powering the infra boot button line
    pub fn infra_boot_port(&self) -> u8 {
        match self {
            HardwareRevision::V03 => 2,
            HardwareRevision::V04 => 4,
        }
    }

    /// Hub port of the debug probe, if the revision has one
    pub fn probe_port(&self) -> Option<u8> {
        match self {
            HardwareRevision::V03 => None,
            HardwareRevision::V04 => Some(1),
        }
    }

    /// Hub port driving the error LED, if the revision has one
    pub fn error_port(&self) -> Option<u8> {
        match self {
            HardwareRevision::V03 => Some(4),
            HardwareRevision::V04 => None,
        }
    }

    /// Revision implied by the hub port an infra controller was found on.
    /// Port 3 always carries the DUT, which may itself be an RP2.
    pub fn from_infra_port(port: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|rev| rev.infra_port() == port)
    }

    /// Where the DUT of a tentacle whose infra sits at `infra` lives
    pub fn dut_path(&self, infra: &UsbPortPath) -> Option<UsbPortPath> {
        infra.parent().map(|hub| hub.child(self.dut_port()))
    }
}

impl fmt::Display for HardwareRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareRevision::V03 => f.write_str("v0.3"),
            HardwareRevision::V04 => f.write_str("v0.4"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tentacle_id_forms() {
        let id = TentacleId::new("E46340474B4C1331").unwrap();
        assert_eq!(id.as_str(), "e46340474b4c1331");
        assert_eq!(id.delimited(), "e46340474b4c-1331");
        assert_eq!(id.short(), "1331");

        let delimited = TentacleId::new("e46340474b4c-1331").unwrap();
        assert_eq!(delimited, id);
    }

    #[test]
    fn test_tentacle_id_rejects_garbage() {
        assert!(TentacleId::new("1331").is_err());
        assert!(TentacleId::new("e46340474b4c13311").is_err());
        assert!(TentacleId::new("e4634047 4b4c133").is_err());
    }

    #[test]
    fn test_tentacle_id_matches() {
        let id = TentacleId::new("e46340474b4c1331").unwrap();
        assert!(id.matches("1331"));
        assert!(id.matches("e4634"));
        assert!(id.matches("e46340474b4c-1331"));
        assert!(!id.matches("2222"));
        assert!(!id.matches(""));
    }

    #[test]
    fn test_port_path_parse_and_display() {
        let path: UsbPortPath = "3-1.4.2".parse().unwrap();
        assert_eq!(path.bus(), 3);
        assert_eq!(path.ports(), &[1, 4, 2]);
        assert_eq!(path.to_string(), "3-1.4.2");
        assert!("3".parse::<UsbPortPath>().is_err());
        assert!("usb3".parse::<UsbPortPath>().is_err());
        assert!("3-1.x".parse::<UsbPortPath>().is_err());
    }

    #[test]
    fn test_port_path_relations() {
        let hub: UsbPortPath = "1-2.3".parse().unwrap();
        let infra = hub.child(1);
        assert_eq!(infra.to_string(), "1-2.3.1");
        assert_eq!(infra.parent(), Some(hub.clone()));
        assert!(infra.is_descendant_of(&hub));
        assert!(!hub.is_descendant_of(&infra));
        assert_eq!(UsbPortPath::new(1, vec![2]).parent(), None);
    }

    #[test]
    fn test_revision_ports() {
        assert_eq!(HardwareRevision::from_infra_port(1), Some(HardwareRevision::V03));
        assert_eq!(HardwareRevision::from_infra_port(2), Some(HardwareRevision::V04));
        assert_eq!(HardwareRevision::from_infra_port(3), None);

        let infra: UsbPortPath = "1-4.2".parse().unwrap();
        let dut = HardwareRevision::V04.dut_path(&infra).unwrap();
        assert_eq!(dut.to_string(), "1-4.3");
    }

    #[test]
    fn test_usb_id_display() {
        assert_eq!(UsbId::INFRA_APPLICATION.to_string(), "2e8a:0005");
        assert_eq!(UsbId::TENTACLE_HUB.to_string(), "0424:2514");
    }
}
