//! Named power rails and how they map onto relay channels

use crate::types::{HardwareRevision, TentacleId, UsbPortPath};
use crate::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lowest and highest relay on the infra board
pub const RELAYS: std::ops::RangeInclusive<u8> = 1..=7;

/// A named power or control line of one tentacle.
///
/// `true` means the rail is asserted: powered, or for a button line, pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Rail {
    /// Infra controller supply
    Infra,
    /// Infra controller boot button
    InfraBoot,
    /// Debug probe run line
    ProbeRun,
    /// DUT supply
    Dut,
    /// General purpose relay on the infra board
    Relay(u8),
    /// Status LEDs
    Leds,
    /// Error LED
    Error,
}

impl Rail {
    /// Relay wired to the DUT boot button on a standard tentacle
    pub const DUT_BOOT: Rail = Rail::Relay(1);

    pub fn name(&self) -> String {
        match self {
            Rail::Infra => "infra".to_string(),
            Rail::InfraBoot => "infraboot".to_string(),
            Rail::ProbeRun => "proberun".to_string(),
            Rail::Dut => "dut".to_string(),
            Rail::Relay(n) => format!("relay{n}"),
            Rail::Leds => "leds".to_string(),
            Rail::Error => "error".to_string(),
        }
    }
}

impl Default for Rail {
    fn default() -> Self {
        Rail::DUT_BOOT
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Rail {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let rail = match name.as_str() {
            "infra" => Rail::Infra,
            "infraboot" => Rail::InfraBoot,
            "proberun" => Rail::ProbeRun,
            "dut" => Rail::Dut,
            "leds" => Rail::Leds,
            "error" => Rail::Error,
            other => match other.strip_prefix("relay").map(str::parse::<u8>) {
                Some(Ok(n)) if RELAYS.contains(&n) => Rail::Relay(n),
                _ => return Err(RigError::UnknownRail(s.to_string())),
            },
        };
        Ok(rail)
    }
}

impl TryFrom<String> for Rail {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self, RigError> {
        value.parse()
    }
}

impl From<Rail> for String {
    fn from(rail: Rail) -> Self {
        rail.name()
    }
}

/// Which relay board a rail lives on, relative to its tentacle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardRef {
    /// Port power switching of the tentacle's own hub
    Hub,
    /// Relays and GPIOs driven by the tentacle's infra controller
    Infra,
    /// A board shared by several tentacles, by name
    Shared(String),
}

/// Board and channel a rail is wired to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RailAddress {
    pub board: BoardRef,
    pub channel: u8,
    /// Channel level is the inverse of the rail's logical state
    #[serde(default)]
    pub active_low: bool,
}

impl RailAddress {
    pub fn hub(channel: u8) -> Self {
        Self {
            board: BoardRef::Hub,
            channel,
            active_low: false,
        }
    }

    pub fn infra(channel: u8) -> Self {
        Self {
            board: BoardRef::Infra,
            channel,
            active_low: false,
        }
    }

    /// Channel on a board shared by several tentacles
    pub fn shared(board: impl Into<String>, channel: u8) -> Self {
        Self {
            board: BoardRef::Shared(board.into()),
            channel,
            active_low: false,
        }
    }

    pub fn active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    /// Channel level that puts the rail in `on`
    pub fn level(&self, on: bool) -> bool {
        on ^ self.active_low
    }

    /// Concrete board this rail lives on for `tentacle`
    pub fn board_id(&self, tentacle: &TentacleId) -> BoardId {
        match &self.board {
            BoardRef::Hub => BoardId::Hub(tentacle.clone()),
            BoardRef::Infra => BoardId::Infra(tentacle.clone()),
            BoardRef::Shared(name) => BoardId::Shared(name.clone()),
        }
    }
}

/// A physical relay board. Ordering is the global lock order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardId {
    Hub(TentacleId),
    Infra(TentacleId),
    Shared(String),
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardId::Hub(id) => write!(f, "hub:{id}"),
            BoardId::Infra(id) => write!(f, "infra:{id}"),
            BoardId::Shared(name) => write!(f, "shared:{name}"),
        }
    }
}

/// What a bus driver needs to reach a board
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardAddress {
    pub id: BoardId,
    /// Hub the board is, or sits behind
    pub hub: Option<UsbPortPath>,
    /// Serial console of the infra controller
    pub infra_tty: Option<PathBuf>,
}

/// Rail wiring for each hardware revision
#[derive(Debug, Clone, PartialEq)]
pub struct RelayAssignment {
    layouts: BTreeMap<HardwareRevision, BTreeMap<Rail, RailAddress>>,
}

impl Default for RelayAssignment {
    fn default() -> Self {
        Self::standard()
    }
}

impl RelayAssignment {
    /// Wiring of the stock v0.3 and v0.4 tentacles
    pub fn standard() -> Self {
        let mut layouts = BTreeMap::new();
        for revision in HardwareRevision::ALL {
            let mut layout = BTreeMap::new();
            layout.insert(Rail::Infra, RailAddress::hub(revision.infra_port()));
            // Unpowering the boot port presses the button
            layout.insert(
                Rail::InfraBoot,
                RailAddress::hub(revision.infra_boot_port()).active_low(),
            );
            layout.insert(Rail::Dut, RailAddress::hub(revision.dut_port()));
            if let Some(port) = revision.probe_port() {
                layout.insert(Rail::ProbeRun, RailAddress::hub(port));
            }
            match revision.error_port() {
                Some(port) => layout.insert(Rail::Error, RailAddress::hub(port)),
                None => layout.insert(Rail::Error, RailAddress::infra(8)),
            };
            for relay in RELAYS {
                layout.insert(Rail::Relay(relay), RailAddress::infra(relay));
            }
            layout.insert(Rail::Leds, RailAddress::infra(0));
            layouts.insert(revision, layout);
        }
        Self { layouts }
    }

    /// Rewire one rail of one revision
    pub fn with_override(
        mut self,
        revision: HardwareRevision,
        rail: Rail,
        address: RailAddress,
    ) -> Self {
        self.layouts
            .entry(revision)
            .or_default()
            .insert(rail, address);
        self
    }

    /// Address of `rail`; rails not wired on this revision are unknown
    pub fn address(&self, revision: HardwareRevision, rail: Rail) -> RigResult<&RailAddress> {
        self.layouts
            .get(&revision)
            .and_then(|layout| layout.get(&rail))
            .ok_or_else(|| RigError::UnknownRail(format!("{rail} on {revision}")))
    }

    pub fn rails(&self, revision: HardwareRevision) -> impl Iterator<Item = Rail> + '_ {
        self.layouts
            .get(&revision)
            .into_iter()
            .flat_map(|layout| layout.keys().copied())
    }

    /// Safe resting state: infra and probe powered, everything else off or released
    pub fn idle(&self, revision: HardwareRevision) -> Vec<(Rail, bool)> {
        self.rails(revision)
            .map(|rail| (rail, matches!(rail, Rail::Infra | Rail::ProbeRun)))
            .collect()
    }

    /// Every rail off, including the infra controller
    pub fn all_off(&self, revision: HardwareRevision) -> Vec<(Rail, bool)> {
        self.rails(revision).map(|rail| (rail, false)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rail_names_round_trip() {
        for name in ["infra", "infraboot", "proberun", "dut", "relay1", "relay7", "leds", "error"] {
            let rail: Rail = name.parse().unwrap();
            assert_eq!(rail.name(), name);
        }
        assert_eq!("RELAY3".parse::<Rail>().unwrap(), Rail::Relay(3));
    }

    #[test]
    fn test_rail_from_json_string() {
        assert_eq!(Rail::try_from("error".to_string()).unwrap(), Rail::Error);
        let rails: Vec<Rail> = serde_json::from_str(r#"["error", "relay2", "dut"]"#).unwrap();
        assert_eq!(rails, vec![Rail::Error, Rail::Relay(2), Rail::Dut]);
        assert_eq!(serde_json::to_string(&Rail::Error).unwrap(), r#""error""#);
        assert!(serde_json::from_str::<Rail>(r#""relay9""#).is_err());
    }

    #[test]
    fn test_unknown_rail() {
        assert!(matches!("relay8".parse::<Rail>(), Err(RigError::UnknownRail(_))));
        assert!(matches!("relay0".parse::<Rail>(), Err(RigError::UnknownRail(_))));
        assert!(matches!("vbus".parse::<Rail>(), Err(RigError::UnknownRail(_))));
    }

    #[test]
    fn test_standard_layouts() {
        let assignment = RelayAssignment::standard();

        let v3 = HardwareRevision::V03;
        assert_eq!(assignment.address(v3, Rail::Infra).unwrap(), &RailAddress::hub(1));
        assert_eq!(assignment.address(v3, Rail::Error).unwrap(), &RailAddress::hub(4));
        assert!(assignment.address(v3, Rail::ProbeRun).is_err());

        let v4 = HardwareRevision::V04;
        assert_eq!(assignment.address(v4, Rail::ProbeRun).unwrap(), &RailAddress::hub(1));
        let boot = assignment.address(v4, Rail::InfraBoot).unwrap();
        assert_eq!(boot.channel, 4);
        assert!(!boot.level(true));
    }

    #[test]
    fn test_idle_preset() {
        let assignment = RelayAssignment::standard();
        let idle: BTreeMap<Rail, bool> = assignment.idle(HardwareRevision::V04).into_iter().collect();
        assert_eq!(idle[&Rail::Infra], true);
        assert_eq!(idle[&Rail::ProbeRun], true);
        assert_eq!(idle[&Rail::Dut], false);
        assert_eq!(idle[&Rail::DUT_BOOT], false);
        assert_eq!(idle[&Rail::InfraBoot], false);
    }

    #[test]
    fn test_override() {
        let shared = RailAddress {
            board: BoardRef::Shared("bench-relays".into()),
            channel: 5,
            active_low: false,
        };
        let assignment = RelayAssignment::standard().with_override(
            HardwareRevision::V03,
            Rail::Dut,
            shared.clone(),
        );
        assert_eq!(assignment.address(HardwareRevision::V03, Rail::Dut).unwrap(), &shared);

        let id = TentacleId::new("e46340474b4c1331").unwrap();
        assert_eq!(shared.board_id(&id), BoardId::Shared("bench-relays".into()));
    }
}
