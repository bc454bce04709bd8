//! Tentacle records, boot states and leases

use crate::config::TentacleDecl;
use crate::power::PowerScope;
use crate::rail::Rail;
use crate::topology::{PortInfo, UsbDevice};
use crate::types::{HardwareRevision, TentacleId, UsbPortPath};
use crate::{RigError, RigResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Where a DUT is in its boot sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BootState {
    PoweredOff,
    EnteringBootloader,
    BootloaderMassStorage,
    BootloaderProgramming,
    FlashInProgress,
    NormalRun,
    FlashFailed,
}

impl BootState {
    pub fn is_bootloader(&self) -> bool {
        matches!(
            self,
            BootState::BootloaderMassStorage | BootState::BootloaderProgramming
        )
    }

    /// Whether a regular step may move from `self` to `next`.
    ///
    /// Powering off is always allowed. `FlashFailed` is only entered through
    /// a fault, never as a regular step.
    pub fn can_advance_to(&self, next: BootState) -> bool {
        use BootState::*;
        match (self, next) {
            (_, PoweredOff) => true,
            (PoweredOff, EnteringBootloader) => true,
            (EnteringBootloader, BootloaderMassStorage | BootloaderProgramming) => true,
            (BootloaderMassStorage | BootloaderProgramming, FlashInProgress) => true,
            (FlashInProgress, NormalRun) => true,
            (PoweredOff, NormalRun) => true,
            _ => false,
        }
    }
}

/// What a tentacle offers to tests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet {
    /// MCU family of the DUT, e.g. `rp2`
    pub mcu: Option<String>,
    /// Board names the DUT is compatible with
    pub boards: Vec<String>,
    /// Programming tool that talks to the DUT bootloader
    pub programmer: Option<String>,
    /// Extra hardware wired to the DUT
    pub gadgets: BTreeSet<String>,
    /// Raw `key=value` tags
    pub tags: BTreeMap<String, String>,
    /// Rail wired to the DUT boot button
    pub boot_rail: Rail,
}

impl CapabilitySet {
    /// Parse operator tags such as `boards=RPI_PICO:RPI_PICO_W,mcu=rp2,programmer=picotool`
    pub fn from_tags(tags: &str) -> RigResult<Self> {
        let mut set = CapabilitySet {
            boot_rail: Rail::DUT_BOOT,
            ..Default::default()
        };
        for pair in tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| RigError::config(format!("malformed tag '{pair}'")))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "mcu" => set.mcu = Some(value.to_string()),
                "programmer" => set.programmer = Some(value.to_string()),
                "boards" => {
                    set.boards = value
                        .split(':')
                        .filter(|b| !b.is_empty())
                        .map(str::to_string)
                        .collect()
                }
                _ => {}
            }
            set.tags.insert(key.to_string(), value.to_string());
        }
        Ok(set)
    }

    /// Capabilities declared for a tentacle in the rig configuration
    pub fn from_decl(decl: &TentacleDecl) -> RigResult<Self> {
        let mut set = Self::from_tags(&decl.tags)?;
        set.gadgets = decl.gadgets.iter().cloned().collect();
        if let Some(rail) = &decl.boot_rail {
            set.boot_rail = rail.parse()?;
        }
        Ok(set)
    }
}

/// Capabilities, or their absence for tentacles never probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "set", rename_all = "snake_case")]
pub enum Capabilities {
    Unknown,
    Known(CapabilitySet),
}

impl Capabilities {
    pub fn known(&self) -> Option<&CapabilitySet> {
        match self {
            Capabilities::Known(set) => Some(set),
            Capabilities::Unknown => None,
        }
    }
}

/// Snapshot of one tentacle as the inventory sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tentacle {
    pub id: TentacleId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub revision: Option<HardwareRevision>,
    pub infra_port: Option<UsbPortPath>,
    pub dut_port: Option<UsbPortPath>,
    pub infra_tty: Option<PathBuf>,
    pub capabilities: Capabilities,
    pub power_state: BTreeMap<Rail, bool>,
    pub boot_state: BootState,
    pub leased: bool,
}

impl Tentacle {
    /// Visible on USB right now
    pub fn is_present(&self) -> bool {
        self.infra_port.is_some()
    }
}

/// Mutable per-tentacle state guarded for the length of a boot sequence
#[derive(Debug)]
pub(crate) struct TentacleState {
    pub(crate) boot_state: BootState,
    /// Device seen at the DUT port in the current bootloader session
    pub(crate) bootloader: Option<UsbDevice>,
}

/// Shared handle to one tentacle's sequencing state
#[derive(Debug)]
pub struct TentacleHandle {
    id: TentacleId,
    pub(crate) session: AsyncMutex<TentacleState>,
    boot_state: RwLock<BootState>,
}

impl TentacleHandle {
    pub fn new(id: TentacleId) -> Self {
        Self {
            id,
            session: AsyncMutex::new(TentacleState {
                boot_state: BootState::PoweredOff,
                bootloader: None,
            }),
            boot_state: RwLock::new(BootState::PoweredOff),
        }
    }

    pub fn id(&self) -> &TentacleId {
        &self.id
    }

    /// Boot state, readable while a sequence is running
    pub fn boot_state(&self) -> BootState {
        *self.boot_state.read()
    }

    pub(crate) fn advance(&self, state: &mut TentacleState, next: BootState) -> RigResult<()> {
        if !state.boot_state.can_advance_to(next) {
            return Err(RigError::invalid_state(
                &self.id,
                format!("cannot go from {:?} to {next:?}", state.boot_state),
            ));
        }
        debug!(tentacle = %self.id, from = ?state.boot_state, to = ?next, "boot state");
        self.set(state, next);
        Ok(())
    }

    /// The only way into `FlashFailed`
    pub(crate) fn fault(&self, state: &mut TentacleState) {
        warn!(tentacle = %self.id, from = ?state.boot_state, "boot sequence faulted");
        state.bootloader = None;
        self.set(state, BootState::FlashFailed);
    }

    fn set(&self, state: &mut TentacleState, next: BootState) {
        state.boot_state = next;
        *self.boot_state.write() = next;
    }
}

/// Exclusive right to drive one tentacle.
///
/// Hand it back through `Inventory::release`. Dropping a lease without
/// releasing it leaves the tentacle leased.
#[derive(Debug)]
pub struct TentacleLease {
    handle: Arc<TentacleHandle>,
    port: Option<PortInfo>,
    capabilities: Capabilities,
    released: bool,
}

impl TentacleLease {
    pub(crate) fn new(handle: Arc<TentacleHandle>, port: Option<PortInfo>, capabilities: Capabilities) -> Self {
        Self {
            handle,
            port,
            capabilities,
            released: false,
        }
    }

    pub fn id(&self) -> &TentacleId {
        self.handle.id()
    }

    /// Position on USB when the lease was taken
    pub fn port(&self) -> Option<&PortInfo> {
        self.port.as_ref()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn boot_state(&self) -> BootState {
        self.handle.boot_state()
    }

    pub(crate) fn handle(&self) -> &Arc<TentacleHandle> {
        &self.handle
    }

    /// Power addressing for this lease; needs the tentacle visible on USB
    pub fn power_scope(&self) -> RigResult<PowerScope> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| RigError::infra(format!("tentacle {} is not visible on USB", self.id())))?;
        Ok(PowerScope::new(self.id().clone(), port))
    }

    pub(crate) fn mark_released(&mut self) {
        self.released = true;
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for TentacleLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(tentacle = %self.id(), "lease dropped without release, tentacle stays leased");
        }
    }
}
