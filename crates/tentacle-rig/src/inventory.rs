//! Tentacle inventory
//!
//! The inventory is the rig's record of every tentacle it has seen or was
//! told about: where it sits on USB, what it can do, and who holds it.
//! Leases are the only way to drive a tentacle; each one is exclusive.

use crate::config::{RigConfig, TentacleDecl};
use crate::power::{PowerController, PowerScope};
use crate::tentacle::{Capabilities, CapabilitySet, Tentacle, TentacleHandle, TentacleLease};
use crate::topology::{PortInfo, TopologyResolver, UsbEnumerator};
use crate::types::{TentacleId, UsbPortPath};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Learns what a freshly seen tentacle can do
#[async_trait]
pub trait CapabilityProbe: Send + Sync {
    async fn probe(&self, id: &TentacleId, port: &PortInfo) -> RigResult<CapabilitySet>;
}

/// Capabilities taken from the rig configuration
#[derive(Debug, Clone, Default)]
pub struct DeclaredCapabilities {
    decls: BTreeMap<TentacleId, TentacleDecl>,
}

impl DeclaredCapabilities {
    pub fn new(decls: BTreeMap<TentacleId, TentacleDecl>) -> Self {
        Self { decls }
    }

    pub fn from_config(config: &RigConfig) -> RigResult<Self> {
        Ok(Self::new(config.declarations()?))
    }
}

#[async_trait]
impl CapabilityProbe for DeclaredCapabilities {
    async fn probe(&self, id: &TentacleId, _port: &PortInfo) -> RigResult<CapabilitySet> {
        let decl = self
            .decls
            .get(id)
            .ok_or_else(|| RigError::UnknownTentacle(id.to_string()))?;
        CapabilitySet::from_decl(decl)
    }
}

/// Selects tentacles in `Inventory::query`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TentacleFilter {
    pub mcu: Option<String>,
    pub board: Option<String>,
    pub gadgets: BTreeSet<String>,
    /// Serial patterns: full, prefix or short suffix
    pub serials: Vec<String>,
    /// Only visible, probed and unleased tentacles
    pub available_only: bool,
}

impl TentacleFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn available() -> Self {
        Self {
            available_only: true,
            ..Self::default()
        }
    }

    pub fn mcu(mut self, mcu: impl Into<String>) -> Self {
        self.mcu = Some(mcu.into());
        self
    }

    pub fn board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    pub fn gadget(mut self, gadget: impl Into<String>) -> Self {
        self.gadgets.insert(gadget.into());
        self
    }

    pub fn serial(mut self, pattern: impl Into<String>) -> Self {
        self.serials.push(pattern.into());
        self
    }

    pub fn matches(&self, tentacle: &Tentacle) -> bool {
        if !self.serials.is_empty() && !self.serials.iter().any(|p| tentacle.id.matches(p)) {
            return false;
        }
        if self.available_only && (tentacle.leased || !tentacle.is_present()) {
            return false;
        }
        let needs_caps = self.available_only
            || self.mcu.is_some()
            || self.board.is_some()
            || !self.gadgets.is_empty();
        if !needs_caps {
            return true;
        }
        let Some(caps) = tentacle.capabilities.known() else {
            return false;
        };
        self.mcu
            .as_ref()
            .is_none_or(|mcu| caps.mcu.as_ref().is_some_and(|m| m.eq_ignore_ascii_case(mcu)))
            && self.board.as_ref().is_none_or(|b| caps.boards.contains(b))
            && self.gadgets.is_subset(&caps.gadgets)
    }
}

/// What one `refresh` found
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub visible: Vec<TentacleId>,
    pub newly_probed: Vec<TentacleId>,
    pub missing: Vec<TentacleId>,
    pub probe_failures: BTreeMap<TentacleId, String>,
    pub unpowered_hubs: Vec<UsbPortPath>,
    pub infra_in_bootloader: Vec<UsbPortPath>,
}

struct Entry {
    handle: Arc<TentacleHandle>,
    label: Option<String>,
    port: Option<PortInfo>,
    capabilities: Option<CapabilitySet>,
    leased: bool,
}

impl Entry {
    fn new(id: TentacleId) -> Self {
        Self {
            handle: Arc::new(TentacleHandle::new(id)),
            label: None,
            port: None,
            capabilities: None,
            leased: false,
        }
    }

    fn capabilities(&self) -> Capabilities {
        match (&self.port, &self.capabilities) {
            (Some(_), Some(set)) => Capabilities::Known(set.clone()),
            _ => Capabilities::Unknown,
        }
    }
}

/// Registry of tentacles and their leases
pub struct Inventory {
    enumerator: Arc<dyn UsbEnumerator>,
    resolver: TopologyResolver,
    power: Arc<PowerController>,
    probe: Arc<dyn CapabilityProbe>,
    entries: RwLock<BTreeMap<TentacleId, Entry>>,
}

impl Inventory {
    pub fn new(
        enumerator: Arc<dyn UsbEnumerator>,
        power: Arc<PowerController>,
        probe: Arc<dyn CapabilityProbe>,
    ) -> Self {
        Self {
            enumerator,
            resolver: TopologyResolver::default(),
            power,
            probe,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn resolver(mut self, resolver: TopologyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Know about configured tentacles before they are ever seen
    pub fn declare(&self, decls: &BTreeMap<TentacleId, TentacleDecl>) {
        let mut entries = self.entries.write();
        for (id, decl) in decls {
            let entry = entries
                .entry(id.clone())
                .or_insert_with(|| Entry::new(id.clone()));
            entry.label = decl.label.clone();
        }
    }

    /// Rescan USB and probe tentacles seen for the first time.
    ///
    /// Tentacles that vanished stay in the inventory with no port and
    /// unknown capabilities, and their rail states are dropped. Leased
    /// tentacles are never probed.
    pub async fn refresh(&self) -> RigResult<RefreshReport> {
        let snapshot = self.enumerator.scan().await?;
        let topology = self.resolver.resolve(&snapshot)?;

        let mut report = RefreshReport {
            unpowered_hubs: topology.unpowered_hubs.clone(),
            infra_in_bootloader: topology.infra_in_bootloader.clone(),
            ..Default::default()
        };
        let mut to_probe: Vec<(TentacleId, PortInfo)> = Vec::new();
        let mut stale: Vec<TentacleId> = Vec::new();
        {
            let mut entries = self.entries.write();
            for (id, entry) in entries.iter_mut() {
                if !topology.tentacles.contains_key(id) && entry.port.take().is_some() {
                    info!(tentacle = %id, "tentacle disappeared");
                    report.missing.push(id.clone());
                    stale.push(id.clone());
                }
            }
            for (id, port) in &topology.tentacles {
                let entry = entries
                    .entry(id.clone())
                    .or_insert_with(|| Entry::new(id.clone()));
                match &entry.port {
                    None => {
                        info!(tentacle = %id, port = %port.infra_port, revision = %port.revision, "tentacle visible");
                    }
                    Some(old) if old.hub_port != port.hub_port => {
                        info!(tentacle = %id, from = %old.hub_port, to = %port.hub_port, "tentacle moved");
                        stale.push(id.clone());
                    }
                    Some(_) => {}
                }
                entry.port = Some(port.clone());
                report.visible.push(id.clone());
                if entry.capabilities.is_none() && !entry.leased {
                    // Held for the probe so nobody else drives it meanwhile
                    entry.leased = true;
                    to_probe.push((id.clone(), port.clone()));
                }
            }
        }
        for id in &stale {
            self.power.forget(id);
        }

        for (id, port) in to_probe {
            let probed = self.probe_one(&id, &port).await;
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(&id) else {
                continue;
            };
            entry.leased = false;
            match probed {
                Ok(set) => {
                    debug!(tentacle = %id, ?set, "probed");
                    entry.capabilities = Some(set);
                    report.newly_probed.push(id);
                }
                Err(err) => {
                    warn!(tentacle = %id, %err, "capability probe failed");
                    report.probe_failures.insert(id, err.to_string());
                }
            }
        }
        Ok(report)
    }

    async fn probe_one(&self, id: &TentacleId, port: &PortInfo) -> RigResult<CapabilitySet> {
        let scope = PowerScope::new(id.clone(), port);
        self.power.apply_idle(&scope).await?;
        let probed = self.probe.probe(id, port).await;
        if let Err(err) = self.power.apply_idle(&scope).await {
            warn!(tentacle = %id, %err, "could not rest tentacle after probe");
        }
        probed
    }

    /// Refresh on an interval until cancelled
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.refresh().await {
                            warn!(%err, "periodic refresh failed");
                        }
                    }
                }
            }
        })
    }

    /// Snapshots of matching tentacles, ordered by id
    pub fn query(&self, filter: &TentacleFilter) -> Vec<Tentacle> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|(id, entry)| self.snapshot(id, entry))
            .filter(|t| filter.matches(t))
            .collect()
    }

    pub fn get(&self, id: &TentacleId) -> Option<Tentacle> {
        let entries = self.entries.read();
        entries.get(id).map(|entry| self.snapshot(id, entry))
    }

    fn snapshot(&self, id: &TentacleId, entry: &Entry) -> Tentacle {
        Tentacle {
            id: id.clone(),
            label: entry.label.clone(),
            revision: entry.port.as_ref().map(|p| p.revision),
            infra_port: entry.port.as_ref().map(|p| p.infra_port.clone()),
            dut_port: entry.port.as_ref().map(|p| p.dut_port.clone()),
            infra_tty: entry.port.as_ref().and_then(|p| p.infra_tty.clone()),
            capabilities: entry.capabilities(),
            power_state: self.power.rail_states(id),
            boot_state: entry.handle.boot_state(),
            leased: entry.leased,
        }
    }

    /// Take the exclusive lease on one tentacle
    pub fn acquire(&self, id: &TentacleId) -> RigResult<TentacleLease> {
        let mut entries = self.entries.write();
        Self::lease(&mut entries, id)
    }

    /// Lease several tentacles at once, in ascending id order.
    ///
    /// Either every lease is granted or none is.
    pub fn acquire_all(&self, ids: &[TentacleId]) -> RigResult<Vec<TentacleLease>> {
        let ordered: BTreeSet<&TentacleId> = ids.iter().collect();
        let mut entries = self.entries.write();

        for id in &ordered {
            match entries.get(*id) {
                None => return Err(RigError::UnknownTentacle(id.to_string())),
                Some(entry) if entry.leased => return Err(RigError::AlreadyInUse((*id).clone())),
                Some(_) => {}
            }
        }
        ordered
            .into_iter()
            .map(|id| Self::lease(&mut entries, id))
            .collect()
    }

    fn lease(entries: &mut BTreeMap<TentacleId, Entry>, id: &TentacleId) -> RigResult<TentacleLease> {
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RigError::UnknownTentacle(id.to_string()))?;
        if entry.leased {
            return Err(RigError::AlreadyInUse(id.clone()));
        }
        entry.leased = true;
        debug!(tentacle = %id, "leased");
        Ok(TentacleLease::new(
            entry.handle.clone(),
            entry.port.clone(),
            entry.capabilities(),
        ))
    }

    /// Give a lease back
    pub fn release(&self, mut lease: TentacleLease) {
        self.release_in_place(&mut lease);
    }

    /// Release through a borrow, for holders that cannot give the lease up
    pub(crate) fn release_in_place(&self, lease: &mut TentacleLease) {
        if lease.is_released() {
            return;
        }
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(lease.id()) {
            entry.leased = false;
            debug!(tentacle = %lease.id(), "released");
        }
        lease.mark_released();
    }
}
