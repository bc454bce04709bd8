//! Power rail control
//!
//! Rails map onto channels of relay boards. Several tentacles may share a
//! board, so every board has its own lock and batches that span boards take
//! the locks in `BoardId` order.

use crate::rail::{BoardAddress, BoardId, Rail, RelayAssignment};
use crate::tentacle::TentacleLease;
use crate::topology::PortInfo;
use crate::types::{HardwareRevision, TentacleId};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

/// Driver for one kind of relay board
#[async_trait]
pub trait RelayBus: Send + Sync {
    /// Human-readable name for this bus
    fn name(&self) -> &'static str;

    /// Current channel levels the board reports. Channels it cannot read are omitted.
    async fn levels(&self, board: &BoardAddress) -> RigResult<BTreeMap<u8, bool>>;

    /// Drive `(channel, level)` pairs on one board, in the given order.
    ///
    /// Either every channel is driven or the board is left as it was.
    async fn apply(&self, board: &BoardAddress, batch: &[(u8, bool)]) -> RigResult<()>;
}

/// Where a tentacle's rails are and how to reach its boards
#[derive(Debug, Clone)]
pub struct PowerScope {
    pub tentacle: TentacleId,
    pub revision: HardwareRevision,
    pub port: Option<PortInfo>,
}

impl PowerScope {
    pub fn new(tentacle: TentacleId, port: &PortInfo) -> Self {
        Self {
            tentacle,
            revision: port.revision,
            port: Some(port.clone()),
        }
    }

    fn board_address(&self, id: BoardId) -> BoardAddress {
        let port = self.port.as_ref();
        let hub = match &id {
            BoardId::Shared(_) => None,
            _ => port.map(|p| p.hub_port.clone()),
        };
        BoardAddress {
            id,
            hub,
            infra_tty: port.and_then(|p| p.infra_tty.clone()),
        }
    }
}

/// Last levels seen or driven on one board
#[derive(Debug, Default)]
struct BoardSlot {
    channels: BTreeMap<u8, bool>,
}

struct PlannedBoard {
    address: BoardAddress,
    /// channel -> level, last request wins
    levels: BTreeMap<u8, bool>,
}

/// Switches rails with all-or-nothing semantics per call
pub struct PowerController {
    assignment: Arc<RelayAssignment>,
    bus: Arc<dyn RelayBus>,
    boards: Mutex<HashMap<BoardId, Arc<AsyncMutex<BoardSlot>>>>,
    rails: Mutex<HashMap<TentacleId, BTreeMap<Rail, bool>>>,
}

impl PowerController {
    pub fn new(assignment: RelayAssignment, bus: Arc<dyn RelayBus>) -> Self {
        Self {
            assignment: Arc::new(assignment),
            bus,
            boards: Mutex::new(HashMap::new()),
            rails: Mutex::new(HashMap::new()),
        }
    }

    pub fn assignment(&self) -> &RelayAssignment {
        &self.assignment
    }

    /// Set rails of a leased tentacle
    pub async fn set_rails(&self, lease: &TentacleLease, changes: &[(Rail, bool)]) -> RigResult<()> {
        let scope = lease.power_scope()?;
        self.apply(&scope, changes).await
    }

    /// Set rails by name. Every name is checked before any hardware is touched.
    pub async fn set_rails_by_name(
        &self,
        lease: &TentacleLease,
        changes: &[(&str, bool)],
    ) -> RigResult<()> {
        let parsed = changes
            .iter()
            .map(|(name, on)| name.parse::<Rail>().map(|rail| (rail, *on)))
            .collect::<RigResult<Vec<_>>>()?;
        self.set_rails(lease, &parsed).await
    }

    /// Put a leased tentacle into its resting state
    pub async fn idle(&self, lease: &TentacleLease) -> RigResult<()> {
        let scope = lease.power_scope()?;
        self.apply_idle(&scope).await
    }

    /// Cut every rail, the infra controller included. The tentacle drops off USB.
    pub async fn all_off(&self, lease: &TentacleLease) -> RigResult<()> {
        let scope = lease.power_scope()?;
        let preset = self.assignment.all_off(scope.revision);
        self.apply(&scope, &preset).await
    }

    pub(crate) async fn apply_idle(&self, scope: &PowerScope) -> RigResult<()> {
        let preset = self.assignment.idle(scope.revision);
        self.apply(scope, &preset).await
    }

    /// Last known state of every rail of a tentacle that was ever switched
    pub fn rail_states(&self, tentacle: &TentacleId) -> BTreeMap<Rail, bool> {
        self.rails.lock().get(tentacle).cloned().unwrap_or_default()
    }

    /// Apply rail changes for one tentacle.
    ///
    /// Offs go out before ons on every board. Levels are read back from each
    /// board under its lock and channels already at the requested level are
    /// not driven. If any board fails, boards already driven by this call are
    /// restored before the error is returned.
    pub(crate) async fn apply(&self, scope: &PowerScope, changes: &[(Rail, bool)]) -> RigResult<()> {
        let mut plan: BTreeMap<BoardId, PlannedBoard> = BTreeMap::new();
        let mut requested: BTreeMap<Rail, bool> = BTreeMap::new();
        for (rail, on) in changes {
            let address = self.assignment.address(scope.revision, *rail)?;
            let board = address.board_id(&scope.tentacle);
            plan.entry(board.clone())
                .or_insert_with(|| PlannedBoard {
                    address: scope.board_address(board),
                    levels: BTreeMap::new(),
                })
                .levels
                .insert(address.channel, address.level(*on));
            requested.insert(*rail, *on);
        }
        if plan.is_empty() {
            return Ok(());
        }

        let mut guards: Vec<OwnedMutexGuard<BoardSlot>> = Vec::with_capacity(plan.len());
        for board in plan.keys() {
            guards.push(self.slot(board).lock_owned().await);
        }

        let mut driven: Vec<(usize, Vec<(u8, Option<bool>)>)> = Vec::new();
        for (index, planned) in plan.values().enumerate() {
            let slot = &mut guards[index];
            // Levels may have changed since the last batch through resets or manual switching
            match self.bus.levels(&planned.address).await {
                Ok(levels) => slot.channels.extend(levels),
                Err(err) => {
                    debug!(board = %planned.address.id, %err, "board levels unreadable");
                    for channel in planned.levels.keys() {
                        slot.channels.remove(channel);
                    }
                }
            }

            let mut batch: Vec<(u8, bool)> = planned
                .levels
                .iter()
                .filter(|&(channel, level)| slot.channels.get(channel) != Some(level))
                .map(|(channel, level)| (*channel, *level))
                .collect();
            if batch.is_empty() {
                continue;
            }
            batch.sort_by_key(|(channel, level)| (*level, *channel));

            debug!(board = %planned.address.id, ?batch, "driving relay channels");
            if let Err(err) = self.bus.apply(&planned.address, &batch).await {
                warn!(board = %planned.address.id, %err, "relay batch failed, rolling back");
                self.roll_back(&plan, &mut guards, driven).await;
                return Err(err);
            }

            let previous = batch
                .iter()
                .map(|(channel, _)| (*channel, slot.channels.get(channel).copied()))
                .collect();
            for (channel, level) in batch {
                slot.channels.insert(channel, level);
            }
            driven.push((index, previous));
        }

        let mut rails = self.rails.lock();
        rails.entry(scope.tentacle.clone()).or_default().extend(requested);
        info!(tentacle = %scope.tentacle, changes = changes.len(), "rails set");
        Ok(())
    }

    async fn roll_back(
        &self,
        plan: &BTreeMap<BoardId, PlannedBoard>,
        guards: &mut [OwnedMutexGuard<BoardSlot>],
        driven: Vec<(usize, Vec<(u8, Option<bool>)>)>,
    ) {
        let addresses: Vec<&BoardAddress> = plan.values().map(|p| &p.address).collect();
        for (index, previous) in driven.into_iter().rev() {
            let slot = &mut guards[index];
            let mut restore: Vec<(u8, bool)> = previous
                .iter()
                .map(|(channel, before)| {
                    let now = slot.channels.get(channel).copied().unwrap_or(false);
                    (*channel, before.unwrap_or(!now))
                })
                .collect();
            restore.sort_by_key(|(channel, level)| (*level, *channel));

            match self.bus.apply(addresses[index], &restore).await {
                Ok(()) => {
                    for (channel, level) in restore {
                        slot.channels.insert(channel, level);
                    }
                }
                Err(err) => {
                    error!(board = %addresses[index].id, %err, "rollback failed, board state unknown");
                    for (channel, _) in restore {
                        slot.channels.remove(&channel);
                    }
                }
            }
        }
    }

    /// Drop what is known about a tentacle that left the rig or moved ports.
    ///
    /// Its own boards are forgotten unless a batch is in flight on them.
    pub fn forget(&self, tentacle: &TentacleId) {
        self.rails.lock().remove(tentacle);
        let mut boards = self.boards.lock();
        for board in [BoardId::Hub(tentacle.clone()), BoardId::Infra(tentacle.clone())] {
            if boards.get(&board).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                boards.remove(&board);
            }
        }
        debug!(%tentacle, "power state forgotten");
    }

    fn slot(&self, board: &BoardId) -> Arc<AsyncMutex<BoardSlot>> {
        self.boards
            .lock()
            .entry(board.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(BoardSlot::default())))
            .clone()
    }
}

/// Relay bus for boards this host has no driver for
#[derive(Debug, Clone)]
pub struct UnavailableRelayBus {
    reason: String,
}

impl UnavailableRelayBus {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl RelayBus for UnavailableRelayBus {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn levels(&self, _board: &BoardAddress) -> RigResult<BTreeMap<u8, bool>> {
        Ok(BTreeMap::new())
    }

    async fn apply(&self, board: &BoardAddress, _batch: &[(u8, bool)]) -> RigResult<()> {
        Err(RigError::infra(format!("no relay driver for {}: {}", board.id, self.reason)))
    }
}

/// Routes each board to the bus that drives its kind
pub struct RoutedRelayBus {
    hub: Arc<dyn RelayBus>,
    infra: Arc<dyn RelayBus>,
    shared: Arc<dyn RelayBus>,
}

impl RoutedRelayBus {
    pub fn new(hub: Arc<dyn RelayBus>, infra: Arc<dyn RelayBus>, shared: Arc<dyn RelayBus>) -> Self {
        Self { hub, infra, shared }
    }

    fn route(&self, board: &BoardAddress) -> &Arc<dyn RelayBus> {
        match board.id {
            BoardId::Hub(_) => &self.hub,
            BoardId::Infra(_) => &self.infra,
            BoardId::Shared(_) => &self.shared,
        }
    }
}

#[async_trait]
impl RelayBus for RoutedRelayBus {
    fn name(&self) -> &'static str {
        "routed"
    }

    async fn levels(&self, board: &BoardAddress) -> RigResult<BTreeMap<u8, bool>> {
        self.route(board).levels(board).await
    }

    async fn apply(&self, board: &BoardAddress, batch: &[(u8, bool)]) -> RigResult<()> {
        self.route(board).apply(board, batch).await
    }
}
