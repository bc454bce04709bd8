//! Simulated rig for tests
//!
//! `SimRig` plays USB enumeration, relay boards, the programming tool and
//! bootloader volumes at once, so whole boot and flash sequences run
//! without hardware. Faults are injected per board or per tentacle.

use crate::bootmode::BootModeSequencer;
use crate::config::{TentacleDecl, TimingConfig};
use crate::error::FlashCause;
use crate::executor::{ExecutorContext, ExecutorReport, TestExecutor};
use crate::firmware::{FirmwareArtifact, FirmwareFlasher, FlashTool, MassStorageWriter, ProgramRequest};
use crate::inventory::{CapabilityProbe, Inventory};
use crate::orchestrator::RunOrchestratorBuilder;
use crate::power::{PowerController, RelayBus};
use crate::process::CommandOutput;
use crate::rail::{BoardAddress, BoardId, RelayAssignment};
use crate::tentacle::{CapabilitySet, TentacleLease};
use crate::topology::{PortInfo, UsbDevice, UsbEnumerator, UsbSnapshot};
use crate::types::{BusAddress, DeviceClass, HardwareRevision, TentacleId, UsbId, UsbPortPath};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SIM_BUS: u8 = 1;
const DUT_BOOTLOADER: UsbId = UsbId::new(0x2E8A, 0x0003);
const DUT_APPLICATION: UsbId = UsbId::new(0x2E8A, 0x0005);

/// Which bootloader the simulated DUT exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimBootloader {
    MassStorage,
    Programming,
}

/// Misbehaviour of a simulated DUT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DutFault {
    #[default]
    None,
    /// Never shows up on USB, whatever the rails do
    NeverEnumerates,
    /// Takes firmware but keeps coming back as a bootloader
    StuckInBootloader,
    /// Boots its application even with the boot button held
    IgnoresBootButton,
}

/// What the simulated DUT is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutMode {
    Off,
    Bootloader,
    Application,
}

/// One simulated tentacle
#[derive(Debug, Clone)]
pub struct SimTentacle {
    pub id: TentacleId,
    pub revision: HardwareRevision,
    pub hub: UsbPortPath,
    pub tags: String,
    pub gadgets: Vec<String>,
    pub bootloader: SimBootloader,
    pub fault: DutFault,
    /// Relay wired to the boot button
    pub boot_relay: u8,
    pub mount_point: Option<PathBuf>,
}

impl SimTentacle {
    /// A v0.4 rp2 tentacle with a mass storage bootloader behind `hub`
    pub fn new(serial: &str, hub: &str) -> Self {
        Self {
            id: TentacleId::new(serial).unwrap(),
            revision: HardwareRevision::V04,
            hub: hub.parse().unwrap(),
            tags: "mcu=rp2,boards=RPI_PICO,programmer=picotool".to_string(),
            gadgets: vec![],
            bootloader: SimBootloader::MassStorage,
            fault: DutFault::None,
            boot_relay: 1,
            mount_point: None,
        }
    }

    pub fn revision(mut self, revision: HardwareRevision) -> Self {
        self.revision = revision;
        self
    }

    pub fn tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_string();
        self
    }

    pub fn gadget(mut self, gadget: &str) -> Self {
        self.gadgets.push(gadget.to_string());
        self
    }

    pub fn bootloader(mut self, bootloader: SimBootloader) -> Self {
        self.bootloader = bootloader;
        self
    }

    pub fn fault(mut self, fault: DutFault) -> Self {
        self.fault = fault;
        self
    }

    pub fn mount_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_point = Some(path.into());
        self
    }

    /// Declaration matching this tentacle's tags
    pub fn decl(&self) -> TentacleDecl {
        let mut decl = TentacleDecl::new(self.id.as_str(), self.tags.as_str());
        decl.gadgets = self.gadgets.clone();
        decl
    }
}

struct SimBoard {
    spec: SimTentacle,
    slot: u8,
    plugged: bool,
    hub_channels: BTreeMap<u8, bool>,
    infra_channels: BTreeMap<u8, bool>,
    dut: DutMode,
}

impl SimBoard {
    fn new(spec: SimTentacle, slot: u8) -> Self {
        // Hub ports come up powered, the infra relays released
        let hub_channels = (1..=4).map(|port| (port, true)).collect();
        let mut board = Self {
            spec,
            slot,
            plugged: true,
            hub_channels,
            infra_channels: BTreeMap::new(),
            dut: DutMode::Off,
        };
        board.settle();
        board
    }

    fn dut_path(&self) -> UsbPortPath {
        self.spec.hub.child(self.spec.revision.dut_port())
    }

    fn address(&self) -> BusAddress {
        BusAddress {
            bus: SIM_BUS,
            device: 10 + self.slot,
        }
    }

    fn mount_point(&self) -> PathBuf {
        self.spec
            .mount_point
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/media/sim/{}", self.spec.id.short())))
    }

    fn infra_powered(&self) -> bool {
        self.hub_channels.get(&self.spec.revision.infra_port()) == Some(&true)
    }

    /// Follow the DUT through whatever the rails just did
    fn settle(&mut self) {
        let powered = self.hub_channels.get(&self.spec.revision.dut_port()) == Some(&true);
        let boot_held = self.infra_channels.get(&self.spec.boot_relay) == Some(&true);
        self.dut = match (self.dut, powered) {
            (_, false) => DutMode::Off,
            (DutMode::Off, true) if boot_held && self.spec.fault != DutFault::IgnoresBootButton => {
                DutMode::Bootloader
            }
            (DutMode::Off, true) => DutMode::Application,
            (mode, true) => mode,
        };
    }

    fn devices(&self) -> Vec<UsbDevice> {
        let mut devices = vec![UsbDevice::new(UsbId::TENTACLE_HUB, self.spec.hub.clone(), DeviceClass::Hub)];
        if self.infra_powered() {
            devices.push(
                UsbDevice::new(
                    UsbId::INFRA_APPLICATION,
                    self.spec.hub.child(self.spec.revision.infra_port()),
                    DeviceClass::Serial,
                )
                .serial(self.spec.id.as_str())
                .tty(format!("/dev/ttyACM{}", u32::from(self.slot) * 2)),
            );
        }
        if self.spec.fault == DutFault::NeverEnumerates {
            return devices;
        }
        let dut = match (self.dut, self.spec.bootloader) {
            (DutMode::Off, _) => return devices,
            (DutMode::Bootloader, SimBootloader::MassStorage) => {
                UsbDevice::new(DUT_BOOTLOADER, self.dut_path(), DeviceClass::MassStorage)
                    .mount_point(self.mount_point())
            }
            (DutMode::Bootloader, SimBootloader::Programming) => {
                let address = self.address();
                UsbDevice::new(DUT_BOOTLOADER, self.dut_path(), DeviceClass::VendorBootloader)
                    .address(address.bus, address.device)
            }
            (DutMode::Application, _) => {
                UsbDevice::new(DUT_APPLICATION, self.dut_path(), DeviceClass::Serial)
                    .tty(format!("/dev/ttyACM{}", u32::from(self.slot) * 2 + 1))
            }
        };
        devices.push(dut);
        devices
    }
}

#[derive(Default)]
struct SimState {
    boards: BTreeMap<TentacleId, SimBoard>,
    shared: BTreeMap<String, BTreeMap<u8, bool>>,
    failing_boards: BTreeSet<BoardId>,
    tool_failures: u32,
    copy_failures: u32,
    batches: Vec<(BoardId, Vec<(u8, bool)>)>,
    writes: Vec<(BoardId, u8, bool)>,
    write_delay: Option<Duration>,
    flashes: Vec<(TentacleId, PathBuf)>,
    probes: Vec<TentacleId>,
    scans: usize,
}

/// A whole rig in memory
#[derive(Default)]
pub struct SimRig {
    state: Mutex<SimState>,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, tentacle: SimTentacle) -> Self {
        self.add(tentacle);
        self
    }

    pub fn add(&self, tentacle: SimTentacle) {
        let mut state = self.state.lock();
        let slot = state.boards.len() as u8;
        state
            .boards
            .insert(tentacle.id.clone(), SimBoard::new(tentacle, slot));
    }

    /// Pull the tentacle's USB cable
    pub fn unplug(&self, id: &TentacleId) {
        if let Some(board) = self.state.lock().boards.get_mut(id) {
            board.plugged = false;
        }
    }

    pub fn plug(&self, id: &TentacleId) {
        if let Some(board) = self.state.lock().boards.get_mut(id) {
            board.plugged = true;
        }
    }

    pub fn set_fault(&self, id: &TentacleId, fault: DutFault) {
        if let Some(board) = self.state.lock().boards.get_mut(id) {
            board.spec.fault = fault;
        }
    }

    /// Power-cycle a tentacle's hub: every port comes back powered
    pub fn reset_hub(&self, id: &TentacleId) {
        if let Some(board) = self.state.lock().boards.get_mut(id) {
            board.hub_channels = (1..=4).map(|port| (port, true)).collect();
            board.settle();
        }
    }

    /// Switch relay channels one at a time, pausing after each
    pub fn write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = Some(delay);
    }

    /// Make a relay board refuse every batch
    pub fn disconnect_board(&self, board: BoardId) {
        self.state.lock().failing_boards.insert(board);
    }

    pub fn reconnect_board(&self, board: &BoardId) {
        self.state.lock().failing_boards.remove(board);
    }

    /// Fail the next `times` programming tool runs
    pub fn fail_tool(&self, times: u32) {
        self.state.lock().tool_failures = times;
    }

    /// Fail the next `times` copies onto a bootloader volume
    pub fn fail_copy(&self, times: u32) {
        self.state.lock().copy_failures = times;
    }

    pub fn dut_mode(&self, id: &TentacleId) -> Option<DutMode> {
        self.state.lock().boards.get(id).map(|board| board.dut)
    }

    /// Level of one channel of a board, `None` if never driven
    pub fn channel(&self, board: &BoardId, channel: u8) -> Option<bool> {
        let state = self.state.lock();
        match board {
            BoardId::Hub(id) => state.boards.get(id)?.hub_channels.get(&channel).copied(),
            BoardId::Infra(id) => state.boards.get(id)?.infra_channels.get(&channel).copied(),
            BoardId::Shared(name) => state.shared.get(name)?.get(&channel).copied(),
        }
    }

    /// Every batch a relay board accepted, in order
    pub fn batches(&self) -> Vec<(BoardId, Vec<(u8, bool)>)> {
        self.state.lock().batches.clone()
    }

    /// Every single channel write, in the order the boards saw them
    pub fn writes(&self) -> Vec<(BoardId, u8, bool)> {
        self.state.lock().writes.clone()
    }

    pub fn flashes(&self) -> Vec<(TentacleId, PathBuf)> {
        self.state.lock().flashes.clone()
    }

    pub fn probes(&self) -> Vec<TentacleId> {
        self.state.lock().probes.clone()
    }

    pub fn scans(&self) -> usize {
        self.state.lock().scans
    }

    /// Declarations for every simulated tentacle
    pub fn decls(&self) -> BTreeMap<TentacleId, TentacleDecl> {
        self.state
            .lock()
            .boards
            .iter()
            .map(|(id, board)| (id.clone(), board.spec.decl()))
            .collect()
    }
}

fn write_channels(state: &mut SimState, board: &BoardId, batch: &[(u8, bool)]) -> RigResult<()> {
    if state.failing_boards.contains(board) {
        return Err(RigError::infra(format!("sim: {board} disconnected")));
    }
    let channels = channels_mut(state, board)?;
    for (channel, level) in batch {
        channels.insert(*channel, *level);
    }
    for (channel, level) in batch {
        state.writes.push((board.clone(), *channel, *level));
    }
    if let BoardId::Hub(id) | BoardId::Infra(id) = board {
        if let Some(sim) = state.boards.get_mut(id) {
            sim.settle();
        }
    }
    Ok(())
}

fn channels_mut<'a>(state: &'a mut SimState, board: &BoardId) -> RigResult<&'a mut BTreeMap<u8, bool>> {
    match board {
        BoardId::Hub(id) | BoardId::Infra(id) => {
            let sim = state
                .boards
                .get_mut(id)
                .filter(|b| b.plugged)
                .ok_or_else(|| RigError::infra(format!("sim: {board} not reachable")))?;
            Ok(match board {
                BoardId::Hub(_) => &mut sim.hub_channels,
                _ => &mut sim.infra_channels,
            })
        }
        BoardId::Shared(name) => Ok(state.shared.entry(name.clone()).or_default()),
    }
}

#[async_trait]
impl UsbEnumerator for SimRig {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn scan(&self) -> RigResult<UsbSnapshot> {
        let mut state = self.state.lock();
        state.scans += 1;
        let devices = state
            .boards
            .values()
            .filter(|board| board.plugged)
            .flat_map(SimBoard::devices)
            .collect();
        Ok(UsbSnapshot::new(devices))
    }
}

#[async_trait]
impl RelayBus for SimRig {
    fn name(&self) -> &'static str {
        "sim"
    }

    async fn levels(&self, board: &BoardAddress) -> RigResult<BTreeMap<u8, bool>> {
        let mut state = self.state.lock();
        if state.failing_boards.contains(&board.id) {
            return Err(RigError::infra(format!("sim: {} disconnected", board.id)));
        }
        channels_mut(&mut state, &board.id).map(|channels| channels.clone())
    }

    async fn apply(&self, board: &BoardAddress, batch: &[(u8, bool)]) -> RigResult<()> {
        let delay = self.state.lock().write_delay;
        let Some(delay) = delay else {
            let mut state = self.state.lock();
            write_channels(&mut state, &board.id, batch)?;
            state.batches.push((board.id.clone(), batch.to_vec()));
            return Ok(());
        };
        for write in batch {
            {
                let mut state = self.state.lock();
                write_channels(&mut state, &board.id, std::slice::from_ref(write))?;
            }
            tokio::time::sleep(delay).await;
        }
        self.state.lock().batches.push((board.id.clone(), batch.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl FlashTool for SimRig {
    async fn program(&self, request: &ProgramRequest<'_>) -> Result<CommandOutput, FlashCause> {
        let mut state = self.state.lock();
        if state.tool_failures > 0 {
            state.tool_failures -= 1;
            return Err(FlashCause::ToolExit {
                programmer: request.programmer.to_string(),
                code: Some(1),
                stderr: "sim: no accessible device".to_string(),
            });
        }
        let board = state
            .boards
            .values_mut()
            .find(|b| {
                b.plugged && b.dut == DutMode::Bootloader && Some(b.address()) == request.address
            })
            .ok_or_else(|| FlashCause::Device(format!("sim: nothing at {:?}", request.address)))?;
        if board.spec.fault != DutFault::StuckInBootloader {
            board.dut = DutMode::Application;
        }
        let flashed = (board.spec.id.clone(), request.artifact.to_path_buf());
        state.flashes.push(flashed);
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout: "sim: loaded".to_string(),
            stderr: String::new(),
            duration_ms: 0,
        })
    }
}

#[async_trait]
impl MassStorageWriter for SimRig {
    async fn write(&self, device: &UsbDevice, artifact: &FirmwareArtifact) -> Result<PathBuf, FlashCause> {
        let mut state = self.state.lock();
        if state.copy_failures > 0 {
            state.copy_failures -= 1;
            return Err(FlashCause::Copy("sim: volume went away".to_string()));
        }
        let board = state
            .boards
            .values_mut()
            .find(|b| b.plugged && b.dut == DutMode::Bootloader && b.dut_path() == device.port)
            .ok_or_else(|| FlashCause::Device(format!("sim: no volume at {}", device.port)))?;
        let name = artifact
            .path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("firmware.uf2"));
        let target = board.mount_point().join(name);
        if board.spec.fault != DutFault::StuckInBootloader {
            board.dut = DutMode::Application;
        }
        let flashed = (board.spec.id.clone(), artifact.path.clone());
        state.flashes.push(flashed);
        Ok(target)
    }
}

#[async_trait]
impl CapabilityProbe for SimRig {
    async fn probe(&self, id: &TentacleId, _port: &PortInfo) -> RigResult<CapabilitySet> {
        let mut state = self.state.lock();
        let decl = state
            .boards
            .get(id)
            .filter(|b| b.plugged)
            .map(|b| b.spec.decl())
            .ok_or_else(|| RigError::UnknownTentacle(id.to_string()))?;
        state.probes.push(id.clone());
        CapabilitySet::from_decl(&decl)
    }
}

/// The rig's services wired to one `SimRig`
pub struct Harness {
    pub rig: Arc<SimRig>,
    pub timing: TimingConfig,
    pub power: Arc<PowerController>,
    pub inventory: Arc<Inventory>,
    pub sequencer: Arc<BootModeSequencer>,
    pub flasher: Arc<FirmwareFlasher>,
}

impl Harness {
    pub fn new(rig: SimRig) -> Self {
        Self::with_timing(rig, TimingConfig::default())
    }

    pub fn with_timing(rig: SimRig, timing: TimingConfig) -> Self {
        Self::build(rig, timing, RelayAssignment::standard())
    }

    /// Harness whose rails follow `assignment`
    pub fn with_assignment(rig: SimRig, assignment: RelayAssignment) -> Self {
        Self::build(rig, TimingConfig::default(), assignment)
    }

    fn build(rig: SimRig, timing: TimingConfig, assignment: RelayAssignment) -> Self {
        let rig = Arc::new(rig);
        let power = Arc::new(PowerController::new(assignment, rig.clone()));
        let inventory = Arc::new(Inventory::new(rig.clone(), power.clone(), rig.clone()));
        inventory.declare(&rig.decls());
        let sequencer = Arc::new(BootModeSequencer::new(power.clone(), rig.clone(), timing.clone()));
        let flasher = Arc::new(FirmwareFlasher::new(
            rig.clone(),
            rig.clone(),
            timing.tool_timeout(),
            timing.reenumeration_timeout(),
        ));
        Self {
            rig,
            timing,
            power,
            inventory,
            sequencer,
            flasher,
        }
    }

    /// Orchestrator builder wired to this harness
    pub fn orchestrator(&self) -> RunOrchestratorBuilder {
        RunOrchestratorBuilder::new()
            .inventory(self.inventory.clone())
            .sequencer(self.sequencer.clone())
            .flasher(self.flasher.clone())
    }

    /// Refresh the inventory and lease one tentacle
    pub async fn lease(&self, id: &TentacleId) -> RigResult<TentacleLease> {
        self.inventory.refresh().await?;
        self.inventory.acquire(id)
    }
}

/// Write a firmware file into `dir` and describe it
pub async fn artifact(dir: &Path, name: &str, mcu: &str) -> FirmwareArtifact {
    let path = dir.join(name);
    tokio::fs::write(&path, format!("{name} for {mcu}")).await.unwrap();
    FirmwareArtifact::from_file(path, mcu).await.unwrap()
}

#[derive(Debug, Clone)]
enum Script {
    Report(ExecutorReport),
    Error(String),
    Hang,
}

/// Executor answering per role from a script; unscripted roles pass
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<BTreeMap<String, Script>>,
    delay: Option<Duration>,
    contexts: Mutex<Vec<ExecutorContext>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take this long for every role
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail(self, role: &str, summary: &str) -> Self {
        self.scripts
            .lock()
            .insert(role.to_string(), Script::Report(ExecutorReport::fail(summary)));
        self
    }

    /// The executor itself breaks for this role
    pub fn error(self, role: &str, message: &str) -> Self {
        self.scripts
            .lock()
            .insert(role.to_string(), Script::Error(message.to_string()));
        self
    }

    /// Never return for this role
    pub fn hang(self, role: &str) -> Self {
        self.scripts.lock().insert(role.to_string(), Script::Hang);
        self
    }

    /// Contexts of every call so far
    pub fn contexts(&self) -> Vec<ExecutorContext> {
        self.contexts.lock().clone()
    }
}

#[async_trait]
impl TestExecutor for ScriptedExecutor {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn execute(&self, context: &ExecutorContext) -> RigResult<ExecutorReport> {
        self.contexts.lock().push(context.clone());
        let script = self.scripts.lock().get(&context.role).cloned();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match script {
            None => Ok(ExecutorReport::pass(format!("{} passed", context.role))),
            Some(Script::Report(report)) => Ok(report),
            Some(Script::Error(message)) => Err(RigError::infra(message)),
            Some(Script::Hang) => std::future::pending().await,
        }
    }
}
