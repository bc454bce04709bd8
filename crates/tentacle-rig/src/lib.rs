//! Control plane for a hardware-in-the-loop tentacle rig.
//!
//! A tentacle is a carrier board with a fixed infra controller and a
//! microcontroller under test (the DUT) behind one USB hub. This crate maps
//! the volatile USB tree onto tentacle serials, switches their power rails,
//! walks DUTs into their bootloaders, flashes firmware and runs testbeds
//! across several tentacles at once.
//!
//! Layers, bottom up:
//! - [`topology`] resolves USB snapshots into tentacles
//! - [`power`] switches rails with one lock per relay board
//! - [`bootmode`] sequences a DUT into and out of its bootloader
//! - [`firmware`] flashes a DUT held in its bootloader
//! - [`inventory`] tracks tentacles, capabilities and leases
//! - [`orchestrator`] allocates tentacles to testbed roles and runs them
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tentacle_rig::config::RigConfig;
//! use tentacle_rig::power::{PowerController, RoutedRelayBus, UnavailableRelayBus};
//! use tentacle_rig::sysfs::{SysfsHubBus, SysfsUsbEnumerator};
//! use tentacle_rig::{BootModeSequencer, DeclaredCapabilities, FirmwareFlasher, Inventory};
//!
//! # async fn example() -> tentacle_rig::RigResult<()> {
//! tentacle_rig::telemetry::init_default("tentacle-rig");
//! let config = RigConfig::load("rig.json")?;
//!
//! let usb = Arc::new(SysfsUsbEnumerator::default());
//! let no_driver = Arc::new(UnavailableRelayBus::new("infra relay protocol"));
//! let bus = Arc::new(RoutedRelayBus::new(
//!     Arc::new(SysfsHubBus::default()),
//!     no_driver.clone(),
//!     no_driver,
//! ));
//! let power = Arc::new(PowerController::new(config.relay_assignment()?, bus));
//! let inventory = Inventory::new(
//!     usb.clone(),
//!     power.clone(),
//!     Arc::new(DeclaredCapabilities::from_config(&config)?),
//! );
//! inventory.declare(&config.declarations()?);
//! let report = inventory.refresh().await?;
//! tracing::info!(visible = report.visible.len(), "rig scanned");
//!
//! let _sequencer = BootModeSequencer::new(power, usb, config.timing.clone());
//! let _flasher = FirmwareFlasher::from_config(&config);
//! # Ok(())
//! # }
//! ```

pub mod bootmode;
pub mod config;
pub mod error;
pub mod executor;
pub mod firmware;
pub mod inventory;
pub mod orchestrator;
pub mod poll;
pub mod power;
pub mod process;
pub mod rail;
pub mod sysfs;
pub mod telemetry;
pub mod tentacle;
pub mod testbed;
pub mod topology;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use bootmode::{BootModeSequencer, BootSession};
pub use config::RigConfig;
pub use error::{FlashCause, RigError, RigResult};
pub use executor::{CommandTestExecutor, ExecutorContext, ExecutorReport, TestExecutor};
pub use firmware::{FirmwareArtifact, FirmwareFlasher, FlashMode, FlashOutcome, FlashStrategy};
pub use inventory::{DeclaredCapabilities, Inventory, TentacleFilter};
pub use orchestrator::{OrchestratorConfig, RunEvent, RunOrchestrator, RunOrchestratorBuilder};
pub use power::PowerController;
pub use rail::{Rail, RelayAssignment};
pub use tentacle::{BootState, Capabilities, CapabilitySet, Tentacle, TentacleLease};
pub use testbed::{
    RequiredCapabilities, RoleStatus, RunRequest, RunResult, RunStatus, TestbedDefinition,
    TestbedRoleSpec,
};
pub use topology::{Topology, TopologyResolver, UsbDevice, UsbEnumerator, UsbSnapshot};
pub use types::{HardwareRevision, TentacleId, UsbPortPath};
