//! Boot mode sequencing
//!
//! Driving a DUT into its bootloader is a fixed dance: cut power, hold the
//! boot button, restore power, wait for the bootloader to enumerate, let go
//! of the button. Every step is bounded and every failure leaves the DUT
//! unpowered.

use crate::config::TimingConfig;
use crate::poll::Poller;
use crate::power::{PowerController, PowerScope};
use crate::rail::Rail;
use crate::tentacle::{BootState, TentacleLease, TentacleState};
use crate::topology::{TopologyResolver, UsbDevice, UsbEnumerator};
use crate::types::{DeviceClass, TentacleId};
use crate::{RigError, RigResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::MutexGuard;
use tokio::time::sleep;
use tracing::{error, info, instrument};

/// Runs boot sequences against leased tentacles
pub struct BootModeSequencer {
    power: Arc<PowerController>,
    enumerator: Arc<dyn UsbEnumerator>,
    resolver: TopologyResolver,
    timing: TimingConfig,
}

impl BootModeSequencer {
    pub fn new(
        power: Arc<PowerController>,
        enumerator: Arc<dyn UsbEnumerator>,
        timing: TimingConfig,
    ) -> Self {
        Self {
            power,
            enumerator,
            resolver: TopologyResolver::default(),
            timing,
        }
    }

    pub fn resolver(mut self, resolver: TopologyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn timing(&self) -> &TimingConfig {
        &self.timing
    }

    /// Start sequencing a leased tentacle.
    ///
    /// At most one session per tentacle exists at a time; a second caller
    /// gets `Busy` instead of waiting.
    pub fn begin<'a>(&'a self, lease: &'a TentacleLease) -> RigResult<BootSession<'a>> {
        let scope = lease.power_scope()?;
        let state = lease
            .handle()
            .session
            .try_lock()
            .map_err(|_| RigError::busy(lease.id()))?;
        Ok(BootSession {
            sequencer: self,
            lease,
            scope,
            state,
        })
    }

    /// Device currently at the DUT position of `id`, if any
    async fn dut_device(&self, id: &TentacleId) -> RigResult<Option<UsbDevice>> {
        let snapshot = self.enumerator.scan().await?;
        let topology = self.resolver.resolve(&snapshot)?;
        Ok(topology.get(id).and_then(|port| port.dut.clone()))
    }

    async fn wait_for_dut(
        &self,
        id: &TentacleId,
        what: &str,
        timeout: Duration,
        accept: fn(&UsbDevice) -> bool,
    ) -> RigResult<UsbDevice> {
        Poller::new(self.timing.poll_interval(), timeout)
            .until(what, || async move {
                let device = self.dut_device(id).await?;
                Ok::<_, RigError>(device.filter(|device| accept(device)))
            })
            .await
    }
}

fn is_bootloader(device: &UsbDevice) -> bool {
    device.class.is_bootloader()
}

fn is_application(device: &UsbDevice) -> bool {
    !device.class.is_bootloader()
}

/// Exclusive sequencing access to one tentacle, held for one boot sequence
pub struct BootSession<'a> {
    sequencer: &'a BootModeSequencer,
    lease: &'a TentacleLease,
    scope: PowerScope,
    state: MutexGuard<'a, TentacleState>,
}

impl<'a> BootSession<'a> {
    pub fn id(&self) -> &TentacleId {
        self.lease.id()
    }

    pub fn lease(&self) -> &TentacleLease {
        self.lease
    }

    pub fn boot_state(&self) -> BootState {
        self.state.boot_state
    }

    /// Bootloader device found by the last `enter_bootloader`
    pub fn bootloader_device(&self) -> Option<&UsbDevice> {
        self.state.bootloader.as_ref()
    }

    fn boot_rail(&self) -> Rail {
        self.lease
            .capabilities()
            .known()
            .map(|caps| caps.boot_rail)
            .unwrap_or(Rail::DUT_BOOT)
    }

    /// Drive the DUT into its bootloader.
    ///
    /// Ends in `BootloaderMassStorage` or `BootloaderProgramming`. On any
    /// failure the DUT is powered off, the state becomes `FlashFailed` and
    /// the error is returned.
    #[instrument(skip(self), fields(tentacle = %self.id()))]
    pub async fn enter_bootloader(&mut self) -> RigResult<BootState> {
        if let Err(err) = self.force_power_off().await {
            return Err(self.fail(err).await);
        }

        let boot_rail = self.boot_rail();
        if let Err(err) = self.set(&[(boot_rail, true)]).await {
            return Err(self.fail(err).await);
        }
        self.advance(BootState::EnteringBootloader)?;
        if let Err(err) = self.set(&[(Rail::Dut, true)]).await {
            return Err(self.fail(err).await);
        }

        let timeout = self.sequencer.timing.bootloader_timeout();
        let detected = self
            .sequencer
            .wait_for_dut(self.lease.id(), "DUT bootloader", timeout, is_bootloader)
            .await;
        let released = self.set(&[(boot_rail, false)]).await;

        let device = match (detected, released) {
            (Ok(device), Ok(())) => device,
            (Err(err), _) | (Ok(_), Err(err)) => return Err(self.fail(err).await),
        };

        let next = match device.class {
            DeviceClass::MassStorage => BootState::BootloaderMassStorage,
            _ => BootState::BootloaderProgramming,
        };
        self.advance(next)?;
        info!(port = %device.port, state = ?next, "DUT in bootloader");
        self.state.bootloader = Some(device);
        Ok(next)
    }

    /// Power the DUT up without the boot button and wait for its application.
    #[instrument(skip(self), fields(tentacle = %self.id()))]
    pub async fn exit_bootloader(&mut self) -> RigResult<UsbDevice> {
        if let Err(err) = self.force_power_off().await {
            return Err(self.fail(err).await);
        }
        if let Err(err) = self.set(&[(Rail::Dut, true)]).await {
            return Err(self.fail(err).await);
        }

        let timeout = self.sequencer.timing.reenumeration_timeout();
        match self
            .sequencer
            .wait_for_dut(self.lease.id(), "DUT application", timeout, is_application)
            .await
        {
            Ok(device) => {
                self.advance(BootState::NormalRun)?;
                info!(port = %device.port, "DUT running");
                Ok(device)
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Cut DUT power, release every button and settle. Always allowed.
    ///
    /// If the relays cannot be driven the boot state is left unchanged.
    pub async fn force_power_off(&mut self) -> RigResult<()> {
        self.sequencer.power.apply_idle(&self.scope).await?;
        sleep(self.sequencer.timing.settle()).await;
        self.state.bootloader = None;
        self.advance(BootState::PoweredOff)
    }

    /// Enter `FlashInProgress` from a bootloader state
    pub(crate) fn begin_flash(&mut self) -> RigResult<()> {
        self.advance(BootState::FlashInProgress)
    }

    /// Wait for the application after a flash; ends in `NormalRun`
    pub(crate) async fn await_application(&mut self, timeout: Duration) -> RigResult<UsbDevice> {
        let device = self
            .sequencer
            .wait_for_dut(self.lease.id(), "DUT application after flash", timeout, is_application)
            .await?;
        self.advance(BootState::NormalRun)?;
        self.state.bootloader = None;
        Ok(device)
    }

    /// Whatever sits at the DUT position right now
    pub(crate) async fn current_dut(&self) -> RigResult<Option<UsbDevice>> {
        self.sequencer.dut_device(self.lease.id()).await
    }

    /// Fault the sequence: mark `FlashFailed`, power the DUT off, hand back `err`
    pub(crate) async fn fail(&mut self, err: RigError) -> RigError {
        self.lease.handle().fault(&mut self.state);
        if let Err(power_err) = self.sequencer.power.apply_idle(&self.scope).await {
            error!(tentacle = %self.id(), %power_err, "could not power DUT off after fault");
        }
        err
    }

    async fn set(&self, changes: &[(Rail, bool)]) -> RigResult<()> {
        self.sequencer.power.apply(&self.scope, changes).await
    }

    fn advance(&mut self, next: BootState) -> RigResult<()> {
        self.lease.handle().advance(&mut self.state, next)
    }
}
