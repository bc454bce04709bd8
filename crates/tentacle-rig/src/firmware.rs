//! Firmware flashing
//!
//! A DUT sitting in its bootloader takes firmware one of two ways: copying
//! the artifact onto the volume a mass storage bootloader exposes, or
//! running a programming tool against the bootloader's bus address. Either
//! way the flash only counts once the DUT re-enumerates running its
//! application.

use crate::bootmode::BootSession;
use crate::config::{ProgrammerSpec, RigConfig};
use crate::error::FlashCause;
use crate::process::{self, CommandOutput, CommandSpec};
use crate::tentacle::BootState;
use crate::topology::UsbDevice;
use crate::types::{BusAddress, TentacleId};
use crate::{RigError, RigResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// A firmware image and what it was built for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareArtifact {
    pub path: PathBuf,
    /// MCU family, e.g. `rp2`
    pub target_mcu: String,
    /// Lowercase hex SHA-256 of the file
    pub checksum: String,
}

impl FirmwareArtifact {
    pub fn new(path: impl Into<PathBuf>, target_mcu: impl Into<String>, checksum: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target_mcu: target_mcu.into(),
            checksum: checksum.into().to_ascii_lowercase(),
        }
    }

    /// Describe an artifact on disk, recording its current checksum
    pub async fn from_file(path: impl Into<PathBuf>, target_mcu: impl Into<String>) -> RigResult<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await?;
        Ok(Self {
            checksum: sha256_hex(&bytes),
            path,
            target_mcu: target_mcu.into(),
        })
    }

    /// Check the file still matches the recorded checksum
    pub async fn verify(&self) -> Result<(), FlashCause> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| FlashCause::Artifact(format!("{}: {e}", self.path.display())))?;
        let actual = sha256_hex(&bytes);
        if actual != self.checksum {
            return Err(FlashCause::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// How the caller wants the flash done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashMode {
    /// Whatever the bootloader that showed up supports
    #[default]
    Auto,
    MassStorageCopy,
    ProgrammingTool,
}

/// How the flash was actually done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FlashStrategy {
    MassStorageCopy,
    ProgrammingTool { programmer: String },
}

/// Result of a successful flash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashOutcome {
    pub tentacle: TentacleId,
    pub strategy: FlashStrategy,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<CommandOutput>,
    /// DUT running the new application
    pub device: UsbDevice,
}

/// One programming tool invocation
#[derive(Debug, Clone)]
pub struct ProgramRequest<'a> {
    pub programmer: &'a str,
    pub artifact: &'a Path,
    pub address: Option<BusAddress>,
    pub serial: Option<&'a str>,
}

/// Runs a programming tool against a bootloader
#[async_trait]
pub trait FlashTool: Send + Sync {
    /// Program the artifact. Unsuccessful exits are `FlashCause::ToolExit`.
    async fn program(&self, request: &ProgramRequest<'_>) -> Result<CommandOutput, FlashCause>;
}

/// Writes artifacts onto a mass storage bootloader volume
#[async_trait]
pub trait MassStorageWriter: Send + Sync {
    /// Copy the artifact and flush it to the device; returns the written path
    async fn write(&self, device: &UsbDevice, artifact: &FirmwareArtifact) -> Result<PathBuf, FlashCause>;
}

/// Flash tool driven by configured command templates
pub struct CommandFlashTool {
    programmers: BTreeMap<String, ProgrammerSpec>,
    default_timeout: Duration,
}

impl CommandFlashTool {
    pub fn new(programmers: BTreeMap<String, ProgrammerSpec>, default_timeout: Duration) -> Self {
        Self {
            programmers,
            default_timeout,
        }
    }

    pub fn from_config(config: &RigConfig) -> Self {
        Self::new(config.programmers.clone(), config.timing.tool_timeout())
    }

    /// Expand the template for one request
    pub fn command(&self, request: &ProgramRequest<'_>) -> Result<(CommandSpec, Vec<i32>), FlashCause> {
        let spec = self
            .programmers
            .get(request.programmer)
            .ok_or_else(|| FlashCause::ToolUnavailable {
                programmer: request.programmer.to_string(),
                message: "not configured".to_string(),
            })?;

        let mut args = Vec::with_capacity(spec.args.len());
        for template in &spec.args {
            let needs_address = template.contains("{bus}") || template.contains("{address}");
            let address = match (needs_address, request.address) {
                (true, None) => {
                    return Err(FlashCause::Device("bootloader has no bus address".to_string()));
                }
                (_, address) => address,
            };
            let mut arg = template.replace("{file}", &request.artifact.display().to_string());
            if let Some(address) = address {
                arg = arg
                    .replace("{bus}", &address.bus.to_string())
                    .replace("{address}", &address.device.to_string());
            }
            arg = arg.replace("{serial}", request.serial.unwrap_or_default());
            args.push(arg);
        }

        let timeout = spec
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let command = CommandSpec::new(&spec.program, timeout).args(args);
        Ok((command, spec.success_codes.clone()))
    }
}

#[async_trait]
impl FlashTool for CommandFlashTool {
    async fn program(&self, request: &ProgramRequest<'_>) -> Result<CommandOutput, FlashCause> {
        let (command, success_codes) = self.command(request)?;
        let output = match process::run(&command).await {
            Ok(output) => output,
            Err(RigError::HardwareTimeout { what, timeout }) => {
                return Err(FlashCause::Timeout { what, timeout });
            }
            Err(err) => {
                return Err(FlashCause::ToolUnavailable {
                    programmer: request.programmer.to_string(),
                    message: err.to_string(),
                });
            }
        };
        if !output.succeeded_with(&success_codes) {
            return Err(FlashCause::ToolExit {
                programmer: request.programmer.to_string(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// Copies onto the volume the host has mounted for the bootloader.
///
/// With an unmount command set, the mount point is appended to it and it
/// runs once the copy is synced. The bootloader usually reboots and drops
/// the volume first, so a failed unmount is only logged.
#[derive(Debug, Default, Clone)]
pub struct MountedVolumeWriter {
    unmount: Option<CommandSpec>,
}

impl MountedVolumeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unmount_with(mut self, command: CommandSpec) -> Self {
        self.unmount = Some(command);
        self
    }

    async fn unmount(&self, mount: &Path) {
        let Some(command) = &self.unmount else {
            return;
        };
        let command = command.clone().arg(mount.display().to_string());
        match process::run(&command).await {
            Ok(output) if output.success() => debug!(mount = %mount.display(), "volume unmounted"),
            Ok(output) => debug!(
                mount = %mount.display(),
                exit_code = ?output.exit_code,
                "unmount failed, volume likely gone already"
            ),
            Err(err) => debug!(mount = %mount.display(), %err, "unmount did not run"),
        }
    }
}

#[async_trait]
impl MassStorageWriter for MountedVolumeWriter {
    async fn write(&self, device: &UsbDevice, artifact: &FirmwareArtifact) -> Result<PathBuf, FlashCause> {
        let mount = device
            .mount_point
            .as_ref()
            .ok_or_else(|| FlashCause::Device(format!("no mounted volume for {}", device.port)))?;
        let name = artifact
            .path
            .file_name()
            .ok_or_else(|| FlashCause::Artifact(format!("{} has no file name", artifact.path.display())))?;
        let target = mount.join(name);

        tokio::fs::copy(&artifact.path, &target)
            .await
            .map_err(|e| FlashCause::Copy(format!("{} -> {}: {e}", artifact.path.display(), target.display())))?;

        // The bootloader may reboot as soon as the last block lands
        match tokio::fs::OpenOptions::new().write(true).open(&target).await {
            Ok(file) => {
                if let Err(err) = file.sync_all().await {
                    debug!(target = %target.display(), %err, "sync after copy failed");
                }
            }
            Err(err) => debug!(target = %target.display(), %err, "volume gone after copy"),
        }
        self.unmount(mount).await;
        Ok(target)
    }
}

/// Writes firmware to DUTs held in a bootloader
pub struct FirmwareFlasher {
    tool: Arc<dyn FlashTool>,
    storage: Arc<dyn MassStorageWriter>,
    tool_timeout: Duration,
    reenumeration_timeout: Duration,
}

impl FirmwareFlasher {
    pub fn new(
        tool: Arc<dyn FlashTool>,
        storage: Arc<dyn MassStorageWriter>,
        tool_timeout: Duration,
        reenumeration_timeout: Duration,
    ) -> Self {
        Self {
            tool,
            storage,
            tool_timeout,
            reenumeration_timeout,
        }
    }

    pub fn from_config(config: &RigConfig) -> Self {
        Self::new(
            Arc::new(CommandFlashTool::from_config(config)),
            Arc::new(
                MountedVolumeWriter::new().unmount_with(CommandSpec::new("umount", config.timing.tool_timeout())),
            ),
            config.timing.tool_timeout(),
            config.timing.reenumeration_timeout(),
        )
    }

    /// Flash a DUT that `session` holds in a bootloader.
    ///
    /// Anything but a bootloader state is `InvalidState` and touches no
    /// hardware. Once flashing starts, any failure leaves the DUT powered
    /// off in `FlashFailed`. There is no retry here.
    #[instrument(skip_all, fields(tentacle = %session.id(), artifact = %artifact.path.display()))]
    pub async fn flash(
        &self,
        session: &mut BootSession<'_>,
        artifact: &FirmwareArtifact,
        mode: FlashMode,
    ) -> RigResult<FlashOutcome> {
        let id = session.id().clone();
        let state = session.boot_state();
        if !state.is_bootloader() {
            return Err(RigError::invalid_state(
                &id,
                format!("flashing needs a bootloader state, tentacle is {state:?}"),
            ));
        }
        let device = session
            .bootloader_device()
            .cloned()
            .ok_or_else(|| RigError::invalid_state(&id, "no bootloader device recorded"))?;
        let caps = session.lease().capabilities().known().cloned();
        let strategy = match (mode, state) {
            (FlashMode::MassStorageCopy, BootState::BootloaderProgramming) => {
                return Err(RigError::invalid_state(
                    &id,
                    "bootloader exposes no volume for a mass storage copy",
                ));
            }
            (FlashMode::MassStorageCopy, _) | (FlashMode::Auto, BootState::BootloaderMassStorage) => {
                FlashStrategy::MassStorageCopy
            }
            _ => {
                let programmer = caps
                    .as_ref()
                    .and_then(|c| c.programmer.clone())
                    .ok_or_else(|| RigError::config(format!("no programmer declared for {id}")))?;
                FlashStrategy::ProgrammingTool { programmer }
            }
        };

        session.begin_flash()?;
        let started = Instant::now();

        let written = self
            .write(&device, artifact, &strategy, caps.as_ref().and_then(|c| c.mcu.as_deref()))
            .await;
        let tool_output = match written {
            Ok(output) => output,
            Err(cause) => return Err(session.fail(RigError::flash(&id, cause)).await),
        };

        let app = match session.await_application(self.reenumeration_timeout).await {
            Ok(app) => app,
            Err(RigError::HardwareTimeout { what, timeout }) => {
                let cause = match session.current_dut().await {
                    Ok(Some(found)) if found.class.is_bootloader() => FlashCause::ReEnumeration {
                        found: format!("{:?} at {}", found.class, found.port),
                    },
                    _ => FlashCause::Timeout { what, timeout },
                };
                return Err(session.fail(RigError::flash(&id, cause)).await);
            }
            Err(err) => return Err(session.fail(err).await),
        };

        let outcome = FlashOutcome {
            tentacle: id,
            strategy,
            duration_ms: started.elapsed().as_millis() as u64,
            tool_output,
            device: app,
        };
        info!(strategy = ?outcome.strategy, duration_ms = outcome.duration_ms, "flashed");
        Ok(outcome)
    }

    async fn write(
        &self,
        device: &UsbDevice,
        artifact: &FirmwareArtifact,
        strategy: &FlashStrategy,
        tentacle_mcu: Option<&str>,
    ) -> Result<Option<CommandOutput>, FlashCause> {
        if let Some(mcu) = tentacle_mcu {
            if !mcu.eq_ignore_ascii_case(&artifact.target_mcu) {
                return Err(FlashCause::McuMismatch {
                    artifact: artifact.target_mcu.clone(),
                    tentacle: mcu.to_string(),
                });
            }
        }
        artifact.verify().await?;

        match strategy {
            FlashStrategy::MassStorageCopy => {
                let written = tokio::time::timeout(self.tool_timeout, self.storage.write(device, artifact))
                    .await
                    .map_err(|_| FlashCause::Timeout {
                        what: "copy to bootloader volume".to_string(),
                        timeout: self.tool_timeout,
                    })??;
                debug!(target = %written.display(), "artifact copied");
                Ok(None)
            }
            FlashStrategy::ProgrammingTool { programmer } => {
                let request = ProgramRequest {
                    programmer,
                    artifact: &artifact.path,
                    address: device.address,
                    serial: device.serial.as_deref(),
                };
                self.tool.program(&request).await.map(Some)
            }
        }
    }
}
