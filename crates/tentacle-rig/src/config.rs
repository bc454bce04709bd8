//! Rig configuration
//!
//! Configuration is a single JSON document, usually `rig.json` next to the
//! test runner. Every section is optional; omitted fields take the defaults
//! below.
//!
//! ```json
//! {
//!   "timing": { "bootloaderTimeoutMs": 3000 },
//!   "tentacles": [
//!     { "serial": "e46340474b4c-1331", "tags": "boards=RPI_PICO,mcu=rp2,programmer=picotool" }
//!   ],
//!   "rails": { "v0.3": { "dut": { "board": "infra", "channel": 6 } } },
//!   "orchestrator": { "flashAttempts": 2 }
//! }
//! ```

use crate::rail::{Rail, RailAddress, RelayAssignment};
use crate::types::{HardwareRevision, TentacleId};
use crate::{RigError, RigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top level rig configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigConfig {
    /// Delays and time bounds
    #[serde(default)]
    pub timing: TimingConfig,

    /// Tentacles known to this rig
    #[serde(default)]
    pub tentacles: Vec<TentacleDecl>,

    /// Rail rewiring per hardware revision, keyed by rail name
    #[serde(default)]
    pub rails: BTreeMap<HardwareRevision, BTreeMap<String, RailAddress>>,

    /// Programming tools by name
    #[serde(default = "default_programmers")]
    pub programmers: BTreeMap<String, ProgrammerSpec>,

    /// Run orchestration settings
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            tentacles: vec![],
            rails: BTreeMap::new(),
            programmers: default_programmers(),
            orchestrator: OrchestratorSettings::default(),
        }
    }
}

impl RigConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> RigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RigError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(content: &str) -> RigResult<Self> {
        let config: RigConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything that can be checked without hardware
    pub fn validate(&self) -> RigResult<()> {
        self.relay_assignment()?;
        self.declarations()?;
        for decl in &self.tentacles {
            if let Some(rail) = &decl.boot_rail {
                rail.parse::<Rail>()?;
            }
        }
        if self.orchestrator.flash_attempts == 0 {
            return Err(RigError::config("orchestrator.flashAttempts must be at least 1"));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(RigError::config("timing.pollIntervalMs must be positive"));
        }
        Ok(())
    }

    /// Standard wiring with the configured overrides applied
    pub fn relay_assignment(&self) -> RigResult<RelayAssignment> {
        let mut assignment = RelayAssignment::standard();
        for (revision, overrides) in &self.rails {
            for (name, address) in overrides {
                let rail: Rail = name.parse()?;
                assignment = assignment.with_override(*revision, rail, address.clone());
            }
        }
        Ok(assignment)
    }

    /// Tentacle declarations by serial; a serial may be declared once
    pub fn declarations(&self) -> RigResult<BTreeMap<TentacleId, TentacleDecl>> {
        let mut decls: BTreeMap<TentacleId, (usize, TentacleDecl)> = BTreeMap::new();
        for (index, decl) in self.tentacles.iter().enumerate() {
            let id = TentacleId::new(&decl.serial)?;
            if let Some((first, _)) = decls.get(&id) {
                return Err(RigError::DuplicateSerial {
                    serial: id.to_string(),
                    first: format!("tentacles[{first}]"),
                    second: format!("tentacles[{index}]"),
                });
            }
            decls.insert(id, (index, decl.clone()));
        }
        Ok(decls.into_iter().map(|(id, (_, decl))| (id, decl)).collect())
    }
}

/// Delays and time bounds, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    /// Wait after cutting DUT power before anything else
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Interval between USB scans while waiting for a device
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on waiting for the DUT bootloader to enumerate
    #[serde(default = "default_bootloader_timeout_ms")]
    pub bootloader_timeout_ms: u64,

    /// Bound on waiting for the DUT to come back after flashing or a normal boot
    #[serde(default = "default_reenumeration_timeout_ms")]
    pub reenumeration_timeout_ms: u64,

    /// Bound on a programming tool run
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            bootloader_timeout_ms: default_bootloader_timeout_ms(),
            reenumeration_timeout_ms: default_reenumeration_timeout_ms(),
            tool_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

impl TimingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn bootloader_timeout(&self) -> Duration {
        Duration::from_millis(self.bootloader_timeout_ms)
    }

    pub fn reenumeration_timeout(&self) -> Duration {
        Duration::from_millis(self.reenumeration_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }
}

/// One tentacle as declared by the rig operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TentacleDecl {
    /// Infra controller serial, compact or delimited
    pub serial: String,

    /// `key=value` pairs, e.g. `boards=RPI_PICO,mcu=rp2,programmer=picotool`
    #[serde(default)]
    pub tags: String,

    /// Extra hardware wired to the DUT
    #[serde(default)]
    pub gadgets: Vec<String>,

    /// Rail wired to the DUT boot button, `relay1` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_rail: Option<String>,

    /// Free text shown in listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TentacleDecl {
    pub fn new(serial: impl Into<String>, tags: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            tags: tags.into(),
            gadgets: vec![],
            boot_rail: None,
            label: None,
        }
    }

    pub fn gadget(mut self, gadget: impl Into<String>) -> Self {
        self.gadgets.push(gadget.into());
        self
    }

    pub fn boot_rail(mut self, rail: impl Into<String>) -> Self {
        self.boot_rail = Some(rail.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Command template for a programming tool.
///
/// `{file}`, `{bus}`, `{address}` and `{serial}` in `args` are replaced
/// per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgrammerSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Exit codes treated as success
    #[serde(default = "default_success_codes")]
    pub success_codes: Vec<i32>,

    /// Overrides `timing.toolTimeoutMs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ProgrammerSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            success_codes: default_success_codes(),
            timeout_ms: None,
        }
    }
}

/// Run orchestration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSettings {
    /// Flash attempts per role, counting the first
    #[serde(default = "default_flash_attempts")]
    pub flash_attempts: u32,

    /// Bound on a whole run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,

    /// Bound on one executor invocation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_timeout_ms: Option<u64>,

    /// Rescan USB before allocating roles
    #[serde(default = "default_true")]
    pub refresh_before_allocation: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            flash_attempts: default_flash_attempts(),
            run_timeout_ms: None,
            executor_timeout_ms: None,
            refresh_before_allocation: true,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_settle_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_bootloader_timeout_ms() -> u64 {
    3_000
}

fn default_reenumeration_timeout_ms() -> u64 {
    5_000
}

fn default_tool_timeout_ms() -> u64 {
    60_000
}

fn default_flash_attempts() -> u32 {
    2
}

fn default_success_codes() -> Vec<i32> {
    vec![0]
}

fn default_programmers() -> BTreeMap<String, ProgrammerSpec> {
    let mut programmers = BTreeMap::new();
    programmers.insert(
        "picotool".to_string(),
        ProgrammerSpec::new(
            "picotool",
            &["load", "--update", "--execute", "{file}", "--bus", "{bus}", "--address", "{address}"],
        ),
    );
    programmers.insert(
        "dfu-util".to_string(),
        ProgrammerSpec::new("dfu-util", &["--serial", "{serial}", "--download", "{file}"]),
    );
    programmers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rail::BoardRef;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_default() {
        let config = RigConfig::default();
        assert_eq!(config.timing.settle(), Duration::from_millis(500));
        assert_eq!(config.timing.bootloader_timeout(), Duration::from_secs(3));
        assert_eq!(config.orchestrator.flash_attempts, 2);
        assert!(config.programmers.contains_key("picotool"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_takes_defaults() {
        let config = RigConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RigConfig::default());
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "timing": { "bootloaderTimeoutMs": 2000 },
            "tentacles": [
                { "serial": "e46340474b4c-1331", "tags": "boards=RPI_PICO,mcu=rp2,programmer=picotool", "gadgets": ["i2c-eeprom"] }
            ],
            "rails": { "v0.3": { "dut": { "board": "infra", "channel": 6, "activeLow": true } } },
            "orchestrator": { "flashAttempts": 3, "runTimeoutMs": 60000 }
        }"#;
        let config = RigConfig::from_json_str(json).unwrap();
        assert_eq!(config.timing.bootloader_timeout_ms, 2000);
        assert_eq!(config.timing.settle_ms, 500);
        assert_eq!(config.orchestrator.flash_attempts, 3);

        let decls = config.declarations().unwrap();
        let id = TentacleId::new("e46340474b4c1331").unwrap();
        assert_eq!(decls[&id].gadgets, vec!["i2c-eeprom".to_string()]);

        let assignment = config.relay_assignment().unwrap();
        let dut = assignment.address(HardwareRevision::V03, Rail::Dut).unwrap();
        assert_eq!(dut.board, BoardRef::Infra);
        assert!(dut.active_low);
    }

    #[test]
    fn test_unknown_rail_rejected_at_load() {
        let json = r#"{ "rails": { "v0.4": { "relay9": { "board": "infra", "channel": 9 } } } }"#;
        let err = RigConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, RigError::UnknownRail(_)));
    }

    #[test]
    fn test_duplicate_declaration_rejected() {
        let mut config = RigConfig::default();
        config.tentacles.push(TentacleDecl::new("e46340474b4c1331", "mcu=rp2"));
        config.tentacles.push(TentacleDecl::new("e46340474b4c-1331", "mcu=rp2"));
        assert!(matches!(
            config.validate(),
            Err(RigError::DuplicateSerial { first, second, .. })
                if first == "tentacles[0]" && second == "tentacles[1]"
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.json");
        std::fs::write(&path, r#"{ "orchestrator": { "flashAttempts": 1 } }"#).unwrap();
        let config = RigConfig::load(&path).unwrap();
        assert_eq!(config.orchestrator.flash_attempts, 1);

        assert!(RigConfig::load(dir.path().join("missing.json")).is_err());
    }
}
