//! Explorer configuration stored in `explorer.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{ExplorationMode, activity_package};

pub const DEFAULT_CONFIG_FILE: &str = "explorer.toml";

/// Full explorer configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to sensible values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExplorerConfig {
    pub exploration: ExplorationSettings,
    pub device: DeviceConfig,
    pub oracle: OracleConfig,
    pub vision: VisionConfig,
}

/// Per-session exploration settings. Immutable for the lifetime of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExplorationSettings {
    /// Package of the target application (e.g. `com.example.app`).
    pub app_id: String,

    /// Session ends once this many distinct screens have been discovered.
    pub max_states: usize,

    /// No taps are issued on screens at this depth or deeper (root screen = 0).
    pub max_depth: usize,

    /// Upper bound on taps per element fingerprint across the whole session.
    pub per_element_click_budget: u32,

    /// Wait after every tap, back and relaunch before observing again.
    pub settle_delay_ms: u64,

    /// Relaunch the target app whenever the foreground activity leaves it.
    pub stay_in_scope: bool,

    /// Relaunch-and-recheck rounds before scope loss becomes fatal.
    pub max_recovery_attempts: u32,

    /// Extra packages that count as in scope (e.g. system permission dialogs).
    pub allowed_packages: BTreeSet<String>,

    /// Element classes never tapped (full class names).
    pub ignored_classes: BTreeSet<String>,

    pub mode: ExplorationMode,

    /// Free-text goal, optionally with a `[Title]` and a numbered step list.
    pub goal_prompt: Option<String>,
}

impl Default for ExplorationSettings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            max_states: 50,
            max_depth: 5,
            per_element_click_budget: 2,
            settle_delay_ms: 1_500,
            stay_in_scope: true,
            max_recovery_attempts: 3,
            allowed_packages: BTreeSet::new(),
            ignored_classes: BTreeSet::new(),
            mode: ExplorationMode::Sequential,
            goal_prompt: None,
        }
    }
}

impl ExplorationSettings {
    /// Convenience constructor for a target app with default budgets.
    pub fn for_app(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(anyhow!("exploration.app_id must not be empty"));
        }
        if self.max_states == 0 {
            return Err(anyhow!("exploration.max_states must be > 0"));
        }
        if self.max_depth == 0 {
            return Err(anyhow!("exploration.max_depth must be > 0"));
        }
        if self.per_element_click_budget == 0 {
            return Err(anyhow!("exploration.per_element_click_budget must be > 0"));
        }
        if self.stay_in_scope && self.max_recovery_attempts == 0 {
            return Err(anyhow!(
                "exploration.max_recovery_attempts must be > 0 when stay_in_scope is set"
            ));
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Whether `activity` belongs to the target app or an allowed package.
    pub fn in_scope(&self, activity: &str) -> bool {
        let package = activity_package(activity);
        package == self.app_id || self.allowed_packages.contains(package)
    }

    pub fn is_ignored(&self, class_name: &str) -> bool {
        self.ignored_classes.contains(class_name)
    }

    /// Goal prompt with surrounding whitespace removed, if non-blank.
    pub fn goal(&self) -> Option<&str> {
        self.goal_prompt
            .as_deref()
            .map(str::trim)
            .filter(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path to the `adb` executable.
    pub adb: String,
    /// Device serial passed as `adb -s`; `None` uses the only attached device.
    pub serial: Option<String>,
    pub command_timeout_secs: u64,
    /// Truncate adb stdout/stderr beyond this many bytes (screenshots included).
    pub output_limit_bytes: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            serial: None,
            command_timeout_secs: 30,
            output_limit_bytes: 16_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OracleConfig {
    /// Command that reads the ranking request (JSON) on stdin and answers on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Maximum bytes for the rendered prompt before dropping sections.
    pub prompt_budget_bytes: usize,
    /// History entries rendered into the prompt.
    pub history_lines: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 40_000,
            history_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VisionConfig {
    /// Crop command; receives the screenshot PNG on stdin and must print the crop PNG.
    /// `{x}`, `{y}`, `{width}` and `{height}` are substituted in every argument.
    pub crop_command: Vec<String>,
    /// OCR command; receives the crop PNG on stdin and prints recognized text.
    pub ocr_command: Vec<String>,
    pub timeout_secs: u64,
    /// Padding around each element's bounds when cropping.
    pub padding_px: i32,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            crop_command: Vec::new(),
            ocr_command: Vec::new(),
            timeout_secs: 20,
            padding_px: 20,
        }
    }
}

impl ExplorerConfig {
    pub fn validate(&self) -> Result<()> {
        self.exploration.validate()?;
        if self.device.adb.trim().is_empty() {
            return Err(anyhow!("device.adb must not be empty"));
        }
        if self.device.command_timeout_secs == 0 {
            return Err(anyhow!("device.command_timeout_secs must be > 0"));
        }
        if self.device.output_limit_bytes == 0 {
            return Err(anyhow!("device.output_limit_bytes must be > 0"));
        }
        if self.exploration.mode == ExplorationMode::OracleGuided
            && (self.oracle.command.is_empty() || self.oracle.command[0].trim().is_empty())
        {
            return Err(anyhow!(
                "oracle.command must be a non-empty array when mode = \"oracle_guided\""
            ));
        }
        if self.oracle.timeout_secs == 0 {
            return Err(anyhow!("oracle.timeout_secs must be > 0"));
        }
        if self.oracle.prompt_budget_bytes == 0 {
            return Err(anyhow!("oracle.prompt_budget_bytes must be > 0"));
        }
        if self.vision.padding_px < 0 {
            return Err(anyhow!("vision.padding_px must be >= 0"));
        }
        if !self.vision.ocr_command.is_empty() && self.vision.crop_command.is_empty() {
            return Err(anyhow!("vision.ocr_command requires vision.crop_command"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ExplorerConfig::default()` unvalidated: the
/// defaults have no target app, so callers must supply one before validating.
pub fn load_config(path: &Path) -> Result<ExplorerConfig> {
    if !path.exists() {
        return Ok(ExplorerConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ExplorerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ExplorerConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
