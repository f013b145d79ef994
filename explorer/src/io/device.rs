//! Device driver abstraction.
//!
//! The [`DeviceDriver`] trait decouples the exploration engine from the actual
//! automation backend (currently `adb`). Each call blocks until the device has
//! completed the action or the adapter's own timeout fires; the engine never
//! issues two calls concurrently. Tests use scripted drivers that simulate an
//! application without a device.

use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::core::types::Screenshot;
use crate::io::config::DeviceConfig;
use crate::io::process::{CommandOutput, run_command_with_timeout};

const HIERARCHY_DUMP_PATH: &str = "/sdcard/window_dump.xml";
const KEYCODE_BACK: &str = "4";

static RESUMED_ACTIVITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)(?:topResumedActivity|mResumedActivity|ResumedActivity)[=:].*?\s([A-Za-z0-9_.]+/[A-Za-z0-9_.$]+)")
        .unwrap()
});

/// Capabilities the exploration engine needs from a device.
pub trait DeviceDriver {
    /// Foreground activity as `package/ActivityClass`.
    fn current_activity(&self) -> Result<String>;
    /// View hierarchy as a uiautomator XML document.
    fn capture_hierarchy(&self) -> Result<String>;
    fn capture_screenshot(&self) -> Result<Screenshot>;
    fn tap(&self, x: i32, y: i32) -> Result<()>;
    fn navigate_back(&self) -> Result<()>;
    fn launch_app(&self, app_id: &str) -> Result<()>;
}

/// Driver that shells out to `adb`.
pub struct AdbDriver {
    adb: String,
    serial: Option<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl AdbDriver {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            adb: config.adb.clone(),
            serial: config.serial.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn run(&self, label: &str, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(args);
        run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run adb {label}"))?
            .into_success(&format!("adb {label}"), self.timeout)
    }
}

impl DeviceDriver for AdbDriver {
    #[instrument(skip_all)]
    fn current_activity(&self) -> Result<String> {
        let output = self.run("dumpsys", &["shell", "dumpsys", "activity", "activities"])?;
        let activity = parse_resumed_activity(&output.stdout_text())
            .ok_or_else(|| anyhow!("no resumed activity in dumpsys output"))?;
        debug!(%activity, "current activity");
        Ok(activity)
    }

    #[instrument(skip_all)]
    fn capture_hierarchy(&self) -> Result<String> {
        self.run(
            "uiautomator dump",
            &["shell", "uiautomator", "dump", HIERARCHY_DUMP_PATH],
        )?;
        let output = self.run("read hierarchy", &["exec-out", "cat", HIERARCHY_DUMP_PATH])?;
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "hierarchy dump exceeded {} bytes",
                self.output_limit_bytes
            ));
        }
        Ok(output.stdout_text())
    }

    #[instrument(skip_all)]
    fn capture_screenshot(&self) -> Result<Screenshot> {
        let output = self.run("screencap", &["exec-out", "screencap", "-p"])?;
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "screenshot exceeded {} bytes",
                self.output_limit_bytes
            ));
        }
        let (width, height) =
            png_dimensions(&output.stdout).ok_or_else(|| anyhow!("screencap did not return a PNG"))?;
        Ok(Screenshot {
            png: output.stdout,
            width,
            height,
        })
    }

    #[instrument(skip(self))]
    fn tap(&self, x: i32, y: i32) -> Result<()> {
        let (x, y) = (x.to_string(), y.to_string());
        self.run("tap", &["shell", "input", "tap", &x, &y])?;
        Ok(())
    }

    #[instrument(skip_all)]
    fn navigate_back(&self) -> Result<()> {
        self.run("back", &["shell", "input", "keyevent", KEYCODE_BACK])?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn launch_app(&self, app_id: &str) -> Result<()> {
        info!(app_id, "launching app");
        self.run(
            "launch",
            &[
                "shell",
                "monkey",
                "-p",
                app_id,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
        )?;
        Ok(())
    }
}

/// Extract the resumed `package/Activity` from `dumpsys activity activities`.
pub fn parse_resumed_activity(dumpsys: &str) -> Option<String> {
    RESUMED_ACTIVITY_RE
        .captures(dumpsys)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Width and height from a PNG IHDR chunk.
pub fn png_dimensions(png: &[u8]) -> Option<(u32, u32)> {
    const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
    if png.len() < 24 || !png.starts_with(SIGNATURE) || &png[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(png[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(png[20..24].try_into().ok()?);
    Some((width, height))
}
