//! Element crops and OCR for oracle requests.
//!
//! Image processing stays outside the process: crops and OCR are delegated to
//! configured commands (e.g. ImageMagick and tesseract). Without configuration
//! the oracle simply gets no visual context.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

use crate::core::types::{Bounds, Screenshot};
use crate::io::config::VisionConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

const CROP_OUTPUT_LIMIT_BYTES: usize = 4_000_000;
const OCR_OUTPUT_LIMIT_BYTES: usize = 16_000;

/// Visual context for one element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementCrop {
    /// PNG of the padded element region.
    pub image: Option<Vec<u8>>,
    pub ocr_text: Option<String>,
}

pub trait ElementVision {
    /// Crop `region` out of `screenshot` and, where supported, read its text.
    fn inspect(&self, screenshot: &Screenshot, region: Bounds) -> Result<ElementCrop>;
}

/// No visual context at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVision;

impl ElementVision for NoVision {
    fn inspect(&self, _screenshot: &Screenshot, _region: Bounds) -> Result<ElementCrop> {
        Ok(ElementCrop::default())
    }
}

/// Crop and OCR through external commands.
pub struct CommandVision {
    crop_command: Vec<String>,
    ocr_command: Vec<String>,
    timeout: Duration,
}

impl CommandVision {
    pub fn new(config: &VisionConfig) -> Self {
        Self {
            crop_command: config.crop_command.clone(),
            ocr_command: config.ocr_command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    fn crop(&self, screenshot: &Screenshot, region: Bounds) -> Result<Vec<u8>> {
        let argv = substitute_region(&self.crop_command, region);
        let cmd = command_from_argv(&argv).context("vision.crop_command")?;
        let output =
            run_command_with_timeout(cmd, Some(&screenshot.png), self.timeout, CROP_OUTPUT_LIMIT_BYTES)
                .context("run crop command")?
                .into_success("crop command", self.timeout)?;
        if output.stdout.is_empty() {
            return Err(anyhow!("crop command produced no image"));
        }
        Ok(output.stdout)
    }

    fn ocr(&self, image: &[u8]) -> Result<Option<String>> {
        if self.ocr_command.is_empty() {
            return Ok(None);
        }
        let cmd = command_from_argv(&self.ocr_command).context("vision.ocr_command")?;
        let output = run_command_with_timeout(cmd, Some(image), self.timeout, OCR_OUTPUT_LIMIT_BYTES)
            .context("run ocr command")?
            .into_success("ocr command", self.timeout)?;
        let text = normalize_ocr(&output.stdout_text());
        Ok((!text.is_empty()).then_some(text))
    }
}

impl ElementVision for CommandVision {
    #[instrument(skip_all, fields(region = %region))]
    fn inspect(&self, screenshot: &Screenshot, region: Bounds) -> Result<ElementCrop> {
        if self.crop_command.is_empty() || screenshot.png.is_empty() || region.is_empty() {
            return Ok(ElementCrop::default());
        }
        let image = self.crop(screenshot, region)?;
        let ocr_text = self.ocr(&image)?;
        debug!(bytes = image.len(), has_text = ocr_text.is_some(), "element cropped");
        Ok(ElementCrop {
            image: Some(image),
            ocr_text,
        })
    }
}

/// Replace `{x}`, `{y}`, `{width}`, `{height}` in every argument.
fn substitute_region(argv: &[String], region: Bounds) -> Vec<String> {
    argv.iter()
        .map(|arg| {
            arg.replace("{x}", &region.left.to_string())
                .replace("{y}", &region.top.to_string())
                .replace("{width}", &region.width().to_string())
                .replace("{height}", &region.height().to_string())
        })
        .collect()
}

/// Collapse whitespace runs; OCR output is full of stray line breaks.
fn normalize_ocr(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screenshot() -> Screenshot {
        Screenshot {
            png: b"fake-png".to_vec(),
            width: 100,
            height: 100,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn substitutes_region_placeholders() {
        let got = substitute_region(
            &argv(&["magick", "png:-", "-crop", "{width}x{height}+{x}+{y}", "png:-"]),
            Bounds::new(10, 20, 110, 70),
        );
        assert_eq!(got[3], "100x50+10+20");
    }

    #[test]
    fn unconfigured_vision_returns_nothing() {
        let vision = CommandVision::new(&VisionConfig::default());
        let crop = vision
            .inspect(&screenshot(), Bounds::new(0, 0, 10, 10))
            .expect("inspect");
        assert_eq!(crop, ElementCrop::default());
    }

    #[test]
    fn command_vision_pipes_crop_into_ocr() {
        let vision = CommandVision::new(&VisionConfig {
            crop_command: argv(&["sh", "-c", "cat; printf ':{x},{y}'"]),
            ocr_command: argv(&["sh", "-c", "printf '  Sign\\n in  '"]),
            ..VisionConfig::default()
        });
        let crop = vision
            .inspect(&screenshot(), Bounds::new(5, 6, 50, 60))
            .expect("inspect");
        assert_eq!(crop.image.as_deref(), Some(&b"fake-png:5,6"[..]));
        assert_eq!(crop.ocr_text.as_deref(), Some("Sign in"));
    }

    #[test]
    fn failing_crop_command_is_an_error() {
        let vision = CommandVision::new(&VisionConfig {
            crop_command: argv(&["sh", "-c", "exit 1"]),
            ..VisionConfig::default()
        });
        assert!(
            vision
                .inspect(&screenshot(), Bounds::new(0, 0, 10, 10))
                .is_err()
        );
    }
}
