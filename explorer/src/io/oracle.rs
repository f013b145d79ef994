//! External decision oracle: the request shape and a command-backed adapter.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::types::Bounds;
use crate::io::config::OracleConfig;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// Everything the oracle is told about one candidate element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElementContext {
    pub index: usize,
    pub fingerprint: String,
    pub class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_desc: Option<String>,
    pub bounds: Bounds,
    /// Padded crop of the element, base64-encoded PNG.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop_png_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
}

/// A ranking request: rendered prompt plus structured per-candidate context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleRequest {
    pub prompt: String,
    pub elements: Vec<ElementContext>,
}

pub trait Oracle {
    /// Return the oracle's raw answer. Parsing is the caller's concern.
    fn rank(&self, request: &OracleRequest) -> Result<String>;
}

/// Oracle backed by a configured command reading the JSON request on stdin.
pub struct CommandOracle {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandOracle {
    pub fn new(config: &OracleConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
        }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(candidates = request.elements.len()))]
    fn rank(&self, request: &OracleRequest) -> Result<String> {
        let payload = serde_json::to_vec(request).context("serialize oracle request")?;
        let cmd = command_from_argv(&self.command).context("oracle.command")?;
        let output =
            run_command_with_timeout(cmd, Some(&payload), self.timeout, self.output_limit_bytes)
                .context("run oracle command")?
                .into_success("oracle command", self.timeout)?;
        debug!(bytes = output.stdout.len(), "oracle answered");
        Ok(output.stdout_text())
    }
}
