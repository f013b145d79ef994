//! Side-effecting adapters for the exploration engine.

pub mod config;
pub mod device;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod vision;
