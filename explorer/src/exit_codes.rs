//! Stable exit codes for explorer CLI commands.

/// Command succeeded (session completed or exhausted its candidates).
pub const OK: i32 = 0;
/// Command failed due to invalid config, settings, or other errors.
pub const INVALID: i32 = 1;
/// The session left the target application and could not recover.
pub const SCOPE_LOST: i32 = 2;
/// The session was stopped before it finished (e.g. session timeout).
pub const STOPPED: i32 = 3;
