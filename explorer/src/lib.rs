//! Budgeted, cycle-aware exploration of a running mobile application's screens.
//!
//! The explorer taps through an application it cannot enumerate in advance,
//! records each distinct screen once, and decides which element to try next.
//! The architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (fingerprints, cycle detection,
//!   goal progress, candidate ordering, hierarchy parsing). No I/O.
//! - **[`io`]**: Side-effecting adapters (device driver, decision oracle,
//!   element vision, configuration, child processes). Isolated behind traits
//!   so tests can script them.
//!
//! Orchestration modules ([`explore`], [`session`], [`oracle_client`]) tie the
//! core logic to the adapters.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod explore;
pub mod io;
pub mod logging;
pub mod oracle_client;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
