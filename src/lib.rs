// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v2.0
// Date Modified: 2027-08-29
// Author: Lukas Bower

//! Computer core: time-sliced execution of sandboxed script computers and
//! the governor for their outbound network access.

/// Error taxonomy shared by every module.
pub mod error;

/// TOML configuration and defaults.
pub mod config;

/// Per-owner resource counters.
pub mod quota;

/// Computers, their events, filesystems and registries.
pub mod computer;

/// Worker pool, run queue and watchdog.
pub mod scheduler;

/// Address policy and the network gateway.
pub mod net;

/// Counters exposed for diagnostics.
pub mod metrics;

/// Facade wiring everything together for the embedding host.
pub mod host;

pub use computer::{Computer, ComputerId, ComputerState, Event, FaultKind};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, DenyReason};
pub use host::{ComputerHost, TickReport};
