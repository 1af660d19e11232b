// CLASSIFICATION: COMMUNITY
// Filename: error.rs v0.2
// Author: Lukas Bower
// Date Modified: 2027-08-20

//! Error taxonomy shared by the scheduler, quota tracker and network gateway.
//!
//! None of these errors are allowed to escape into the host: quota and address
//! errors are handed back to the owning computer's script as values or events,
//! runtime faults only affect the offending computer.

use thiserror::Error;

use crate::computer::RuntimeFault;
use crate::config::ConfigError;
use crate::net::address::AddressRuleError;
use crate::quota::{QuotaRejection, ResourceKind};

/// Why an address was refused by the network policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The target matched a blacklist rule.
    Blacklisted,
    /// No whitelist rule matched the target.
    NotWhitelisted,
    /// The hostname did not resolve to any address.
    CouldNotResolve,
    /// The port is outside the configured allow list.
    PortNotAllowed(u16),
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::Blacklisted | DenyReason::NotWhitelisted => {
                write!(f, "Domain not permitted")
            }
            DenyReason::CouldNotResolve => write!(f, "Could not resolve host"),
            DenyReason::PortNotAllowed(port) => write!(f, "Port {port} not permitted"),
        }
    }
}

/// Errors produced by core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("quota exceeded: {kind} (limit {limit}, in use {in_use}, requested {requested})")]
    QuotaExceeded {
        kind: ResourceKind,
        limit: u64,
        in_use: u64,
        requested: u64,
    },
    #[error("{0}")]
    AddressDenied(DenyReason),
    #[error("Timed out")]
    Timeout,
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("runtime fault (fatal={fatal}): {message}")]
    RuntimeFault { fatal: bool, message: String },
    #[error("global execution budget exhausted for this tick")]
    SchedulerOverrun,
    #[error("{0} is disabled")]
    Disabled(&'static str),
    #[error("no such computer: {0}")]
    NoSuchComputer(u32),
    #[error("no such handle: {0}")]
    NoSuchHandle(u64),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid address rule: {0}")]
    InvalidRule(#[from] AddressRuleError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// The resource kind behind a quota error, if any.
    pub fn quota_kind(&self) -> Option<ResourceKind> {
        match self {
            CoreError::QuotaExceeded { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<QuotaRejection> for CoreError {
    fn from(r: QuotaRejection) -> Self {
        CoreError::QuotaExceeded {
            kind: r.kind,
            limit: r.limit,
            in_use: r.in_use,
            requested: r.requested,
        }
    }
}

impl From<RuntimeFault> for CoreError {
    fn from(f: RuntimeFault) -> Self {
        CoreError::RuntimeFault {
            fatal: f.fatal,
            message: f.message,
        }
    }
}

impl From<DenyReason> for CoreError {
    fn from(r: DenyReason) -> Self {
        CoreError::AddressDenied(r)
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
