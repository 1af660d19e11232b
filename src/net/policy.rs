// CLASSIFICATION: COMMUNITY
// Filename: policy.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-23

//! Outbound network policy: whitelist, blacklist and port filter.
//!
//! A [`NetworkPolicy`] is immutable once built. Configuration reloads build a
//! fresh policy and swap it into the [`PolicyHandle`], so a classification in
//! progress always sees one complete policy.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, RwLock};

use log::debug;

use super::address::{canonical, AddressPredicate, AddressRuleError};
use crate::config::HttpConfig;
use crate::error::DenyReason;

/// Name resolution seam. The system resolver is used in production; tests
/// inject fixed answers.
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok((host, port).to_socket_addrs()?.map(|a| a.ip()).collect())
    }
}

/// Resolver answering from a fixed table.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: &str, addrs: &[IpAddr]) -> Self {
        self.table.insert(host.to_ascii_lowercase(), addrs.to_vec());
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.table
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}

/// Outcome of classifying a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Allowed, with the addresses that passed the filter.
    Allowed(Vec<IpAddr>),
    Denied(DenyReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkPolicy {
    whitelist: AddressPredicate,
    blacklist: AddressPredicate,
    allowed_ports: Vec<u16>,
}

impl NetworkPolicy {
    pub fn new<W, B, S>(whitelist: W, blacklist: B) -> Result<Self, AddressRuleError>
    where
        W: IntoIterator<Item = S>,
        B: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            whitelist: AddressPredicate::from_rules(whitelist)?,
            blacklist: AddressPredicate::from_rules(blacklist)?,
            allowed_ports: Vec::new(),
        })
    }

    pub fn from_config(cfg: &HttpConfig) -> Result<Self, AddressRuleError> {
        let mut policy = Self::new(&cfg.whitelist, &cfg.blacklist)?;
        policy.allowed_ports = cfg.allowed_ports.clone();
        Ok(policy)
    }

    pub fn with_allowed_ports(mut self, ports: &[u16]) -> Self {
        self.allowed_ports = ports.to_vec();
        self
    }

    pub fn whitelist(&self) -> &AddressPredicate {
        &self.whitelist
    }

    pub fn blacklist(&self) -> &AddressPredicate {
        &self.blacklist
    }

    fn check_port(&self, port: Option<u16>) -> Result<(), DenyReason> {
        match port {
            Some(0) => Err(DenyReason::PortNotAllowed(0)),
            Some(p) if !self.allowed_ports.is_empty() && !self.allowed_ports.contains(&p) => {
                Err(DenyReason::PortNotAllowed(p))
            }
            _ => Ok(()),
        }
    }

    fn check_addr(&self, host: &str, ip: IpAddr) -> Result<(), DenyReason> {
        let ip = canonical(ip);
        // Connecting to the unspecified address reaches the local host.
        if ip.is_unspecified() || self.blacklist.matches_addr(ip) {
            return Err(DenyReason::Blacklisted);
        }
        if self.whitelist.matches(host, ip) {
            Ok(())
        } else {
            Err(DenyReason::NotWhitelisted)
        }
    }

    /// Classify without touching DNS. Returns `None` when the host is a name
    /// that still needs resolving and no name rule already denies it.
    pub fn precheck(&self, host: &str, port: Option<u16>) -> Option<Verdict> {
        if let Err(reason) = self.check_port(port) {
            return Some(Verdict::Denied(reason));
        }
        if self.blacklist.matches_host(host) {
            return Some(Verdict::Denied(DenyReason::Blacklisted));
        }
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let ip = literal.parse::<IpAddr>().ok()?;
        Some(match self.check_addr(host, ip) {
            Ok(()) => Verdict::Allowed(vec![ip]),
            Err(reason) => Verdict::Denied(reason),
        })
    }

    /// Full classification: name rules, resolution, then address rules on
    /// every resolved address. Blacklist matches always win.
    pub fn classify(&self, host: &str, port: Option<u16>, resolver: &dyn HostResolver) -> Verdict {
        if let Some(verdict) = self.precheck(host, port) {
            return verdict;
        }
        let addrs = match resolver.resolve(host, port.unwrap_or(0)) {
            Ok(addrs) if !addrs.is_empty() => addrs,
            Ok(_) => return Verdict::Denied(DenyReason::CouldNotResolve),
            Err(e) => {
                debug!("resolution of {host} failed: {e}");
                return Verdict::Denied(DenyReason::CouldNotResolve);
            }
        };
        let mut allowed = Vec::with_capacity(addrs.len());
        let mut reason = DenyReason::NotWhitelisted;
        for ip in addrs {
            match self.check_addr(host, ip) {
                Ok(()) => allowed.push(ip),
                Err(DenyReason::Blacklisted) => reason = DenyReason::Blacklisted,
                Err(_) => {}
            }
        }
        if allowed.is_empty() {
            Verdict::Denied(reason)
        } else {
            Verdict::Allowed(allowed)
        }
    }
}

/// Shared, swappable reference to the active policy.
#[derive(Debug)]
pub struct PolicyHandle {
    current: RwLock<Arc<NetworkPolicy>>,
}

impl PolicyHandle {
    pub fn new(policy: NetworkPolicy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    pub fn load(&self) -> Arc<NetworkPolicy> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn store(&self, policy: NetworkPolicy) {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_HTTP_BLACKLIST;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn blacklist_beats_star_whitelist() {
        let policy = NetworkPolicy::new(["*"], ["10.0.0.0/8"]).unwrap();
        let resolver = StaticResolver::new();
        assert_eq!(
            policy.classify("10.1.2.3", None, &resolver),
            Verdict::Denied(DenyReason::Blacklisted)
        );
        assert_eq!(
            policy.classify("93.184.216.34", None, &resolver),
            Verdict::Allowed(vec![ip("93.184.216.34")])
        );
    }

    #[test]
    fn resolved_names_are_filtered_per_address() {
        let policy = NetworkPolicy::new(["*"], DEFAULT_HTTP_BLACKLIST.iter().copied()).unwrap();
        let resolver = StaticResolver::new()
            .with("mixed.test", &[ip("192.168.1.1"), ip("93.184.216.34")])
            .with("internal.test", &[ip("10.0.0.5")]);
        assert_eq!(
            policy.classify("mixed.test", Some(80), &resolver),
            Verdict::Allowed(vec![ip("93.184.216.34")])
        );
        assert_eq!(
            policy.classify("internal.test", Some(80), &resolver),
            Verdict::Denied(DenyReason::Blacklisted)
        );
        assert_eq!(
            policy.classify("nowhere.test", Some(80), &resolver),
            Verdict::Denied(DenyReason::CouldNotResolve)
        );
    }

    #[test]
    fn whitelist_by_wildcard_name() {
        let policy = NetworkPolicy::new(["*.example.com"], Vec::<&str>::new()).unwrap();
        let resolver = StaticResolver::new()
            .with("api.example.com", &[ip("93.184.216.34")])
            .with("other.org", &[ip("93.184.216.35")]);
        assert!(policy.classify("api.example.com", None, &resolver).is_allowed());
        assert_eq!(
            policy.classify("other.org", None, &resolver),
            Verdict::Denied(DenyReason::NotWhitelisted)
        );
    }

    #[test]
    fn blacklisted_name_never_resolves() {
        let policy = NetworkPolicy::new(["*"], ["*.corp.internal"]).unwrap();
        assert_eq!(
            policy.precheck("db.corp.internal", Some(443)),
            Some(Verdict::Denied(DenyReason::Blacklisted))
        );
    }

    #[test]
    fn ports_are_filtered() {
        let policy = NetworkPolicy::new(["*"], Vec::<&str>::new())
            .unwrap()
            .with_allowed_ports(&[80, 443]);
        let resolver = StaticResolver::new();
        assert!(policy.classify("93.184.216.34", Some(443), &resolver).is_allowed());
        assert_eq!(
            policy.classify("93.184.216.34", Some(22), &resolver),
            Verdict::Denied(DenyReason::PortNotAllowed(22))
        );
    }

    #[test]
    fn handle_swaps_whole_policy() {
        let handle = PolicyHandle::new(NetworkPolicy::new(["*"], ["10.0.0.0/8"]).unwrap());
        let before = handle.load();
        handle.store(NetworkPolicy::new(["*"], Vec::<&str>::new()).unwrap());
        let resolver = StaticResolver::new();
        assert!(!before.classify("10.0.0.1", None, &resolver).is_allowed());
        assert!(handle.load().classify("10.0.0.1", None, &resolver).is_allowed());
    }
}
