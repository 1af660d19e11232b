// CLASSIFICATION: COMMUNITY
// Filename: address.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-22

//! Address rules and the predicate built from an ordered list of them.
//!
//! A rule is one of: `*`, a CIDR block, a literal IP, an exact hostname or a
//! single-leading-wildcard domain such as `*.example.com`.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressRuleError {
    #[error("rule is empty")]
    Empty,
    #[error("'{0}' is not a valid CIDR block")]
    BadCidr(String),
    #[error("'{0}' is not a valid host pattern")]
    BadHost(String),
}

/// IPv4/IPv6 network with a prefix length. The stored address is masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    net: IpAddr,
    prefix: u8,
}

impl IpNet {
    pub fn parse(s: &str) -> Option<IpNet> {
        let (ip_s, prefix_s) = s.split_once('/')?;
        let ip = ip_s.parse::<IpAddr>().ok()?;
        let prefix = prefix_s.parse::<u8>().ok()?;
        Self::new(ip, prefix)
    }

    pub fn new(ip: IpAddr, prefix: u8) -> Option<IpNet> {
        let net = match ip {
            IpAddr::V4(v4) => {
                if prefix > 32 {
                    return None;
                }
                IpAddr::V4((u32::from(v4) & mask_u32(prefix)).into())
            }
            IpAddr::V6(v6) => {
                if prefix > 128 {
                    return None;
                }
                IpAddr::V6((u128::from(v6) & mask_u128(prefix)).into())
            }
        };
        Some(IpNet { net, prefix })
    }

    /// Single-address network.
    pub fn host(ip: IpAddr) -> IpNet {
        let prefix = if ip.is_ipv4() { 32 } else { 128 };
        IpNet { net: ip, prefix }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.net, canonical(ip)) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                (u32::from(ip) & mask_u32(self.prefix)) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                (u128::from(ip) & mask_u128(self.prefix)) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net, self.prefix)
    }
}

fn mask_u32(prefix: u8) -> u32 {
    if prefix == 0 {
        return 0;
    }
    (!0u32) << (32 - prefix)
}

fn mask_u128(prefix: u8) -> u128 {
    if prefix == 0 {
        return 0;
    }
    (!0u128) << (128 - prefix)
}

/// IPv4-mapped IPv6 addresses are compared as IPv4.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRule {
    Any,
    Net(IpNet),
    Host(String),
    /// Matches any strict subdomain of the stored suffix.
    Wildcard(String),
}

impl AddressRule {
    pub fn parse(rule: &str) -> Result<AddressRule, AddressRuleError> {
        let rule = rule.trim();
        if rule.is_empty() {
            return Err(AddressRuleError::Empty);
        }
        if rule == "*" {
            return Ok(AddressRule::Any);
        }
        if rule.contains('/') {
            return IpNet::parse(rule)
                .map(AddressRule::Net)
                .ok_or_else(|| AddressRuleError::BadCidr(rule.to_string()));
        }
        if let Ok(ip) = rule.parse::<IpAddr>() {
            return Ok(AddressRule::Net(IpNet::host(canonical(ip))));
        }
        let lower = rule.to_ascii_lowercase();
        if let Some(suffix) = lower.strip_prefix("*.") {
            if valid_hostname(suffix) {
                return Ok(AddressRule::Wildcard(suffix.to_string()));
            }
            return Err(AddressRuleError::BadHost(rule.to_string()));
        }
        if valid_hostname(&lower) {
            Ok(AddressRule::Host(lower))
        } else {
            Err(AddressRuleError::BadHost(rule.to_string()))
        }
    }

    /// Does the rule match the name the script asked for?
    pub fn matches_host(&self, host: &str) -> bool {
        match self {
            AddressRule::Any => true,
            AddressRule::Net(net) => host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .map(|ip| net.contains(ip))
                .unwrap_or(false),
            AddressRule::Host(name) => host.eq_ignore_ascii_case(name),
            AddressRule::Wildcard(suffix) => {
                let host = host.to_ascii_lowercase();
                host.len() > suffix.len() + 1
                    && host.ends_with(suffix.as_str())
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
            }
        }
    }

    /// Does the rule match a resolved address?
    pub fn matches_addr(&self, ip: IpAddr) -> bool {
        match self {
            AddressRule::Any => true,
            AddressRule::Net(net) => net.contains(ip),
            AddressRule::Host(_) | AddressRule::Wildcard(_) => false,
        }
    }
}

impl fmt::Display for AddressRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRule::Any => f.write_str("*"),
            AddressRule::Net(net) => write!(f, "{net}"),
            AddressRule::Host(h) => f.write_str(h),
            AddressRule::Wildcard(s) => write!(f, "*.{s}"),
        }
    }
}

fn valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

/// An ordered list of rules. Matches when any rule matches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressPredicate {
    rules: Vec<AddressRule>,
}

impl AddressPredicate {
    pub fn from_rules<I, S>(rules: I) -> Result<Self, AddressRuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|r| AddressRule::parse(r.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn rules(&self) -> &[AddressRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches_host(&self, host: &str) -> bool {
        self.rules.iter().any(|r| r.matches_host(host))
    }

    pub fn matches_addr(&self, ip: IpAddr) -> bool {
        self.rules.iter().any(|r| r.matches_addr(ip))
    }

    pub fn matches(&self, host: &str, ip: IpAddr) -> bool {
        self.matches_host(host) || self.matches_addr(ip)
    }
}
