// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.3
// Author: Lukas Bower
// Date Modified: 2027-08-28

//! Outbound network access: address policy, gateway and transports.

pub mod address;
pub mod gateway;
pub mod http;
pub mod policy;
pub mod pool;
mod websocket;

pub use address::{AddressPredicate, AddressRule, AddressRuleError, IpNet};
pub use gateway::{NetworkGateway, OpKind, OpState};
pub use http::HttpRequest;
pub use policy::{HostResolver, NetworkPolicy, PolicyHandle, StaticResolver, SystemResolver, Verdict};
