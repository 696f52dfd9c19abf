//! Netlink plumbing for fib rules and routes
//!
//! Requests are assembled by [`message::NetlinkRequest`] and handed to a
//! [`NetlinkTransport`], which either talks to the kernel over rtnetlink or,
//! in tests, records them in memory.

use async_trait::async_trait;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAttribute, RuleMessage};
use rtnetlink::packet_route::AddressFamily;

use crate::error::NetlinkError;

pub mod kernel;
pub mod message;

#[cfg(test)]
pub(crate) mod fake;

pub use kernel::RtNetlinkTransport;
pub use message::{NetlinkRequest, RtmAction};

/// Maximum size of a single request, header included
pub const NETLINK_MAX_LEN: usize = 1024;

/// IP address family a request applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Both families, IPv4 first
    pub const BOTH: [IpFamily; 2] = [IpFamily::V4, IpFamily::V6];

    pub fn address_family(self) -> AddressFamily {
        match self {
            IpFamily::V4 => AddressFamily::Inet,
            IpFamily::V6 => AddressFamily::Inet6,
        }
    }

    /// Full-length prefix for a host address of this family
    pub fn host_prefix_len(self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// Family of an address string, IPv6 when it contains a colon
    pub fn of_address(addr: &str) -> Self {
        if addr.contains(':') {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            IpFamily::V4 => "IPv4",
            IpFamily::V6 => "IPv6",
        }
    }
}

/// Sends requests to the routing subsystem and reads back its tables
#[async_trait]
pub trait NetlinkTransport: Send + Sync {
    /// Send one request and wait for the kernel acknowledgement
    async fn send(&self, request: NetlinkRequest) -> Result<(), NetlinkError>;

    /// Dump every fib rule of a family
    async fn dump_rules(&self, family: IpFamily) -> Result<Vec<RuleMessage>, NetlinkError>;

    /// Dump every route of a family, across all tables
    async fn dump_routes(&self, family: IpFamily) -> Result<Vec<RouteMessage>, NetlinkError>;
}

/// Priority of a dumped rule, 0 when the kernel omitted it
pub fn rule_priority(rule: &RuleMessage) -> u32 {
    rule.attributes
        .iter()
        .find_map(|attr| match attr {
            RuleAttribute::Priority(priority) => Some(*priority),
            _ => None,
        })
        .unwrap_or(0)
}

/// Table of a dumped route, preferring the 32-bit attribute over the header byte
pub fn route_table_id(route: &RouteMessage) -> u32 {
    route
        .attributes
        .iter()
        .find_map(|attr| match attr {
            RouteAttribute::Table(table) => Some(*table),
            _ => None,
        })
        .unwrap_or(route.header.table as u32)
}

pub fn route_destination(route: &RouteMessage) -> Option<&RouteAddress> {
    route.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(addr) => Some(addr),
        _ => None,
    })
}
