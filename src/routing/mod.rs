//! Policy routing engine
//!
//! Maps logical networks onto kernel routing tables and installs the fib
//! rules that steer packets into them. The operations live on
//! [`RouteManager`], split by network class across the submodules.

use std::fmt;

use crate::error::{RouteError, ROUTEMANAGER_ERROR};

pub mod distributed;
pub mod fwmark;
pub mod manager;
pub mod physical;
pub mod priority;
pub mod registry;
pub mod rules;
pub mod vpn;

pub use fwmark::Fwmark;
pub use manager::RouteManager;
pub use priority::{RuleBand, VpnCarrier};
pub use registry::RouteRegistry;
pub use rules::{RouteInfo, RuleInfo};

/// Blackhole table for traffic a sharing session must not forward
pub const ROUTE_UNREACHABLE_TABLE: u32 = 80;
/// Traffic heading back to a distributed client
pub const ROUTE_DISTRIBUTE_TO_CLIENT_TABLE: u32 = 90;
/// Traffic arriving from a distributed client
pub const ROUTE_DISTRIBUTE_FROM_CLIENT_TABLE: u32 = 91;
pub const ROUTE_VNIC_TABLE: u32 = 97;
/// Shared table of system VPNs
pub const ROUTE_VPN_NETWORK_TABLE: u32 = 98;
pub const ROUTE_LOCAL_NETWORK_TABLE: u32 = 99;
/// Tables at or below this number are the folded internal-network tables
pub const ROUTE_INTERNAL_DEFAULT_TABLE: u32 = 10;
/// Added to an interface index to get its table number
pub const ROUTE_TABLE_OFFSET_FROM_INDEX: u32 = 2000;
/// First table of per-instance VPN tables
pub const DEFAULT_ROUTE_VPN_NETWORK_BASE_TABLE: u32 = 1000;

pub const LOCAL_NET_ID: u16 = 99;
pub const NETID_UNSET: u16 = 0;
pub const MIN_INTERNAL_NET_ID: u16 = 1;
pub const MAX_INTERNAL_NET_ID: u16 = 50;

pub const UID_ROOT: u32 = 0;
/// The only uid allowed onto internal networks
pub const UID_ALLOW_INTERNAL: u32 = 7023;

pub const RULEIIF_LOOPBACK: &str = "lo";

/// Internal networks are private to the system and never shared
pub fn is_internal_net_id(net_id: u16) -> bool {
    (MIN_INTERNAL_NET_ID..=MAX_INTERNAL_NET_ID).contains(&net_id)
}

/// Network class a route table is chosen for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    Interface,
    LocalNetwork,
    VpnNetwork,
    InternalDefault,
    UnreachableNetwork,
}

/// Permission level a socket needs to use a network
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetworkPermission {
    #[default]
    None,
    Network,
    System,
}

impl NetworkPermission {
    pub fn bits(self) -> u32 {
        match self {
            NetworkPermission::None => 0,
            NetworkPermission::Network => 1,
            NetworkPermission::System => 3,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0 => NetworkPermission::None,
            1 => NetworkPermission::Network,
            _ => NetworkPermission::System,
        }
    }
}

impl fmt::Display for NetworkPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkPermission::None => "none",
            NetworkPermission::Network => "network",
            NetworkPermission::System => "system",
        };
        f.write_str(name)
    }
}

/// Inclusive range of uids a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UidRange {
    pub begin: u32,
    pub end: u32,
}

impl UidRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn single(uid: u32) -> Self {
        Self::new(uid, uid)
    }
}

/// A route as requested by the network service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkRouteInfo {
    pub if_name: String,
    pub destination: String,
    pub next_hop: String,
    pub is_excluded_route: bool,
}

impl NetworkRouteInfo {
    pub fn new(if_name: &str, destination: &str, next_hop: &str) -> Self {
        Self {
            if_name: if_name.to_string(),
            destination: destination.to_string(),
            next_hop: next_hop.to_string(),
            is_excluded_route: false,
        }
    }

    pub fn excluded(mut self) -> Self {
        self.is_excluded_route = true;
        self
    }
}

/// Result of adding a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAddOutcome {
    Added,
    /// The kernel already had this route; not a failure
    AlreadyExists,
}

impl RouteAddOutcome {
    /// The repeat flag of the integer API
    pub fn is_repeat(self) -> bool {
        self == RouteAddOutcome::AlreadyExists
    }
}

/// Per-step outcome of an operation made of independent installs
///
/// Every step runs regardless of earlier failures. Callers pick fail-fast
/// with [`StepResults::into_result`] or read the summed integer status with
/// [`StepResults::legacy_code`].
#[derive(Debug, Default)]
pub struct StepResults {
    steps: Vec<(&'static str, Result<(), RouteError>)>,
}

impl StepResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: &'static str, result: Result<(), RouteError>) {
        self.steps.push((label, result));
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn is_success(&self) -> bool {
        self.steps.iter().all(|(_, result)| result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &RouteError)> + '_ {
        self.steps
            .iter()
            .filter_map(|(label, result)| result.as_ref().err().map(|err| (*label, err)))
    }

    /// First failure, if any
    pub fn into_result(self) -> Result<(), RouteError> {
        for (_, result) in self.steps {
            result?;
        }
        Ok(())
    }

    /// Sum of the step status codes, zero only when every step succeeded
    pub fn legacy_code(&self) -> i32 {
        self.steps
            .iter()
            .map(|(_, result)| match result {
                Ok(()) => 0,
                Err(err) => match err.code() {
                    0 => ROUTEMANAGER_ERROR,
                    code => code,
                },
            })
            .fold(0i32, |acc, code| acc.saturating_add(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetlinkError;

    #[test]
    fn test_internal_net_ids() {
        assert!(!is_internal_net_id(0));
        assert!(is_internal_net_id(1));
        assert!(is_internal_net_id(50));
        assert!(!is_internal_net_id(51));
        assert!(!is_internal_net_id(LOCAL_NET_ID));
    }

    #[test]
    fn test_permission_bits() {
        for permission in [
            NetworkPermission::None,
            NetworkPermission::Network,
            NetworkPermission::System,
        ] {
            assert_eq!(NetworkPermission::from_bits(permission.bits()), permission);
        }
        assert_eq!(NetworkPermission::from_bits(2), NetworkPermission::System);
        assert_eq!(NetworkPermission::System.to_string(), "system");
    }

    #[test]
    fn test_step_results() {
        let mut steps = StepResults::new();
        assert!(steps.is_empty());
        steps.push("first", Ok(()));
        steps.push(
            "second",
            Err(RouteError::Netlink(NetlinkError::Kernel { code: -2 })),
        );
        steps.push("third", Err(RouteError::InvalidPriority(-1)));

        assert_eq!(steps.len(), 3);
        assert!(!steps.is_success());
        assert_eq!(steps.legacy_code(), -3);
        let labels: Vec<_> = steps.failures().map(|(label, _)| label).collect();
        assert_eq!(labels, vec!["second", "third"]);
        assert_eq!(
            steps.into_result(),
            Err(RouteError::Netlink(NetlinkError::Kernel { code: -2 }))
        );
    }

    #[test]
    fn test_step_results_success() {
        let mut steps = StepResults::new();
        steps.push("only", Ok(()));
        assert!(steps.is_success());
        assert_eq!(steps.legacy_code(), 0);
        assert!(steps.into_result().is_ok());
    }

    #[test]
    fn test_route_add_outcome() {
        assert!(RouteAddOutcome::AlreadyExists.is_repeat());
        assert!(!RouteAddOutcome::Added.is_repeat());
    }
}
