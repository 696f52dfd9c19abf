//! Rule and route descriptors and their netlink encoding

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL};
use rtnetlink::packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteProtocol, RouteScope, RouteType,
};
use rtnetlink::packet_route::rule::{RuleAction, RuleAttribute, RuleMessage, RuleUidRange};

use crate::error::RouteError;
use crate::netlink::message::truncate_ifname;
use crate::netlink::{IpFamily, NetlinkRequest, RtmAction};
use crate::network::InterfaceResolver;
use crate::routing::UidRange;

const UNREACHABLE_NEXT_HOP: &str = "unreachable";
const THROW_NEXT_HOP: &str = "throw";

/// One fib rule, before it is encoded for a family
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleInfo {
    pub table: u32,
    pub priority: i32,
    pub fwmark: u32,
    pub mask: u32,
    pub iif: String,
    pub oif: String,
    pub src_ip: String,
    pub dst_ip: String,
}

impl RuleInfo {
    pub fn new(table: u32, priority: i32) -> Self {
        Self {
            table,
            priority,
            ..Self::default()
        }
    }

    pub fn with_mark(mut self, fwmark: u32, mask: u32) -> Self {
        self.fwmark = fwmark;
        self.mask = mask;
        self
    }

    pub fn with_iif(mut self, iif: &str) -> Self {
        self.iif = iif.to_string();
        self
    }

    pub fn with_oif(mut self, oif: &str) -> Self {
        self.oif = oif.to_string();
        self
    }

    pub fn with_src(mut self, src_ip: &str) -> Self {
        self.src_ip = src_ip.to_string();
        self
    }

    pub fn with_dst(mut self, dst_ip: &str) -> Self {
        self.dst_ip = dst_ip.to_string();
        self
    }
}

/// One route with its table already resolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteInfo {
    pub table: u32,
    pub interface_name: String,
    pub destination: String,
    pub next_hop: String,
    pub is_excluded_route: bool,
}

impl RouteInfo {
    pub fn new(table: u32, interface_name: &str, destination: &str, next_hop: &str) -> Self {
        Self {
            table,
            interface_name: interface_name.to_string(),
            destination: destination.to_string(),
            next_hop: next_hop.to_string(),
            is_excluded_route: false,
        }
    }

    /// Kernel route type, from the next hop sentinels and the exclusion flag
    pub fn kind(&self) -> RouteType {
        if self.next_hop == UNREACHABLE_NEXT_HOP {
            RouteType::Unreachable
        } else if self.next_hop == THROW_NEXT_HOP || self.is_excluded_route {
            RouteType::Throw
        } else {
            RouteType::Unicast
        }
    }
}

/// Checks made before a rule is ever sent
pub fn validate_rule(action: RtmAction, rule: &RuleInfo) -> Result<(), RouteError> {
    if rule.priority < 0 {
        return Err(RouteError::InvalidPriority(rule.priority));
    }
    if rule.table == 0 && !action.is_delete() {
        return Err(RouteError::UnspecifiedTable);
    }
    // a mark bit outside the mask would be dropped from the request
    if rule.fwmark & !rule.mask != 0 {
        return Err(RouteError::MaskMismatch {
            fwmark: rule.fwmark,
            mask: rule.mask,
        });
    }
    Ok(())
}

/// Request flags for a rule add or delete
pub fn rule_flags(action: RtmAction, supports_sys_vpn: bool) -> u16 {
    match action {
        RtmAction::NewRule => NLM_F_CREATE,
        _ if supports_sys_vpn => 0,
        _ => NLM_F_EXCL,
    }
}

fn parse_family_addr(addr: &str, family: IpFamily) -> Result<IpAddr, RouteError> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| RouteError::InvalidAddress(addr.to_string()))?;
    if ip.is_ipv4() != (family == IpFamily::V4) {
        return Err(RouteError::InvalidAddress(format!(
            "{} is not an {} address",
            addr,
            family.label()
        )));
    }
    Ok(ip)
}

/// Encode a rule for one address family
pub fn build_rule_request(
    action: RtmAction,
    family: IpFamily,
    rule: &RuleInfo,
    uid_range: Option<UidRange>,
    flags: u16,
) -> Result<NetlinkRequest, RouteError> {
    let mut header = RuleMessage::default().header;
    header.family = family.address_family();
    header.action = RuleAction::ToTable;

    let src = if rule.src_ip.is_empty() {
        None
    } else {
        header.src_len = family.host_prefix_len();
        Some(parse_family_addr(&rule.src_ip, family)?)
    };
    let dst = if rule.dst_ip.is_empty() {
        None
    } else {
        header.dst_len = family.host_prefix_len();
        Some(parse_family_addr(&rule.dst_ip, family)?)
    };

    let priority =
        u32::try_from(rule.priority).map_err(|_| RouteError::InvalidPriority(rule.priority))?;

    let mut request = NetlinkRequest::rule(action, header, flags);
    request.add_rule_attr(RuleAttribute::Priority(priority))?;
    if rule.table != 0 {
        request.add_rule_attr(RuleAttribute::Table(rule.table))?;
    }
    if rule.mask != 0 {
        request.add_rule_attr(RuleAttribute::FwMark(rule.fwmark))?;
        request.add_rule_attr(RuleAttribute::FwMask(rule.mask))?;
    }
    if let Some(range) = uid_range {
        request.add_rule_attr(RuleAttribute::UidRange(RuleUidRange {
            start: range.begin,
            end: range.end,
        }))?;
    }
    if !rule.iif.is_empty() {
        request.add_rule_attr(RuleAttribute::Iifname(truncate_ifname(&rule.iif)))?;
    }
    if !rule.oif.is_empty() {
        request.add_rule_attr(RuleAttribute::Oifname(truncate_ifname(&rule.oif)))?;
    }
    if let Some(src) = src {
        request.add_rule_attr(RuleAttribute::Source(src))?;
    }
    if let Some(dst) = dst {
        request.add_rule_attr(RuleAttribute::Destination(dst))?;
    }
    Ok(request)
}

fn route_address(ip: IpAddr) -> RouteAddress {
    match ip {
        IpAddr::V4(v4) => RouteAddress::Inet(v4),
        IpAddr::V6(v6) => RouteAddress::Inet6(v6),
    }
}

/// Encode a route
///
/// Unreachable and throw routes carry neither a gateway nor an output
/// interface. Any other route with an interface needs its index from
/// `resolver`.
pub fn build_route_request(
    action: RtmAction,
    flags: u16,
    route: &RouteInfo,
    resolver: &dyn InterfaceResolver,
) -> Result<NetlinkRequest, RouteError> {
    let kind = route.kind();
    let (interface_name, next_hop) = match kind {
        RouteType::Unicast => (route.interface_name.as_str(), route.next_hop.as_str()),
        _ => ("", ""),
    };

    if !route.destination.contains('/') {
        return Err(RouteError::InvalidAddress(format!(
            "{} is not in CIDR notation",
            route.destination
        )));
    }
    let destination: IpNetwork = route
        .destination
        .parse()
        .map_err(|_| RouteError::InvalidAddress(route.destination.clone()))?;
    let family = match destination {
        IpNetwork::V4(_) => IpFamily::V4,
        IpNetwork::V6(_) => IpFamily::V6,
    };

    let mut header = RouteMessage::default().header;
    header.address_family = family.address_family();
    header.destination_prefix_length = destination.prefix();
    header.protocol = RouteProtocol::Static;
    header.kind = kind;
    header.scope = match family {
        IpFamily::V4 => RouteScope::Link,
        IpFamily::V6 => RouteScope::Universe,
    };

    let gateway = if next_hop.is_empty() {
        None
    } else {
        header.scope = RouteScope::Universe;
        Some(parse_family_addr(next_hop, family)?)
    };
    let oif = if interface_name.is_empty() {
        None
    } else {
        Some(
            resolver
                .index_of(interface_name)
                .ok_or_else(|| RouteError::UnknownInterface {
                    name: interface_name.to_string(),
                })?,
        )
    };

    let mut request = NetlinkRequest::route(action, header, flags);
    request.add_route_attr(RouteAttribute::Table(route.table))?;
    request.add_route_attr(RouteAttribute::Destination(route_address(destination.ip())))?;
    if let Some(gateway) = gateway {
        request.add_route_attr(RouteAttribute::Gateway(route_address(gateway)))?;
    }
    if let Some(index) = oif {
        request.add_route_attr(RouteAttribute::Oif(index))?;
    }
    Ok(request)
}

/// Address for log lines, all but the last group masked
pub fn anonymize_address(addr: &str) -> String {
    let (ip, prefix) = match addr.split_once('/') {
        Some((ip, prefix)) => (ip, Some(prefix)),
        None => (addr, None),
    };
    let is_separator = |c: char| c == '.' || c == ':';

    let mut masked = String::with_capacity(addr.len());
    match ip.rfind(is_separator) {
        Some(last) => {
            let mut in_group = false;
            for c in ip[..last].chars() {
                if is_separator(c) {
                    masked.push(c);
                    in_group = false;
                } else if !in_group {
                    masked.push('*');
                    in_group = true;
                }
            }
            masked.push_str(&ip[last..]);
        }
        None => masked.push_str(ip),
    }
    if let Some(prefix) = prefix {
        masked.push('/');
        masked.push_str(prefix);
    }
    masked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticInterfaceResolver;
    use rtnetlink::packet_core::NLM_F_REPLACE;
    use rtnetlink::packet_route::AddressFamily;

    fn resolver() -> StaticInterfaceResolver {
        StaticInterfaceResolver::new().with_interface("wlan0", 5)
    }

    #[test]
    fn test_validate_rule() {
        let rule = RuleInfo::new(2005, 12000).with_mark(0x10000, 0x30000);
        assert!(validate_rule(RtmAction::NewRule, &rule).is_ok());

        let negative = RuleInfo::new(2005, -1);
        assert_eq!(
            validate_rule(RtmAction::NewRule, &negative),
            Err(RouteError::InvalidPriority(-1))
        );

        let mismatch = RuleInfo::new(2005, 12000).with_mark(0x10001, 0x10000);
        assert!(matches!(
            validate_rule(RtmAction::NewRule, &mismatch),
            Err(RouteError::MaskMismatch { .. })
        ));
        let unmasked = RuleInfo::new(90, 8800).with_mark(0x1, 0x0);
        assert_eq!(
            validate_rule(RtmAction::NewRule, &unmasked),
            Err(RouteError::MaskMismatch { fwmark: 0x1, mask: 0x0 })
        );

        let unspecified = RuleInfo::new(0, 14000).with_iif("wlan0");
        assert_eq!(
            validate_rule(RtmAction::NewRule, &unspecified),
            Err(RouteError::UnspecifiedTable)
        );
        assert!(validate_rule(RtmAction::DelRule, &unspecified).is_ok());
    }

    #[test]
    fn test_rule_flags() {
        assert_eq!(rule_flags(RtmAction::NewRule, false), NLM_F_CREATE);
        assert_eq!(rule_flags(RtmAction::NewRule, true), NLM_F_CREATE);
        assert_eq!(rule_flags(RtmAction::DelRule, false), NLM_F_EXCL);
        assert_eq!(rule_flags(RtmAction::DelRule, true), 0);
    }

    #[test]
    fn test_rule_attributes_in_order() {
        let rule = RuleInfo::new(2005, 11000)
            .with_mark(0x10064, 0x1ffff)
            .with_iif("lo");
        let request = build_rule_request(
            RtmAction::NewRule,
            IpFamily::V6,
            &rule,
            Some(UidRange::new(1000, 1999)),
            NLM_F_CREATE,
        )
        .unwrap();

        let message = request.rule_message().unwrap();
        assert_eq!(message.header.family, AddressFamily::Inet6);
        assert_eq!(message.header.action, RuleAction::ToTable);
        assert_eq!(
            message.attributes,
            vec![
                RuleAttribute::Priority(11000),
                RuleAttribute::Table(2005),
                RuleAttribute::FwMark(0x10064),
                RuleAttribute::FwMask(0x1ffff),
                RuleAttribute::UidRange(RuleUidRange {
                    start: 1000,
                    end: 1999
                }),
                RuleAttribute::Iifname("lo".to_string()),
            ]
        );
    }

    #[test]
    fn test_rule_without_mask_or_table() {
        let rule = RuleInfo::new(0, 14000).with_mark(0, 0).with_iif("wlan0");
        let request =
            build_rule_request(RtmAction::DelRule, IpFamily::V4, &rule, None, NLM_F_EXCL).unwrap();
        assert_eq!(
            request.rule_message().unwrap().attributes,
            vec![
                RuleAttribute::Priority(14000),
                RuleAttribute::Iifname("wlan0".to_string()),
            ]
        );
    }

    #[test]
    fn test_rule_addresses() {
        let rule = RuleInfo::new(90, 8500).with_dst("fd00::2");
        let request =
            build_rule_request(RtmAction::NewRule, IpFamily::V6, &rule, None, NLM_F_CREATE)
                .unwrap();
        let message = request.rule_message().unwrap();
        assert_eq!(message.header.dst_len, 128);
        assert_eq!(message.header.src_len, 0);
        assert!(message
            .attributes
            .contains(&RuleAttribute::Destination("fd00::2".parse().unwrap())));

        let wrong_family =
            build_rule_request(RtmAction::NewRule, IpFamily::V4, &rule, None, NLM_F_CREATE);
        assert!(matches!(wrong_family, Err(RouteError::InvalidAddress(_))));

        let v4 = RuleInfo::new(80, 7000).with_src("192.168.43.5").with_iif("wlan0");
        let request =
            build_rule_request(RtmAction::NewRule, IpFamily::V4, &v4, None, NLM_F_CREATE).unwrap();
        assert_eq!(request.rule_message().unwrap().header.src_len, 32);
    }

    #[test]
    fn test_long_ifname_is_truncated() {
        let rule = RuleInfo::new(1003, 11500).with_oif("multitun-vpn1234567");
        let request =
            build_rule_request(RtmAction::NewRule, IpFamily::V4, &rule, None, NLM_F_CREATE)
                .unwrap();
        assert!(request
            .rule_message()
            .unwrap()
            .attributes
            .contains(&RuleAttribute::Oifname("multitun-vpn123".to_string())));
    }

    #[test]
    fn test_unicast_route() {
        let route = RouteInfo::new(2005, "wlan0", "10.0.0.0/24", "10.0.0.1");
        let request =
            build_route_request(RtmAction::NewRoute, NLM_F_CREATE | NLM_F_EXCL, &route, &resolver())
                .unwrap();
        let message = request.route_message().unwrap();

        assert_eq!(message.header.address_family, AddressFamily::Inet);
        assert_eq!(message.header.destination_prefix_length, 24);
        assert_eq!(message.header.protocol, RouteProtocol::Static);
        assert_eq!(message.header.kind, RouteType::Unicast);
        assert_eq!(message.header.scope, RouteScope::Universe);
        assert_eq!(
            message.attributes,
            vec![
                RouteAttribute::Table(2005),
                RouteAttribute::Destination(RouteAddress::Inet("10.0.0.0".parse().unwrap())),
                RouteAttribute::Gateway(RouteAddress::Inet("10.0.0.1".parse().unwrap())),
                RouteAttribute::Oif(5),
            ]
        );
    }

    #[test]
    fn test_link_scope_without_gateway() {
        let route = RouteInfo::new(2005, "wlan0", "192.168.1.0/24", "");
        let request =
            build_route_request(RtmAction::NewRoute, NLM_F_REPLACE, &route, &resolver()).unwrap();
        let message = request.route_message().unwrap();
        assert_eq!(message.header.scope, RouteScope::Link);
        assert_eq!(message.attributes.len(), 3);

        let v6 = RouteInfo::new(2005, "wlan0", "fe80::/64", "");
        let request =
            build_route_request(RtmAction::NewRoute, NLM_F_REPLACE, &v6, &resolver()).unwrap();
        assert_eq!(request.route_message().unwrap().header.scope, RouteScope::Universe);
    }

    #[test]
    fn test_unreachable_route_has_no_next_hop() {
        let route = RouteInfo::new(2005, "wlan0", "10.8.0.0/16", "unreachable");
        let request = build_route_request(RtmAction::NewRoute, NLM_F_CREATE, &route, &resolver())
            .unwrap();
        let message = request.route_message().unwrap();
        assert_eq!(message.header.kind, RouteType::Unreachable);
        assert!(!message
            .attributes
            .iter()
            .any(|attr| matches!(attr, RouteAttribute::Oif(_) | RouteAttribute::Gateway(_))));
    }

    #[test]
    fn test_throw_and_excluded_routes() {
        let mut route = RouteInfo::new(98, "vpn-tun", "10.9.0.0/16", "10.9.0.1");
        route.is_excluded_route = true;
        // the interface is never resolved for a throw route
        let request = build_route_request(
            RtmAction::NewRoute,
            NLM_F_CREATE,
            &route,
            &StaticInterfaceResolver::new(),
        )
        .unwrap();
        let message = request.route_message().unwrap();
        assert_eq!(message.header.kind, RouteType::Throw);
        assert_eq!(message.attributes.len(), 2);

        let throw = RouteInfo::new(98, "", "10.9.0.0/16", "throw");
        assert_eq!(throw.kind(), RouteType::Throw);
    }

    #[test]
    fn test_route_errors() {
        let no_prefix = RouteInfo::new(2005, "wlan0", "10.0.0.0", "");
        assert!(matches!(
            build_route_request(RtmAction::NewRoute, 0, &no_prefix, &resolver()),
            Err(RouteError::InvalidAddress(_))
        ));

        let mixed = RouteInfo::new(2005, "wlan0", "10.0.0.0/8", "fe80::1");
        assert!(matches!(
            build_route_request(RtmAction::NewRoute, 0, &mixed, &resolver()),
            Err(RouteError::InvalidAddress(_))
        ));

        let unknown = RouteInfo::new(2005, "eth7", "10.0.0.0/8", "");
        assert_eq!(
            build_route_request(RtmAction::NewRoute, 0, &unknown, &resolver()).unwrap_err(),
            RouteError::UnknownInterface {
                name: "eth7".to_string()
            }
        );
    }

    #[test]
    fn test_anonymize_address() {
        assert_eq!(anonymize_address("192.168.43.5"), "*.*.*.5");
        assert_eq!(anonymize_address("10.0.0.0/24"), "*.*.*.0/24");
        assert_eq!(anonymize_address("fe80::1"), "*::1");
        assert_eq!(anonymize_address("unreachable"), "unreachable");
        assert_eq!(anonymize_address(""), "");
    }
}
