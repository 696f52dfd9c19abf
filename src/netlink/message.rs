//! Netlink request assembly with a bounded message size

use std::net::IpAddr;

use rtnetlink::packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_REQUEST,
};
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteHeader, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAttribute, RuleHeader, RuleMessage};
use rtnetlink::packet_route::RouteNetlinkMessage;

use crate::error::NetlinkError;
use crate::netlink::NETLINK_MAX_LEN;

/// Kernel interface name buffer size, terminator included
pub const IFNAMSIZ: usize = 16;

const NLMSG_HDR_LEN: usize = 16;
const FIB_RULE_HDR_LEN: usize = 12;
const RTMSG_LEN: usize = 12;
const NLA_HDR_LEN: usize = 4;
const NLA_ALIGNTO: usize = 4;

fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

fn ip_len(ip: &IpAddr) -> usize {
    match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

fn rule_attr_len(attr: &RuleAttribute) -> usize {
    let payload = match attr {
        RuleAttribute::Iifname(name) | RuleAttribute::Oifname(name) => name.len() + 1,
        RuleAttribute::Source(ip) | RuleAttribute::Destination(ip) => ip_len(ip),
        RuleAttribute::UidRange(_) => 8,
        _ => 4,
    };
    nla_align(NLA_HDR_LEN + payload)
}

fn route_attr_len(attr: &RouteAttribute) -> usize {
    let payload = match attr {
        RouteAttribute::Destination(addr) | RouteAttribute::Gateway(addr) => match addr {
            RouteAddress::Inet(_) => 4,
            RouteAddress::Inet6(_) => 16,
            RouteAddress::Other(bytes) => bytes.len(),
            _ => 4,
        },
        _ => 4,
    };
    nla_align(NLA_HDR_LEN + payload)
}

/// Truncate an interface name to what fits in `IFNAMSIZ` with its terminator
pub fn truncate_ifname(name: &str) -> String {
    let mut end = name.len().min(IFNAMSIZ - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Netlink action carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RtmAction {
    NewRule,
    DelRule,
    NewRoute,
    DelRoute,
}

impl RtmAction {
    pub fn is_delete(self) -> bool {
        matches!(self, RtmAction::DelRule | RtmAction::DelRoute)
    }

    pub fn is_rule(self) -> bool {
        matches!(self, RtmAction::NewRule | RtmAction::DelRule)
    }
}

#[derive(Debug, Clone)]
enum RequestBody {
    Rule(RuleMessage),
    Route(RouteMessage),
}

/// One rule or route request under construction
///
/// Attributes are appended one at a time; each append fails with
/// [`NetlinkError::BufferOverflow`] once the encoded message would grow past
/// the configured maximum, leaving the request unchanged.
#[derive(Debug, Clone)]
pub struct NetlinkRequest {
    action: RtmAction,
    flags: u16,
    body: RequestBody,
    len: usize,
    max_len: usize,
}

impl NetlinkRequest {
    /// Start a rule request (`RTM_NEWRULE` / `RTM_DELRULE`)
    pub fn rule(action: RtmAction, header: RuleHeader, flags: u16) -> Self {
        debug_assert!(action.is_rule());
        let mut message = RuleMessage::default();
        message.header = header;
        Self {
            action,
            flags,
            body: RequestBody::Rule(message),
            len: NLMSG_HDR_LEN + FIB_RULE_HDR_LEN,
            max_len: NETLINK_MAX_LEN,
        }
    }

    /// Start a route request (`RTM_NEWROUTE` / `RTM_DELROUTE`)
    pub fn route(action: RtmAction, header: RouteHeader, flags: u16) -> Self {
        debug_assert!(!action.is_rule());
        let mut message = RouteMessage::default();
        message.header = header;
        Self {
            action,
            flags,
            body: RequestBody::Route(message),
            len: NLMSG_HDR_LEN + RTMSG_LEN,
            max_len: NETLINK_MAX_LEN,
        }
    }

    /// Rebuild a request from a rule read back from the kernel
    pub fn from_rule_message(
        action: RtmAction,
        message: RuleMessage,
        flags: u16,
    ) -> Result<Self, NetlinkError> {
        let mut request = Self::rule(action, message.header.clone(), flags);
        for attr in message.attributes {
            request.add_rule_attr(attr)?;
        }
        Ok(request)
    }

    /// Rebuild a request from a route read back from the kernel
    pub fn from_route_message(
        action: RtmAction,
        message: RouteMessage,
        flags: u16,
    ) -> Result<Self, NetlinkError> {
        let mut request = Self::route(action, message.header.clone(), flags);
        for attr in message.attributes {
            request.add_route_attr(attr)?;
        }
        Ok(request)
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn add_rule_attr(&mut self, attr: RuleAttribute) -> Result<(), NetlinkError> {
        let RequestBody::Rule(message) = &mut self.body else {
            return Err(NetlinkError::Transport(
                "rule attribute on a route request".to_string(),
            ));
        };
        let needed = self.len + rule_attr_len(&attr);
        if needed > self.max_len {
            return Err(NetlinkError::BufferOverflow {
                needed,
                max: self.max_len,
            });
        }
        message.attributes.push(attr);
        self.len = needed;
        Ok(())
    }

    pub fn add_route_attr(&mut self, attr: RouteAttribute) -> Result<(), NetlinkError> {
        let RequestBody::Route(message) = &mut self.body else {
            return Err(NetlinkError::Transport(
                "route attribute on a rule request".to_string(),
            ));
        };
        let needed = self.len + route_attr_len(&attr);
        if needed > self.max_len {
            return Err(NetlinkError::BufferOverflow {
                needed,
                max: self.max_len,
            });
        }
        message.attributes.push(attr);
        self.len = needed;
        Ok(())
    }

    pub fn action(&self) -> RtmAction {
        self.action
    }

    /// Caller-chosen flags, without the implicit `NLM_F_REQUEST | NLM_F_ACK`
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Encoded length in bytes
    pub fn encoded_len(&self) -> usize {
        self.len
    }

    pub fn rule_message(&self) -> Option<&RuleMessage> {
        match &self.body {
            RequestBody::Rule(message) => Some(message),
            RequestBody::Route(_) => None,
        }
    }

    pub fn route_message(&self) -> Option<&RouteMessage> {
        match &self.body {
            RequestBody::Route(message) => Some(message),
            RequestBody::Rule(_) => None,
        }
    }

    /// The finished netlink message, ready to hand to a socket
    pub fn to_message(&self) -> NetlinkMessage<RouteNetlinkMessage> {
        let payload = match (&self.body, self.action) {
            (RequestBody::Rule(message), RtmAction::DelRule) => {
                RouteNetlinkMessage::DelRule(message.clone())
            }
            (RequestBody::Rule(message), _) => RouteNetlinkMessage::NewRule(message.clone()),
            (RequestBody::Route(message), RtmAction::DelRoute) => {
                RouteNetlinkMessage::DelRoute(message.clone())
            }
            (RequestBody::Route(message), _) => RouteNetlinkMessage::NewRoute(message.clone()),
        };

        let mut header = NetlinkHeader::default();
        header.flags = NLM_F_REQUEST | NLM_F_ACK | self.flags;
        header.sequence_number = 1;

        let mut message = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        message.finalize();
        message
    }

    /// Wire encoding of the finished message
    pub fn to_bytes(&self) -> Vec<u8> {
        let message = self.to_message();
        let mut buffer = vec![0u8; message.buffer_len()];
        message.serialize(&mut buffer);
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL};
    use rtnetlink::packet_route::rule::{RuleAction, RuleUidRange};
    use rtnetlink::packet_route::AddressFamily;

    fn rule_header() -> RuleHeader {
        let mut header = RuleMessage::default().header;
        header.family = AddressFamily::Inet;
        header.action = RuleAction::ToTable;
        header
    }

    #[test]
    fn test_rule_request_encoding() {
        let mut request = NetlinkRequest::rule(RtmAction::NewRule, rule_header(), NLM_F_CREATE);
        request.add_rule_attr(RuleAttribute::Priority(12000)).unwrap();
        request.add_rule_attr(RuleAttribute::Table(2003)).unwrap();
        request.add_rule_attr(RuleAttribute::FwMark(0)).unwrap();
        request.add_rule_attr(RuleAttribute::FwMask(0x30000)).unwrap();
        request
            .add_rule_attr(RuleAttribute::Iifname("lo".to_string()))
            .unwrap();

        assert_eq!(request.encoded_len(), 68);

        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), 68);
        assert_eq!(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 68);
        // RTM_NEWRULE
        assert_eq!(u16::from_ne_bytes([bytes[4], bytes[5]]), 32);
        let flags = u16::from_ne_bytes([bytes[6], bytes[7]]);
        assert_eq!(flags, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE);
        // fib_rule_hdr family and action
        assert_eq!(bytes[16], 2);
        assert_eq!(bytes[23], 1);
    }

    #[test]
    fn test_delete_request_message_type() {
        let request = NetlinkRequest::rule(RtmAction::DelRule, rule_header(), NLM_F_EXCL);
        let bytes = request.to_bytes();
        // RTM_DELRULE
        assert_eq!(u16::from_ne_bytes([bytes[4], bytes[5]]), 33);
        assert!(request.action().is_delete());
    }

    #[test]
    fn test_buffer_overflow_leaves_request_untouched() {
        let mut request =
            NetlinkRequest::rule(RtmAction::NewRule, rule_header(), NLM_F_CREATE).with_max_len(40);
        request.add_rule_attr(RuleAttribute::Priority(1)).unwrap();
        let err = request
            .add_rule_attr(RuleAttribute::UidRange(RuleUidRange { start: 0, end: 0 }))
            .unwrap_err();

        assert_eq!(err, NetlinkError::BufferOverflow { needed: 48, max: 40 });
        assert_eq!(request.encoded_len(), 36);
        assert_eq!(request.rule_message().unwrap().attributes.len(), 1);
    }

    #[test]
    fn test_attribute_kind_mismatch() {
        let mut request =
            NetlinkRequest::route(RtmAction::NewRoute, RouteMessage::default().header, 0);
        assert!(request.add_rule_attr(RuleAttribute::Priority(1)).is_err());
        assert!(request.add_route_attr(RouteAttribute::Table(80)).is_ok());
        assert!(request.rule_message().is_none());
    }

    #[test]
    fn test_truncate_ifname() {
        assert_eq!(truncate_ifname("wlan0"), "wlan0");
        assert_eq!(truncate_ifname("multitun-vpn1234567"), "multitun-vpn123");
        assert_eq!(truncate_ifname("multitun-vpn1234567").len(), IFNAMSIZ - 1);
    }
}
