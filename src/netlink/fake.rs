//! In-memory transport that behaves like a small kernel rule/route store

use std::sync::Mutex;

use async_trait::async_trait;
use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE};
use rtnetlink::packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::packet_route::rule::{RuleAttribute, RuleMessage};

use crate::error::NetlinkError;
use crate::netlink::{
    route_destination, route_table_id, IpFamily, NetlinkRequest, NetlinkTransport, RtmAction,
};

const EEXIST: i32 = -17;
const ENOENT: i32 = -2;
const ESRCH: i32 = -3;

/// A request as the fake saw it
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub action: RtmAction,
    pub flags: u16,
    pub rule: Option<RuleMessage>,
    pub route: Option<RouteMessage>,
}

impl SentRequest {
    pub fn rule_attrs(&self) -> &[RuleAttribute] {
        self.rule.as_ref().map(|r| r.attributes.as_slice()).unwrap_or(&[])
    }

    pub fn route_attrs(&self) -> &[RouteAttribute] {
        self.route.as_ref().map(|r| r.attributes.as_slice()).unwrap_or(&[])
    }

    pub fn priority(&self) -> Option<u32> {
        self.rule.as_ref().map(crate::netlink::rule_priority)
    }

    pub fn has_rule_attr(&self, attr: &RuleAttribute) -> bool {
        self.rule_attrs().contains(attr)
    }

    pub fn family(&self) -> Option<IpFamily> {
        let family = match (&self.rule, &self.route) {
            (Some(rule), _) => rule.header.family,
            (_, Some(route)) => route.header.address_family,
            _ => return None,
        };
        IpFamily::BOTH
            .into_iter()
            .find(|candidate| candidate.address_family() == family)
    }
}

type FailureHook = Box<dyn Fn(&SentRequest) -> Option<i32> + Send + Sync>;

#[derive(Default)]
struct FakeState {
    rules: Vec<RuleMessage>,
    routes: Vec<RouteMessage>,
    sent: Vec<SentRequest>,
}

/// Recording transport for tests
#[derive(Default)]
pub struct FakeNetlink {
    state: Mutex<FakeState>,
    failure: Mutex<Option<FailureHook>>,
}

impl FakeNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every request the hook returns an errno for
    pub fn fail_when<F>(&self, hook: F)
    where
        F: Fn(&SentRequest) -> Option<i32> + Send + Sync + 'static,
    {
        *self.failure.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn clear_failures(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub fn reset_sent(&self) {
        self.state.lock().unwrap().sent.clear();
    }

    pub fn rules(&self) -> Vec<RuleMessage> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn routes(&self) -> Vec<RouteMessage> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn seed_rule(&self, rule: RuleMessage) {
        self.state.lock().unwrap().rules.push(rule);
    }

    pub fn seed_route(&self, route: RouteMessage) {
        self.state.lock().unwrap().routes.push(route);
    }
}

fn rule_matches(installed: &RuleMessage, wanted: &RuleMessage) -> bool {
    installed.header.family == wanted.header.family
        && (wanted.header.dst_len == 0 || installed.header.dst_len == wanted.header.dst_len)
        && (wanted.header.src_len == 0 || installed.header.src_len == wanted.header.src_len)
        && wanted
            .attributes
            .iter()
            .all(|attr| installed.attributes.contains(attr))
}

fn same_route(a: &RouteMessage, b: &RouteMessage) -> bool {
    a.header.address_family == b.header.address_family
        && a.header.destination_prefix_length == b.header.destination_prefix_length
        && route_table_id(a) == route_table_id(b)
        && route_destination(a) == route_destination(b)
}

#[async_trait]
impl NetlinkTransport for FakeNetlink {
    async fn send(&self, request: NetlinkRequest) -> Result<(), NetlinkError> {
        let sent = SentRequest {
            action: request.action(),
            flags: request.flags(),
            rule: request.rule_message().cloned(),
            route: request.route_message().cloned(),
        };

        let mut state = self.state.lock().unwrap();
        state.sent.push(sent.clone());

        if let Some(hook) = self.failure.lock().unwrap().as_ref() {
            if let Some(code) = hook(&sent) {
                return Err(NetlinkError::Kernel { code });
            }
        }

        match sent.action {
            RtmAction::NewRule => {
                let rule = sent.rule.unwrap_or_default();
                let duplicate = state
                    .rules
                    .iter()
                    .any(|r| r.header.family == rule.header.family && r.attributes == rule.attributes);
                if duplicate && sent.flags & NLM_F_EXCL != 0 {
                    return Err(NetlinkError::Kernel { code: EEXIST });
                }
                state.rules.push(rule);
            }
            RtmAction::DelRule => {
                let wanted = sent.rule.unwrap_or_default();
                let Some(index) = state.rules.iter().position(|r| rule_matches(r, &wanted)) else {
                    return Err(NetlinkError::Kernel { code: ENOENT });
                };
                state.rules.remove(index);
            }
            RtmAction::NewRoute => {
                let route = sent.route.unwrap_or_default();
                match state.routes.iter().position(|r| same_route(r, &route)) {
                    Some(index) if sent.flags & NLM_F_REPLACE != 0 => state.routes[index] = route,
                    Some(_) if sent.flags & NLM_F_EXCL != 0 => {
                        return Err(NetlinkError::Kernel { code: EEXIST })
                    }
                    Some(_) => state.routes.push(route),
                    None if sent.flags & NLM_F_CREATE == 0 => {
                        return Err(NetlinkError::Kernel { code: ENOENT })
                    }
                    None => state.routes.push(route),
                }
            }
            RtmAction::DelRoute => {
                let route = sent.route.unwrap_or_default();
                let Some(index) = state.routes.iter().position(|r| same_route(r, &route)) else {
                    return Err(NetlinkError::Kernel { code: ESRCH });
                };
                state.routes.remove(index);
            }
        }
        Ok(())
    }

    async fn dump_rules(&self, family: IpFamily) -> Result<Vec<RuleMessage>, NetlinkError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rules
            .iter()
            .filter(|r| r.header.family == family.address_family())
            .cloned()
            .collect())
    }

    async fn dump_routes(&self, family: IpFamily) -> Result<Vec<RouteMessage>, NetlinkError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .routes
            .iter()
            .filter(|r| r.header.address_family == family.address_family())
            .cloned()
            .collect())
    }
}
