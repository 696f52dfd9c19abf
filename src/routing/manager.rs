//! Route manager core: kernel plumbing shared by every network class

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE};
use tracing::{debug, error, info, warn};

use crate::config::RoutingPolicyConfig;
use crate::error::RouteError;
use crate::netlink::{
    rule_priority, route_table_id, IpFamily, NetlinkRequest, NetlinkTransport, RtmAction,
};
use crate::network::iptables::{
    jump_check_command, jump_command, new_chain_command, LOCAL_MANGLE_INPUT,
};
use crate::network::{
    CommandIptablesRunner, DistributedInterfaceManager, InterfaceResolver,
    IpCommandDistributedManager, IptablesRunner,
};
use crate::routing::rules::{
    anonymize_address, build_route_request, build_rule_request, rule_flags,
    validate_rule,
};
use crate::routing::{
    NetworkRouteInfo, RouteAddOutcome, RouteInfo, RouteRegistry, RuleBand, RuleInfo, TableType,
    UidRange, NETID_UNSET, ROUTE_INTERNAL_DEFAULT_TABLE,
};

/// Rules at or above this priority belong to the kernel's main and default tables
const KERNEL_DEFAULT_RULE_PRIORITY: u32 = 32766;

/// VPN bookkeeping that outlives a single call
#[derive(Debug, Clone)]
pub(super) struct VpnState {
    /// Interface of the current default network, target of VPN penetration rules
    pub(super) default_network: String,
    /// System VPN mode; extended VPNs take per-instance slots when it is off
    pub(super) sys_call_mode: bool,
}

impl Default for VpnState {
    fn default() -> Self {
        Self {
            default_network: String::new(),
            sys_call_mode: true,
        }
    }
}

/// Programs kernel fib rules and routing tables for logical networks
///
/// Every operation awaits each kernel acknowledgement before issuing the next
/// request. Operations for different networks may run concurrently; they
/// only serialize on the table registry lookup.
pub struct RouteManager {
    pub(super) netlink: Arc<dyn NetlinkTransport>,
    pub(super) iptables: Arc<dyn IptablesRunner>,
    pub(super) distributed: Arc<dyn DistributedInterfaceManager>,
    pub(super) registry: RouteRegistry,
    pub(super) config: RoutingPolicyConfig,
    vpn_state: Mutex<VpnState>,
}

impl RouteManager {
    /// Create a manager using the command-line tools named in `config`
    pub fn new(
        netlink: Arc<dyn NetlinkTransport>,
        resolver: Arc<dyn InterfaceResolver>,
        config: RoutingPolicyConfig,
    ) -> Self {
        let iptables = Arc::new(CommandIptablesRunner::new(
            &config.iptables_path,
            &config.ip6tables_path,
        ));
        let distributed = Arc::new(IpCommandDistributedManager::new(&config.ip_path));
        Self {
            netlink,
            iptables,
            distributed,
            registry: RouteRegistry::new(resolver),
            config,
            vpn_state: Mutex::new(VpnState::default()),
        }
    }

    pub fn with_iptables(mut self, iptables: Arc<dyn IptablesRunner>) -> Self {
        self.iptables = iptables;
        self
    }

    pub fn with_distributed(mut self, distributed: Arc<dyn DistributedInterfaceManager>) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn config(&self) -> &RoutingPolicyConfig {
        &self.config
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    pub(super) fn vpn_state(&self) -> MutexGuard<'_, VpnState> {
        self.vpn_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the kernel to a known baseline
    ///
    /// Removes every rule left behind by a previous run. The baseline local
    /// network rules are installed unless the init marker directory already
    /// exists.
    pub async fn init(&self) -> Result<(), RouteError> {
        info!("initializing routing policy");
        self.clear_rules().await?;

        if Path::new(&self.config.route_init_dir).exists() {
            info!(
                "{} present, local network rules already installed",
                self.config.route_init_dir
            );
        } else {
            self.add_local_network_rules().await?;
        }

        if let Err(e) = self.ensure_mangle_chain("INPUT", LOCAL_MANGLE_INPUT).await {
            warn!("incoming packet mark chain setup failed: {}", e);
        }

        if self.config.supports_sys_vpn {
            if let Err(e) = self.init_outgoing_packet_mark().await {
                warn!("outgoing packet mark chain setup failed: {}", e);
            }
        }
        Ok(())
    }

    /// Create a mangle chain and jump into it from `from`
    ///
    /// The chain may survive a restart, so a failed create is not an error
    /// and the jump is only appended when the `-C` check misses.
    pub(super) async fn ensure_mangle_chain(
        &self,
        from: &str,
        chain: &str,
    ) -> Result<(), RouteError> {
        if let Err(e) = self.iptables.run(IpFamily::V4, &new_chain_command(chain)).await {
            debug!("{} not created: {}", chain, e);
        }
        if self
            .iptables
            .run(IpFamily::V4, &jump_check_command(from, chain))
            .await
            .is_ok()
        {
            debug!("{} already jumps to {}", from, chain);
            return Ok(());
        }
        self.iptables
            .run(IpFamily::V4, &jump_command(from, chain))
            .await
    }

    /// Delete every policy rule between the local and main table rules
    pub async fn clear_rules(&self) -> Result<(), RouteError> {
        for family in IpFamily::BOTH {
            let rules = self.netlink.dump_rules(family).await?;
            let mut cleared = 0usize;
            for rule in rules {
                let priority = rule_priority(&rule);
                if priority == 0 || priority >= KERNEL_DEFAULT_RULE_PRIORITY {
                    continue;
                }
                let request = NetlinkRequest::from_rule_message(RtmAction::DelRule, rule, 0)?;
                match self.netlink.send(request).await {
                    Ok(()) => cleared += 1,
                    Err(e) => warn!("failed to clear {} rule {}: {}", family.label(), priority, e),
                }
            }
            debug!("cleared {} {} rules", cleared, family.label());
        }
        Ok(())
    }

    /// Delete every route in an interface's table and forget the table
    pub async fn clear_routes(&self, interface_name: &str, net_id: u16) -> Result<(), RouteError> {
        let table = self.registry.find_table(interface_name, net_id)?;
        info!("clearing routes of {} in table {}", interface_name, table);
        self.clear_route_table(table).await?;
        if table > ROUTE_INTERNAL_DEFAULT_TABLE {
            self.registry.evict(interface_name);
        }
        Ok(())
    }

    /// Delete every route of both families in `table`
    pub async fn clear_route_table(&self, table: u32) -> Result<(), RouteError> {
        for family in IpFamily::BOTH {
            let routes = self.netlink.dump_routes(family).await?;
            for route in routes
                .into_iter()
                .filter(|route| route_table_id(route) == table)
            {
                let request = NetlinkRequest::from_route_message(RtmAction::DelRoute, route, 0)?;
                if let Err(e) = self.netlink.send(request).await {
                    let e = RouteError::from(e);
                    if !e.is_not_found() {
                        warn!("failed to clear {} route in table {}: {}", family.label(), table, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove the sharing rule keyed on an input interface, whatever its table
    pub async fn clear_sharing_rules(&self, input_interface: &str) -> Result<(), RouteError> {
        info!("clearing sharing rules of {}", input_interface);
        let rule = RuleInfo::new(0, RuleBand::Sharing.priority()).with_iif(input_interface);
        validate_rule(RtmAction::DelRule, &rule)?;
        for family in IpFamily::BOTH {
            match self.send_rule(RtmAction::DelRule, family, &rule, None).await {
                Err(e) if e.is_not_found() => {
                    debug!("no {} sharing rule for {}", family.label(), input_interface)
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// Validate a rule, then send it for IPv4 and IPv6
    ///
    /// Nothing is sent when validation fails. An IPv4 failure stops before
    /// the IPv6 request.
    pub async fn update_rule_info(
        &self,
        action: RtmAction,
        rule: &RuleInfo,
        uid_range: Option<UidRange>,
    ) -> Result<(), RouteError> {
        validate_rule(action, rule)?;
        for family in IpFamily::BOTH {
            self.send_rule(action, family, rule, uid_range).await?;
        }
        Ok(())
    }

    /// Send a single-address rule for the family of that address only
    pub async fn update_distributed_rule(
        &self,
        action: RtmAction,
        rule: &RuleInfo,
    ) -> Result<(), RouteError> {
        validate_rule(action, rule)?;
        let address = if rule.dst_ip.is_empty() {
            &rule.src_ip
        } else {
            &rule.dst_ip
        };
        let family = IpFamily::of_address(address);
        self.send_rule(action, family, rule, None).await
    }

    pub(super) async fn send_rule(
        &self,
        action: RtmAction,
        family: IpFamily,
        rule: &RuleInfo,
        uid_range: Option<UidRange>,
    ) -> Result<(), RouteError> {
        let flags = rule_flags(action, self.config.supports_sys_vpn);
        let request = build_rule_request(action, family, rule, uid_range, flags)?;
        debug!(
            "{:?} {} priority {} table {}",
            action,
            family.label(),
            rule.priority,
            rule.table
        );
        self.netlink.send(request).await.map_err(|e| {
            error!(
                "{:?} {} priority {} table {} rejected: {}",
                action,
                family.label(),
                rule.priority,
                rule.table,
                e
            );
            RouteError::from(e)
        })
    }

    /// Send a route whose table is already resolved
    pub async fn update_route_rule(
        &self,
        action: RtmAction,
        flags: u16,
        route: &RouteInfo,
    ) -> Result<(), RouteError> {
        let request = build_route_request(action, flags, route, self.registry.resolver())?;
        self.netlink.send(request).await.map_err(|e| {
            let e = RouteError::from(e);
            if !e.is_route_repeat() {
                error!(
                    "{:?} {} via {} table {} rejected: {}",
                    action,
                    anonymize_address(&route.destination),
                    anonymize_address(&route.next_hop),
                    route.table,
                    e
                );
            }
            e
        })
    }

    fn route_info(
        &self,
        table_type: TableType,
        route: &NetworkRouteInfo,
    ) -> Result<RouteInfo, RouteError> {
        let carrier = self.effective_carrier(&route.if_name);
        let table = self
            .registry
            .table_for_type(table_type, &route.if_name, &carrier)?;
        Ok(RouteInfo {
            table,
            interface_name: route.if_name.clone(),
            destination: route.destination.clone(),
            next_hop: route.next_hop.clone(),
            is_excluded_route: route.is_excluded_route,
        })
    }

    /// Add a route; a route the kernel already has is reported, not failed
    pub async fn add_route(
        &self,
        table_type: TableType,
        route: &NetworkRouteInfo,
    ) -> Result<RouteAddOutcome, RouteError> {
        info!(
            "add route {} via {} dev {} excluded {}",
            anonymize_address(&route.destination),
            anonymize_address(&route.next_hop),
            route.if_name,
            route.is_excluded_route
        );
        let info = self.route_info(table_type, route)?;
        match self
            .update_route_rule(RtmAction::NewRoute, NLM_F_CREATE | NLM_F_EXCL, &info)
            .await
        {
            Ok(()) => Ok(RouteAddOutcome::Added),
            Err(e) if e.is_route_repeat() => {
                info!(
                    "route {} already present in table {}",
                    anonymize_address(&route.destination),
                    info.table
                );
                Ok(RouteAddOutcome::AlreadyExists)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove_route(
        &self,
        table_type: TableType,
        route: &NetworkRouteInfo,
    ) -> Result<(), RouteError> {
        info!(
            "remove route {} via {} dev {} excluded {}",
            anonymize_address(&route.destination),
            anonymize_address(&route.next_hop),
            route.if_name,
            route.is_excluded_route
        );
        let info = self.route_info(table_type, route)?;
        self.update_route_rule(RtmAction::DelRoute, NLM_F_EXCL, &info)
            .await
    }

    /// Install a route, replacing any route to the same destination
    pub async fn update_route(
        &self,
        table_type: TableType,
        route: &NetworkRouteInfo,
    ) -> Result<(), RouteError> {
        info!(
            "update route {} via {} dev {}",
            anonymize_address(&route.destination),
            anonymize_address(&route.next_hop),
            route.if_name
        );
        let info = self.route_info(table_type, route)?;
        self.update_route_rule(RtmAction::NewRoute, NLM_F_REPLACE, &info)
            .await
    }

    /// Table of an interface outside any VPN or internal network
    pub(super) fn interface_table(&self, interface_name: &str) -> Result<u32, RouteError> {
        self.registry.find_table(interface_name, NETID_UNSET)
    }
}
