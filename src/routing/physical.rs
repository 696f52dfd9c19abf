//! Rules for physical, local and sharing networks, plus the small helpers
//! that ride on interface tables (CLAT, VNIC, enterprise)

use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL};
use tracing::{error, info, warn};

use crate::error::RouteError;
use crate::netlink::{IpFamily, RtmAction};
use crate::network::iptables::incoming_mark_command;
use crate::routing::fwmark::FWMARK_NET_ID_MASK;
use crate::routing::rules::anonymize_address;
use crate::routing::{
    is_internal_net_id, Fwmark, NetworkPermission, NetworkRouteInfo, RouteInfo, RouteManager,
    RuleBand, RuleInfo, StepResults, TableType, UidRange, LOCAL_NET_ID, NETID_UNSET,
    ROUTE_LOCAL_NETWORK_TABLE, ROUTE_UNREACHABLE_TABLE, ROUTE_VNIC_TABLE, RULEIIF_LOOPBACK,
    UID_ALLOW_INTERNAL,
};

pub(super) fn rule_action(add: bool) -> RtmAction {
    if add {
        RtmAction::NewRule
    } else {
        RtmAction::DelRule
    }
}

/// Mark and mask matching sockets explicitly bound to `net_id`
pub(super) fn explicit_network_mark(net_id: u16, permission: NetworkPermission) -> (u32, u32) {
    let fwmark = Fwmark::new()
        .with_net_id(net_id)
        .with_explicitly_selected(true)
        .with_permission(permission);
    let mask = Fwmark::new()
        .with_net_id(FWMARK_NET_ID_MASK)
        .with_explicitly_selected(true)
        .with_permission(permission);
    (fwmark.int_value(), mask.int_value())
}

/// Mark and mask matching only the permission bits
pub(super) fn permission_mark(permission: NetworkPermission) -> (u32, u32) {
    let mark = Fwmark::new().with_permission(permission).int_value();
    (mark, mark)
}

impl RouteManager {
    /// Point unmarked traffic of the given permission at an interface's table
    pub async fn add_interface_to_default_network(
        &self,
        interface_name: &str,
        permission: NetworkPermission,
    ) -> Result<(), RouteError> {
        info!(
            "add {} to default network, permission {}",
            interface_name, permission
        );
        self.update_default_network(interface_name, permission, RtmAction::NewRule)
            .await?;
        self.vpn_state().default_network = interface_name.to_string();
        Ok(())
    }

    pub async fn remove_interface_from_default_network(
        &self,
        interface_name: &str,
        permission: NetworkPermission,
    ) -> Result<(), RouteError> {
        info!(
            "remove {} from default network, permission {}",
            interface_name, permission
        );
        self.update_default_network(interface_name, permission, RtmAction::DelRule)
            .await?;
        let mut state = self.vpn_state();
        if state.default_network == interface_name {
            state.default_network.clear();
        }
        Ok(())
    }

    async fn update_default_network(
        &self,
        interface_name: &str,
        permission: NetworkPermission,
        action: RtmAction,
    ) -> Result<(), RouteError> {
        let table = self.interface_table(interface_name)?;
        let fwmark = Fwmark::new()
            .with_net_id(NETID_UNSET)
            .with_permission(permission);
        let mask = Fwmark::new()
            .with_net_id(FWMARK_NET_ID_MASK)
            .with_permission(permission);
        let rule = RuleInfo::new(table, RuleBand::Default.priority())
            .with_mark(fwmark.int_value(), mask.int_value())
            .with_iif(RULEIIF_LOOPBACK);
        self.update_rule_info(action, &rule, None).await
    }

    pub async fn add_interface_to_physical_network(
        &self,
        net_id: u16,
        interface_name: &str,
        permission: NetworkPermission,
    ) -> Result<(), RouteError> {
        info!(
            "add {} to physical network {}, permission {}",
            interface_name, net_id, permission
        );
        self.update_physical_network(net_id, interface_name, permission, true)
            .await
    }

    /// Remove the network's rules, its routes, and any sharing still using it
    pub async fn remove_interface_from_physical_network(
        &self,
        net_id: u16,
        interface_name: &str,
        permission: NetworkPermission,
    ) -> Result<(), RouteError> {
        info!(
            "remove {} from physical network {}, permission {}",
            interface_name, net_id, permission
        );
        self.update_physical_network(net_id, interface_name, permission, false)
            .await?;
        self.clear_routes(interface_name, net_id).await?;
        if is_internal_net_id(net_id) {
            info!("network {} is internal, no sharing rules to clear", net_id);
            return Ok(());
        }
        self.clear_sharing_rules(interface_name).await
    }

    /// Install the rules for the new permission, then remove the old ones
    pub async fn modify_physical_network_permission(
        &self,
        net_id: u16,
        interface_name: &str,
        old_permission: NetworkPermission,
        new_permission: NetworkPermission,
    ) -> Result<(), RouteError> {
        info!(
            "network {} on {} permission {} -> {}",
            net_id, interface_name, old_permission, new_permission
        );
        self.update_physical_network(net_id, interface_name, new_permission, true)
            .await?;
        self.update_physical_network(net_id, interface_name, old_permission, false)
            .await
    }

    async fn update_physical_network(
        &self,
        net_id: u16,
        interface_name: &str,
        permission: NetworkPermission,
        add: bool,
    ) -> Result<(), RouteError> {
        let table = self.registry.find_table(interface_name, net_id)?;
        self.update_explicit_network_rule(net_id, table, permission, add)
            .await?;
        self.update_output_interface_rules(interface_name, table, permission, add)
            .await
    }

    async fn update_explicit_network_rule(
        &self,
        net_id: u16,
        table: u32,
        permission: NetworkPermission,
        add: bool,
    ) -> Result<(), RouteError> {
        let (fwmark, mask) = explicit_network_mark(net_id, permission);
        let rule = RuleInfo::new(table, RuleBand::ExplicitNetwork.priority())
            .with_mark(fwmark, mask)
            .with_iif(RULEIIF_LOOPBACK);
        // internal networks are reachable by a single system uid
        let uid_range = is_internal_net_id(net_id).then(|| UidRange::single(UID_ALLOW_INTERNAL));
        self.update_rule_info(rule_action(add), &rule, uid_range)
            .await
    }

    async fn update_output_interface_rules(
        &self,
        interface_name: &str,
        table: u32,
        permission: NetworkPermission,
        add: bool,
    ) -> Result<(), RouteError> {
        let (fwmark, mask) = permission_mark(permission);
        let rule = RuleInfo::new(table, RuleBand::OutputInterface.priority())
            .with_mark(fwmark, mask)
            .with_iif(RULEIIF_LOOPBACK)
            .with_oif(interface_name);
        self.update_rule_info(rule_action(add), &rule, None).await
    }

    /// Route sockets bound to an interface into the local table
    pub async fn add_interface_to_local_network(
        &self,
        net_id: u16,
        interface_name: &str,
    ) -> Result<(), RouteError> {
        info!("add {} to local network {}", interface_name, net_id);
        self.update_output_interface_rules(
            interface_name,
            ROUTE_LOCAL_NETWORK_TABLE,
            NetworkPermission::None,
            true,
        )
        .await?;
        self.registry
            .pin(interface_name, ROUTE_LOCAL_NETWORK_TABLE);
        Ok(())
    }

    pub async fn remove_interface_from_local_network(
        &self,
        net_id: u16,
        interface_name: &str,
    ) -> Result<(), RouteError> {
        info!("remove {} from local network {}", interface_name, net_id);
        self.update_output_interface_rules(
            interface_name,
            ROUTE_LOCAL_NETWORK_TABLE,
            NetworkPermission::None,
            false,
        )
        .await?;
        self.registry.evict(interface_name);
        Ok(())
    }

    /// Baseline rules sending local network traffic to the local table
    pub async fn add_local_network_rules(&self) -> Result<(), RouteError> {
        info!("adding local network rules");
        self.update_explicit_network_rule(
            LOCAL_NET_ID,
            ROUTE_LOCAL_NETWORK_TABLE,
            NetworkPermission::None,
            true,
        )
        .await?;

        let fwmark = Fwmark::new().with_explicitly_selected(false);
        let mask = Fwmark::new().with_explicitly_selected(true);
        let rule = RuleInfo::new(ROUTE_LOCAL_NETWORK_TABLE, RuleBand::LocalNetwork.priority())
            .with_mark(fwmark.int_value(), mask.int_value());
        self.update_rule_info(RtmAction::NewRule, &rule, None).await
    }

    /// Forward traffic arriving on `input_interface` through the uplink's table
    pub async fn enable_sharing(
        &self,
        input_interface: &str,
        output_interface: &str,
    ) -> Result<(), RouteError> {
        info!("enable sharing {} -> {}", input_interface, output_interface);
        self.update_sharing_network(RtmAction::NewRule, input_interface, output_interface)
            .await
    }

    pub async fn disable_sharing(
        &self,
        input_interface: &str,
        output_interface: &str,
    ) -> Result<(), RouteError> {
        info!("disable sharing {} -> {}", input_interface, output_interface);
        self.update_sharing_network(RtmAction::DelRule, input_interface, output_interface)
            .await
    }

    async fn update_sharing_network(
        &self,
        action: RtmAction,
        input_interface: &str,
        output_interface: &str,
    ) -> Result<(), RouteError> {
        let table = self.interface_table(output_interface)?;
        let rule = RuleInfo::new(table, RuleBand::Sharing.priority()).with_iif(input_interface);
        self.update_rule_info(action, &rule, None).await
    }

    /// Block one address in both directions of a sharing interface
    ///
    /// The two directions are installed independently; the call only fails
    /// when neither could be installed.
    pub async fn set_sharing_unreachable_ip_rule(
        &self,
        action: RtmAction,
        interface_name: &str,
        ip: &str,
    ) -> Result<(), RouteError> {
        info!(
            "{:?} unreachable rules for {} on {}",
            action,
            anonymize_address(ip),
            interface_name
        );
        let priority = RuleBand::UnreachableNetwork.priority();
        let inbound = RuleInfo::new(ROUTE_UNREACHABLE_TABLE, priority)
            .with_iif(interface_name)
            .with_src(ip);
        let outbound = RuleInfo::new(ROUTE_UNREACHABLE_TABLE, priority)
            .with_oif(interface_name)
            .with_dst(ip);

        let inbound_result = self.update_distributed_rule(action, &inbound).await;
        let outbound_result = self.update_distributed_rule(action, &outbound).await;
        match (inbound_result, outbound_result) {
            (Err(inbound), Err(outbound)) => {
                error!(
                    "unreachable rules for {} failed: {}, {}",
                    anonymize_address(ip),
                    inbound,
                    outbound
                );
                Err(inbound)
            }
            (Err(e), Ok(())) | (Ok(()), Err(e)) => {
                warn!(
                    "only one direction blocked for {}: {}",
                    anonymize_address(ip),
                    e
                );
                Ok(())
            }
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Mark inbound packets of an interface with its network
    pub async fn update_incoming_packet_mark(
        &self,
        net_id: u16,
        interface_name: &str,
        permission: NetworkPermission,
        add: bool,
    ) -> Result<(), RouteError> {
        info!(
            "incoming packet mark for {} on {}, add {}",
            net_id, interface_name, add
        );
        let fwmark = Fwmark::new()
            .with_net_id(net_id)
            .with_explicitly_selected(true)
            .with_protected_from_vpn(true)
            .with_permission(permission);
        let mask = !Fwmark::from(Fwmark::uid_billing_mask());
        let command =
            incoming_mark_command(interface_name, fwmark.int_value(), mask.int_value(), add);
        self.iptables.run(IpFamily::V4, &command).await
    }

    /// Install the CLAT route, then the rule sending loopback traffic to it
    pub async fn add_clat_tun_interface(
        &self,
        interface_name: &str,
        dst_addr: &str,
        next_hop: &str,
    ) -> Result<(), RouteError> {
        info!(
            "add clat {} dst {} via {}",
            interface_name,
            anonymize_address(dst_addr),
            anonymize_address(next_hop)
        );
        let route = NetworkRouteInfo::new(interface_name, dst_addr, next_hop);
        if self.add_route(TableType::Interface, &route).await?.is_repeat() {
            return Err(RouteError::RouteExists(anonymize_address(dst_addr)));
        }
        self.update_clat_tun_interface(interface_name, true).await
    }

    pub async fn remove_clat_tun_interface(&self, interface_name: &str) -> Result<(), RouteError> {
        info!("remove clat {}", interface_name);
        self.update_clat_tun_interface(interface_name, false).await?;
        self.clear_routes(interface_name, NETID_UNSET).await?;
        self.clear_sharing_rules(interface_name).await
    }

    async fn update_clat_tun_interface(
        &self,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let table = self.interface_table(interface_name)?;
        let (fwmark, mask) = permission_mark(NetworkPermission::None);
        let rule = RuleInfo::new(table, RuleBand::ClatTun.priority())
            .with_mark(fwmark, mask)
            .with_iif(RULEIIF_LOOPBACK);
        self.update_rule_info(rule_action(add), &rule, None).await
    }

    /// Add or delete a route in the VNIC table
    pub async fn update_vnic_route(
        &self,
        interface_name: &str,
        destination: &str,
        next_hop: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        info!(
            "vnic route {} via {} dev {}, add {}",
            anonymize_address(destination),
            anonymize_address(next_hop),
            interface_name,
            add
        );
        let route = RouteInfo::new(ROUTE_VNIC_TABLE, interface_name, destination, next_hop);
        let (action, flags) = if add {
            (RtmAction::NewRoute, NLM_F_CREATE | NLM_F_EXCL)
        } else {
            (RtmAction::DelRoute, NLM_F_EXCL)
        };
        self.update_route_rule(action, flags, &route).await
    }

    /// One loopback rule into the VNIC table per uid range
    pub async fn update_vnic_uid_ranges_rule(
        &self,
        uid_ranges: &[UidRange],
        add: bool,
    ) -> StepResults {
        info!("vnic uid rules for {} ranges, add {}", uid_ranges.len(), add);
        let rule = RuleInfo::new(ROUTE_VNIC_TABLE, RuleBand::VnicNetwork.priority())
            .with_iif(RULEIIF_LOOPBACK);
        let mut steps = StepResults::new();
        for range in uid_ranges {
            steps.push(
                "vnic uid rule",
                self.update_rule_info(rule_action(add), &rule, Some(*range))
                    .await,
            );
        }
        steps
    }

    /// Send one uid, or everything when `uid` is 0, to an enterprise interface
    pub async fn update_enterprise_route(
        &self,
        interface_name: &str,
        uid: u32,
        add: bool,
    ) -> Result<(), RouteError> {
        if !self.config.enterprise_route_custom {
            return Err(RouteError::FeatureDisabled("enterprise route"));
        }
        info!(
            "enterprise route on {} for uid {}, add {}",
            interface_name, uid, add
        );
        let table = self.interface_table(interface_name)?;
        let rule = RuleInfo::new(table, RuleBand::Enterprise.priority());
        let uid_range = (uid != 0).then(|| UidRange::single(uid));
        self.update_rule_info(rule_action(add), &rule, uid_range)
            .await
    }
}
