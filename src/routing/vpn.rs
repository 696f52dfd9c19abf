//! VPN rule bundles
//!
//! A VPN owns a routing table and three always-present rules: loopback
//! traffic to the local table, system-permission sockets into the VPN, and
//! root into the VPN. Apps join per uid range.
//!
//! With system VPN support enabled, extended (non-system) VPNs each get their
//! own table and priority slot derived from the interface's carrier instance,
//! and their sockets are marked through iptables instead of by the socket
//! layer.

use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::error::RouteError;
use crate::netlink::IpFamily;
use crate::network::iptables::{
    outgoing_ip_mark_command, outgoing_uid_mark_command, LOCAL_MANGLE_OUTPUT,
};
use crate::routing::fwmark::FWMARK_NET_ID_MASK;
use crate::routing::physical::{explicit_network_mark, permission_mark, rule_action};
use crate::routing::rules::anonymize_address;
use crate::routing::{
    Fwmark, NetworkPermission, RouteManager, RuleBand, RuleInfo, StepResults, TableType, UidRange,
    VpnCarrier, NETID_UNSET, ROUTE_LOCAL_NETWORK_TABLE, RULEIIF_LOOPBACK, UID_ROOT,
};

fn system_mark(net_id: u16) -> Fwmark {
    Fwmark::new()
        .with_net_id(net_id)
        .with_permission(NetworkPermission::System)
}

impl RouteManager {
    /// Switch between system VPN mode and extended VPN mode
    ///
    /// A message containing `0` selects extended VPNs.
    pub fn set_vpn_call_mode(&self, message: &str) -> Result<(), RouteError> {
        if !self.config.supports_sys_vpn {
            return Err(RouteError::FeatureDisabled("system vpn"));
        }
        let sys_call_mode = !message.contains('0');
        self.vpn_state().sys_call_mode = sys_call_mode;
        debug!("vpn system call mode {}", sys_call_mode);
        Ok(())
    }

    /// True for an extended VPN that takes its own table and priority slot
    pub fn is_multi_vpn(&self, interface_name: &str) -> bool {
        self.config.supports_sys_vpn
            && !interface_name.is_empty()
            && !VpnCarrier::from_interface_name(interface_name).is_tun()
            && !self.vpn_state().sys_call_mode
    }

    /// Carrier used for table and priority selection
    pub(super) fn effective_carrier(&self, interface_name: &str) -> VpnCarrier {
        if self.is_multi_vpn(interface_name) {
            VpnCarrier::from_interface_name(interface_name)
        } else {
            VpnCarrier::None
        }
    }

    fn vpn_priority(&self, band: RuleBand, interface_name: &str) -> i32 {
        band.vpn_priority(&self.effective_carrier(interface_name))
    }

    fn vpn_table(&self, interface_name: &str) -> Result<u32, RouteError> {
        self.registry.table_for_type(
            TableType::VpnNetwork,
            interface_name,
            &self.effective_carrier(interface_name),
        )
    }

    pub async fn add_interface_to_virtual_network(
        &self,
        net_id: u16,
        interface_name: &str,
    ) -> StepResults {
        info!("add {} to virtual network {}", interface_name, net_id);
        self.modify_virtual_net_based_rules(net_id, interface_name, true)
            .await
    }

    /// Remove the VPN's rules, then flush its table
    ///
    /// The table is only flushed when every rule removal succeeded.
    pub async fn remove_interface_from_virtual_network(
        &self,
        net_id: u16,
        interface_name: &str,
    ) -> StepResults {
        info!("remove {} from virtual network {}", interface_name, net_id);
        let mut steps = self
            .modify_virtual_net_based_rules(net_id, interface_name, false)
            .await;
        if !steps.is_success() {
            return steps;
        }
        match self.vpn_table(interface_name) {
            Ok(table) => {
                debug!("clearing vpn table {}", table);
                steps.push("vpn routes", self.clear_route_table(table).await);
            }
            Err(e) => steps.push("vpn table", Err(e)),
        }
        steps
    }

    async fn modify_virtual_net_based_rules(
        &self,
        net_id: u16,
        interface_name: &str,
        add: bool,
    ) -> StepResults {
        let mut steps = StepResults::new();
        let table = match self.vpn_table(interface_name) {
            Ok(table) => table,
            Err(e) => {
                steps.push("vpn table", Err(e));
                return steps;
            }
        };

        steps.push(
            "vpn output to local rule",
            self.update_vpn_output_to_local_rule(interface_name, add)
                .await,
        );
        steps.push(
            "vpn system permission rule",
            self.update_vpn_system_permission_rule(net_id, table, interface_name, add)
                .await,
        );
        steps.push(
            "vpn root explicit rule",
            self.update_explicit_network_rule_with_uid(
                net_id,
                table,
                UidRange::single(UID_ROOT),
                interface_name,
                add,
            )
            .await,
        );
        steps
    }

    async fn update_vpn_output_to_local_rule(
        &self,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let mut rule = RuleInfo::new(
            ROUTE_LOCAL_NETWORK_TABLE,
            self.vpn_priority(RuleBand::VpnOutputToLocal, interface_name),
        );
        if !interface_name.contains("vpn") {
            rule = rule.with_iif(interface_name);
        }
        self.update_rule_info(rule_action(add), &rule, None).await
    }

    async fn update_vpn_system_permission_rule(
        &self,
        net_id: u16,
        table: u32,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let mut rule = RuleInfo::new(
            table,
            self.vpn_priority(RuleBand::SecureVpn, interface_name),
        );
        // system-mode vpns are steered by the socket layer, so their rule
        // matches every packet at this band
        let marked = !self.config.supports_sys_vpn
            || self.is_multi_vpn(interface_name)
            || VpnCarrier::from_interface_name(interface_name).is_tun();
        if marked {
            let mask = Fwmark::new()
                .with_net_id(FWMARK_NET_ID_MASK)
                .with_permission(NetworkPermission::System);
            rule = rule.with_mark(system_mark(net_id).int_value(), mask.int_value());
        }
        self.update_rule_info(rule_action(add), &rule, None).await
    }

    async fn update_explicit_network_rule_with_uid(
        &self,
        net_id: u16,
        table: u32,
        uid_range: UidRange,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let (fwmark, mask) = explicit_network_mark(net_id, NetworkPermission::None);
        let rule = RuleInfo::new(
            table,
            self.vpn_priority(RuleBand::ExplicitNetwork, interface_name),
        )
        .with_mark(fwmark, mask)
        .with_iif(RULEIIF_LOOPBACK);
        self.update_rule_info(rule_action(add), &rule, Some(uid_range))
            .await
    }

    pub async fn add_users_to_virtual_network(
        &self,
        net_id: u16,
        interface_name: &str,
        uid_ranges: &[UidRange],
    ) -> StepResults {
        info!(
            "add {} uid ranges to virtual network {} on {}",
            uid_ranges.len(),
            net_id,
            interface_name
        );
        self.update_virtual_network(net_id, interface_name, uid_ranges, true)
            .await
    }

    pub async fn remove_users_from_virtual_network(
        &self,
        net_id: u16,
        interface_name: &str,
        uid_ranges: &[UidRange],
    ) -> StepResults {
        info!(
            "remove {} uid ranges from virtual network {} on {}",
            uid_ranges.len(),
            net_id,
            interface_name
        );
        self.update_virtual_network(net_id, interface_name, uid_ranges, false)
            .await
    }

    async fn update_virtual_network(
        &self,
        net_id: u16,
        interface_name: &str,
        uid_ranges: &[UidRange],
        add: bool,
    ) -> StepResults {
        let mut steps = StepResults::new();
        let table = match self.vpn_table(interface_name) {
            Ok(table) => table,
            Err(e) => {
                steps.push("vpn table", Err(e));
                return steps;
            }
        };
        let multi = self.is_multi_vpn(interface_name);

        for range in uid_ranges {
            steps.push(
                "vpn uid range rule",
                self.update_vpn_uid_range_rule(table, *range, interface_name, add)
                    .await,
            );
            steps.push(
                "vpn explicit rule",
                self.update_explicit_network_rule_with_uid(
                    net_id,
                    table,
                    *range,
                    interface_name,
                    add,
                )
                .await,
            );
            steps.push(
                "vpn output interface rule",
                self.update_output_interface_rules_with_uid(table, *range, interface_name, add)
                    .await,
            );
            if multi {
                steps.push(
                    "vpn uid mark",
                    self.update_outgoing_uid_mark(net_id, *range, add).await,
                );
            }
        }
        steps
    }

    async fn update_vpn_uid_range_rule(
        &self,
        table: u32,
        uid_range: UidRange,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        // sockets protected from the VPN keep their own routing
        let fwmark = Fwmark::new().with_protected_from_vpn(false);
        let mask = Fwmark::new().with_protected_from_vpn(true);
        let rule = RuleInfo::new(
            table,
            self.vpn_priority(RuleBand::SecureVpn, interface_name),
        )
        .with_mark(fwmark.int_value(), mask.int_value())
        .with_iif(RULEIIF_LOOPBACK);
        self.update_rule_info(rule_action(add), &rule, Some(uid_range))
            .await
    }

    async fn update_output_interface_rules_with_uid(
        &self,
        table: u32,
        uid_range: UidRange,
        interface_name: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let (fwmark, mask) = permission_mark(NetworkPermission::None);
        let rule = RuleInfo::new(
            table,
            self.vpn_priority(RuleBand::OutputIfaceVpn, interface_name),
        )
        .with_mark(fwmark, mask)
        .with_iif(RULEIIF_LOOPBACK)
        .with_oif(interface_name);
        self.update_rule_info(rule_action(add), &rule, Some(uid_range))
            .await
    }

    /// Apply the addresses assigned by a VPN
    ///
    /// In system VPN mode each address gets a penetration rule into the
    /// default network; extended VPNs mark packets sourced from it instead.
    /// TUN VPNs need neither.
    pub async fn update_vpn_rules(
        &self,
        net_id: u16,
        interface_name: &str,
        addresses: &[String],
        add: bool,
    ) -> Result<(), RouteError> {
        if !self.config.supports_sys_vpn {
            return Err(RouteError::FeatureDisabled("system vpn"));
        }
        if interface_name.is_empty() {
            return Err(RouteError::UnknownInterface {
                name: String::new(),
            });
        }
        info!(
            "update {} vpn rules on {}, add {}",
            addresses.len(),
            interface_name,
            add
        );
        let sys_call_mode = self.vpn_state().sys_call_mode;
        let carrier = VpnCarrier::from_interface_name(interface_name);

        for address in addresses {
            if address.parse::<Ipv4Addr>().is_err() {
                return Err(RouteError::InvalidAddress(address.clone()));
            }
            if carrier.is_tun() {
                debug!("{} is a tun vpn, nothing to update", interface_name);
                continue;
            }
            if sys_call_mode {
                self.update_vpn_output_penetration_rule(&carrier, address, add)
                    .await?;
            } else {
                self.update_outgoing_ip_mark(net_id, address, add).await?;
            }
        }
        Ok(())
    }

    async fn update_vpn_output_penetration_rule(
        &self,
        carrier: &VpnCarrier,
        address: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let default_network = self.vpn_state().default_network.clone();
        let table = self.registry.find_table(&default_network, NETID_UNSET)?;
        debug!(
            "penetration rule for {} via {}",
            anonymize_address(address),
            default_network
        );
        let rule = RuleInfo::new(table, RuleBand::VpnSecureTunnel.vpn_priority(carrier))
            .with_dst(address);
        self.update_distributed_rule(rule_action(add), &rule).await
    }

    async fn update_outgoing_ip_mark(
        &self,
        net_id: u16,
        address: &str,
        add: bool,
    ) -> Result<(), RouteError> {
        let command = outgoing_ip_mark_command(address, system_mark(net_id).int_value(), add);
        self.iptables.run(IpFamily::V4, &command).await
    }

    async fn update_outgoing_uid_mark(
        &self,
        net_id: u16,
        uid_range: UidRange,
        add: bool,
    ) -> Result<(), RouteError> {
        let command = outgoing_uid_mark_command(
            uid_range.begin,
            uid_range.end,
            system_mark(net_id).int_value(),
            add,
        );
        self.iptables.run(IpFamily::V4, &command).await
    }

    /// Create the mangle chain marking locally generated VPN packets
    pub async fn init_outgoing_packet_mark(&self) -> Result<(), RouteError> {
        info!("initializing outgoing packet mark");
        self.ensure_mangle_chain("OUTPUT", LOCAL_MANGLE_OUTPUT).await
    }
}
