//! Cross-device distributed networking
//!
//! The client side tunnels traffic to a paired device through the `virnic`
//! TUN device. The server side forwards between the pairing interface and
//! its own uplink using the two distributed tables.

use std::net::Ipv4Addr;

use rtnetlink::packet_core::{NLM_F_CREATE, NLM_F_EXCL, NLM_F_REPLACE};
use tracing::{error, info, warn};

use crate::error::RouteError;
use crate::netlink::RtmAction;
use crate::routing::rules::anonymize_address;
use crate::routing::{
    RouteInfo, RouteManager, RuleBand, RuleInfo, StepResults, NETID_UNSET,
    ROUTE_DISTRIBUTE_FROM_CLIENT_TABLE, ROUTE_DISTRIBUTE_TO_CLIENT_TABLE,
};

pub const DISTRIBUTED_TUN_CARD_NAME: &str = "virnic";
pub const DISTRIBUTED_TUN_CARD_NAME_VETH: &str = "virnic-veth";

const DEFAULT_DESTINATION: &str = "0.0.0.0/0";
const ANY_ADDRESS: &str = "0.0.0.0";

/// Gateway of the virnic /24: the same network with host part 1
fn virnic_gateway(virnic_addr: &str) -> Result<String, RouteError> {
    let addr: Ipv4Addr = virnic_addr
        .parse()
        .map_err(|_| RouteError::InvalidAddress(virnic_addr.to_string()))?;
    let [a, b, c, _] = addr.octets();
    Ok(Ipv4Addr::new(a, b, c, 1).to_string())
}

impl RouteManager {
    /// Route local traffic arriving on `iif` through a paired device
    pub async fn enable_distributed_client_net(
        &self,
        virnic_addr: &str,
        iif: &str,
    ) -> Result<(), RouteError> {
        info!(
            "enable distributed client, virnic {} iif {}",
            anonymize_address(virnic_addr),
            iif
        );
        let gateway = virnic_gateway(virnic_addr)?;

        self.distributed
            .config_virnic_and_veth(
                virnic_addr,
                DISTRIBUTED_TUN_CARD_NAME,
                DISTRIBUTED_TUN_CARD_NAME_VETH,
            )
            .await
            .inspect_err(|e| error!("virnic setup failed: {}", e))?;

        let rule = RuleInfo::new(
            ROUTE_DISTRIBUTE_TO_CLIENT_TABLE,
            RuleBand::DistributeClient.priority(),
        )
        .with_iif(iif);
        self.update_distributed_rule(RtmAction::NewRule, &rule)
            .await?;

        let table = self
            .registry
            .find_table(DISTRIBUTED_TUN_CARD_NAME, NETID_UNSET)?;
        let route = RouteInfo::new(table, DISTRIBUTED_TUN_CARD_NAME, DEFAULT_DESTINATION, &gateway);
        self.update_route_rule(RtmAction::NewRoute, NLM_F_CREATE | NLM_F_EXCL, &route)
            .await?;

        let session = RuleInfo::new(table, RuleBand::DistributeClientSession.priority())
            .with_dst(&gateway);
        self.update_distributed_rule(RtmAction::NewRule, &session)
            .await?;
        info!("distributed client enabled, table {}", table);
        Ok(())
    }

    /// Forward traffic between a paired client on `iif` and `dev_iface`
    ///
    /// The uplink sends client traffic out of `dev_iface` via `gw`; the
    /// downlink returns traffic for `dst_addr` to `iif`.
    pub async fn enable_distributed_server_net(
        &self,
        iif: &str,
        dev_iface: &str,
        dst_addr: &str,
        gw: &str,
    ) -> StepResults {
        info!(
            "enable distributed server, iif {} dev {} dst {} gw {}",
            iif,
            dev_iface,
            anonymize_address(dst_addr),
            anonymize_address(gw)
        );
        self.distributed.set_server_nic_info(iif, dev_iface);

        let mut steps = StepResults::new();
        let next_hop = if gw.is_empty() { ANY_ADDRESS } else { gw };
        let uplink_rule = RuleInfo::new(
            ROUTE_DISTRIBUTE_FROM_CLIENT_TABLE,
            RuleBand::DistributeServer.priority(),
        )
        .with_iif(iif);
        let uplink_route = RouteInfo::new(
            ROUTE_DISTRIBUTE_FROM_CLIENT_TABLE,
            dev_iface,
            DEFAULT_DESTINATION,
            next_hop,
        );
        steps.push(
            "server uplink",
            self.add_server_route(&uplink_rule, &uplink_route).await,
        );

        let downlink_rule = RuleInfo::new(
            ROUTE_DISTRIBUTE_TO_CLIENT_TABLE,
            RuleBand::DistributeServer.priority(),
        )
        .with_dst(dst_addr);
        let downlink_route = RouteInfo::new(
            ROUTE_DISTRIBUTE_TO_CLIENT_TABLE,
            iif,
            DEFAULT_DESTINATION,
            ANY_ADDRESS,
        );
        steps.push(
            "server downlink",
            self.add_server_route(&downlink_rule, &downlink_route).await,
        );
        steps
    }

    /// Install a rule and its default route, replacing an existing route
    ///
    /// The rule is withdrawn again when the route cannot be installed.
    async fn add_server_route(&self, rule: &RuleInfo, route: &RouteInfo) -> Result<(), RouteError> {
        self.update_distributed_rule(RtmAction::NewRule, rule)
            .await?;

        if let Err(e) = self
            .update_route_rule(RtmAction::NewRoute, NLM_F_CREATE | NLM_F_EXCL, route)
            .await
        {
            warn!(
                "create route in table {} failed ({}), replacing",
                route.table, e
            );
            if let Err(e) = self
                .update_route_rule(RtmAction::NewRoute, NLM_F_REPLACE, route)
                .await
            {
                if let Err(rollback) = self.update_distributed_rule(RtmAction::DelRule, rule).await {
                    warn!(
                        "rollback of rule {} failed: {}",
                        rule.priority, rollback
                    );
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Tear down either side of a distributed session
    pub async fn disable_distributed_net(&self, is_server: bool) -> StepResults {
        info!("disable distributed net, server {}", is_server);
        let mut steps = StepResults::new();

        if is_server {
            let rule = RuleInfo::new(0, RuleBand::DistributeServer.priority());
            steps.push(
                "server uplink rule",
                self.update_distributed_rule(RtmAction::DelRule, &rule)
                    .await,
            );
            steps.push(
                "server downlink rule",
                self.update_distributed_rule(RtmAction::DelRule, &rule)
                    .await,
            );

            let uplink = RouteInfo::new(
                ROUTE_DISTRIBUTE_FROM_CLIENT_TABLE,
                &self.distributed.server_dev_iface_nic(),
                DEFAULT_DESTINATION,
                ANY_ADDRESS,
            );
            steps.push(
                "server uplink route",
                self.update_route_rule(RtmAction::DelRoute, NLM_F_EXCL, &uplink)
                    .await,
            );
            let downlink = RouteInfo::new(
                ROUTE_DISTRIBUTE_TO_CLIENT_TABLE,
                &self.distributed.server_iif_nic(),
                DEFAULT_DESTINATION,
                ANY_ADDRESS,
            );
            steps.push(
                "server downlink route",
                self.update_route_rule(RtmAction::DelRoute, NLM_F_EXCL, &downlink)
                    .await,
            );
        } else {
            let rule = RuleInfo::new(0, RuleBand::DistributeClient.priority());
            steps.push(
                "client rule",
                self.update_distributed_rule(RtmAction::DelRule, &rule)
                    .await,
            );
            let session = RuleInfo::new(0, RuleBand::DistributeClientSession.priority());
            steps.push(
                "client session rule",
                self.update_distributed_rule(RtmAction::DelRule, &session)
                    .await,
            );
            steps.push(
                "virnic",
                self.distributed
                    .disable_virnic(DISTRIBUTED_TUN_CARD_NAME)
                    .await,
            );
        }

        for (label, e) in steps.failures() {
            error!("disable distributed {} failed: {}", label, e);
        }
        steps
    }
}
