//! Fib rule priority bands
//!
//! The kernel evaluates rules from the lowest priority value up and stops at
//! the first match, so the band order below is the classification policy:
//! the more specific a concern, the lower its band. VPN bands are shared by
//! system VPNs; extended VPN instances each take their own slot inside the
//! band, derived from the carrier's instance number.

use tracing::warn;

/// One priority band per routing concern, in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleBand {
    UnreachableNetwork,
    ClatTun,
    DistributeServer,
    VpnSecureTunnel,
    DistributeClientSession,
    VpnOutputToLocal,
    SecureVpn,
    VnicNetwork,
    ExplicitNetwork,
    OutputIfaceVpn,
    OutputInterface,
    LocalNetwork,
    Sharing,
    Enterprise,
    Default,
    DistributeClient,
}

impl RuleBand {
    /// Every band, first evaluated first
    pub const ORDERED: [RuleBand; 16] = [
        RuleBand::UnreachableNetwork,
        RuleBand::ClatTun,
        RuleBand::DistributeServer,
        RuleBand::VpnSecureTunnel,
        RuleBand::DistributeClientSession,
        RuleBand::VpnOutputToLocal,
        RuleBand::SecureVpn,
        RuleBand::VnicNetwork,
        RuleBand::ExplicitNetwork,
        RuleBand::OutputIfaceVpn,
        RuleBand::OutputInterface,
        RuleBand::LocalNetwork,
        RuleBand::Sharing,
        RuleBand::Enterprise,
        RuleBand::Default,
        RuleBand::DistributeClient,
    ];

    /// Shared priority of the band
    pub const fn priority(self) -> i32 {
        match self {
            RuleBand::UnreachableNetwork => 7000,
            RuleBand::ClatTun => 8000,
            RuleBand::DistributeServer => 8500,
            RuleBand::VpnSecureTunnel => 8600,
            RuleBand::DistributeClientSession => 8800,
            RuleBand::VpnOutputToLocal => 9000,
            RuleBand::SecureVpn => 10000,
            RuleBand::VnicNetwork => 10500,
            RuleBand::ExplicitNetwork => 11000,
            RuleBand::OutputIfaceVpn => 11500,
            RuleBand::OutputInterface => 12000,
            RuleBand::LocalNetwork => 13000,
            RuleBand::Sharing => 14000,
            RuleBand::Enterprise => 15000,
            RuleBand::Default => 16000,
            RuleBand::DistributeClient => 16500,
        }
    }

    /// Priority of the band for a VPN carrier
    ///
    /// Instances move toward the front of the band by their instance number;
    /// everything else shares the band's base priority.
    pub fn vpn_priority(self, carrier: &VpnCarrier) -> i32 {
        match carrier.instance() {
            Some(id) => self
                .priority()
                .saturating_sub(i32::try_from(id).unwrap_or(i32::MAX)),
            None => self.priority(),
        }
    }
}

/// Highest carrier instance with its own slot
///
/// Instances stay below the narrowest gap between a VPN band and the band
/// before it (8600 - 8500), and their tables stay below the interface tables.
pub const MAX_VPN_INSTANCE: u32 = 99;

const XFRM_CARD_NAME: &str = "xfrm-vpn";
const PPP_CARD_NAME: &str = "ppp-vpn";
const MULTI_TUN_CARD_NAME: &str = "multitun-vpn";
const INNER_CHL_NAME: &str = "inner-chl";
const TUN_CARD_NAME: &str = "vpn-tun";

/// Tunnel carrier of a VPN interface, with its instance number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpnCarrier {
    Xfrm(u32),
    Ppp(u32),
    MultiTun(u32),
    InnerChannel(u32),
    /// The app-provided TUN device
    Tun,
    None,
}

impl VpnCarrier {
    /// Classify an interface by its name
    ///
    /// A suffix that is not a number, or one above [`MAX_VPN_INSTANCE`],
    /// yields instance 0, which shares its slot with the first instance of
    /// every other carrier.
    pub fn from_interface_name(name: &str) -> Self {
        let prefixed: [(&str, fn(u32) -> VpnCarrier); 4] = [
            (XFRM_CARD_NAME, VpnCarrier::Xfrm),
            (PPP_CARD_NAME, VpnCarrier::Ppp),
            (MULTI_TUN_CARD_NAME, VpnCarrier::MultiTun),
            (INNER_CHL_NAME, VpnCarrier::InnerChannel),
        ];
        for (prefix, carrier) in prefixed {
            if let Some(suffix) = name.strip_prefix(prefix) {
                return carrier(parse_instance(name, suffix));
            }
        }
        if name.contains(TUN_CARD_NAME) {
            return VpnCarrier::Tun;
        }
        VpnCarrier::None
    }

    /// Instance number of a multi-instance carrier
    pub fn instance(&self) -> Option<u32> {
        match self {
            VpnCarrier::Xfrm(id)
            | VpnCarrier::Ppp(id)
            | VpnCarrier::MultiTun(id)
            | VpnCarrier::InnerChannel(id) => Some(*id),
            VpnCarrier::Tun | VpnCarrier::None => None,
        }
    }

    pub fn is_tun(&self) -> bool {
        matches!(self, VpnCarrier::Tun)
    }

    /// Routing table of this VPN, `None` for carriers on the shared table
    pub fn vpn_table(&self) -> Option<u32> {
        self.instance()
            .map(|id| super::DEFAULT_ROUTE_VPN_NETWORK_BASE_TABLE.saturating_add(id))
    }
}

fn parse_instance(name: &str, suffix: &str) -> u32 {
    match suffix.parse::<u32>() {
        Ok(id) if id <= MAX_VPN_INSTANCE => id,
        Ok(id) => {
            warn!(
                "vpn interface {} instance {} above {}, using 0",
                name, id, MAX_VPN_INSTANCE
            );
            0
        }
        Err(_) => {
            warn!("vpn interface {} has no numeric instance, using 0", name);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_order_is_strict() {
        for pair in RuleBand::ORDERED.windows(2) {
            assert!(
                pair[0].priority() < pair[1].priority(),
                "{:?} must be evaluated before {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_documented_band_pairs() {
        assert!(RuleBand::UnreachableNetwork.priority() < RuleBand::DistributeServer.priority());
        assert!(RuleBand::DistributeServer.priority() < RuleBand::VpnSecureTunnel.priority());
        assert!(RuleBand::VpnOutputToLocal.priority() < RuleBand::SecureVpn.priority());
        assert!(RuleBand::ExplicitNetwork.priority() < RuleBand::OutputInterface.priority());
        assert!(RuleBand::LocalNetwork.priority() < RuleBand::Sharing.priority());
        assert!(RuleBand::Sharing.priority() < RuleBand::Enterprise.priority());
        assert!(RuleBand::Default.priority() < RuleBand::DistributeClient.priority());
    }

    #[test]
    fn test_carrier_from_name() {
        assert_eq!(VpnCarrier::from_interface_name("xfrm-vpn3"), VpnCarrier::Xfrm(3));
        assert_eq!(VpnCarrier::from_interface_name("ppp-vpn12"), VpnCarrier::Ppp(12));
        assert_eq!(
            VpnCarrier::from_interface_name("multitun-vpn2"),
            VpnCarrier::MultiTun(2)
        );
        assert_eq!(
            VpnCarrier::from_interface_name("inner-chl4"),
            VpnCarrier::InnerChannel(4)
        );
        assert_eq!(VpnCarrier::from_interface_name("vpn-tun"), VpnCarrier::Tun);
        assert_eq!(VpnCarrier::from_interface_name("vpn-tun0"), VpnCarrier::Tun);
        assert_eq!(VpnCarrier::from_interface_name("wlan0"), VpnCarrier::None);
        assert_eq!(VpnCarrier::from_interface_name(""), VpnCarrier::None);
    }

    #[test]
    fn test_unparsable_instance_defaults_to_zero() {
        assert_eq!(VpnCarrier::from_interface_name("xfrm-vpn"), VpnCarrier::Xfrm(0));
        assert_eq!(VpnCarrier::from_interface_name("xfrm-vpnA"), VpnCarrier::Xfrm(0));
        assert_eq!(VpnCarrier::from_interface_name("ppp-vpn-1"), VpnCarrier::Ppp(0));
    }

    #[test]
    fn test_vpn_slots_are_distinct() {
        let three = VpnCarrier::from_interface_name("xfrm-vpn3");
        let seven = VpnCarrier::from_interface_name("xfrm-vpn7");

        for band in [
            RuleBand::VpnSecureTunnel,
            RuleBand::VpnOutputToLocal,
            RuleBand::SecureVpn,
            RuleBand::ExplicitNetwork,
            RuleBand::OutputIfaceVpn,
        ] {
            assert_ne!(band.vpn_priority(&three), band.vpn_priority(&seven));
        }
        assert!(
            RuleBand::VpnOutputToLocal.vpn_priority(&seven)
                < RuleBand::VpnOutputToLocal.vpn_priority(&three)
        );
        assert_eq!(RuleBand::VpnOutputToLocal.vpn_priority(&seven), 8993);
        assert_ne!(three.vpn_table(), seven.vpn_table());
        assert_eq!(seven.vpn_table(), Some(1007));
    }

    #[test]
    fn test_shared_slot_without_instance() {
        assert_eq!(RuleBand::SecureVpn.vpn_priority(&VpnCarrier::Tun), 10000);
        assert_eq!(RuleBand::SecureVpn.vpn_priority(&VpnCarrier::None), 10000);
        assert_eq!(VpnCarrier::Tun.vpn_table(), None);
    }

    #[test]
    fn test_instance_above_cap_is_rejected() {
        assert_eq!(VpnCarrier::from_interface_name("xfrm-vpn700"), VpnCarrier::Xfrm(0));
        assert_eq!(VpnCarrier::from_interface_name("ppp-vpn1003"), VpnCarrier::Ppp(0));

        let last = VpnCarrier::from_interface_name("xfrm-vpn99");
        assert_eq!(last, VpnCarrier::Xfrm(MAX_VPN_INSTANCE));
        assert!(last.vpn_table().unwrap() < crate::routing::ROUTE_TABLE_OFFSET_FROM_INDEX);

        // the last slot of every vpn band stays past the band before it
        for (previous, band) in RuleBand::ORDERED.iter().zip(RuleBand::ORDERED.iter().skip(1)) {
            if matches!(
                band,
                RuleBand::VpnSecureTunnel
                    | RuleBand::VpnOutputToLocal
                    | RuleBand::SecureVpn
                    | RuleBand::ExplicitNetwork
                    | RuleBand::OutputIfaceVpn
            ) {
                assert!(band.vpn_priority(&last) > previous.priority(), "{:?}", band);
            }
        }
    }
}
