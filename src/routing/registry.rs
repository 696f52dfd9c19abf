//! Interface to routing table registry

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error};

use crate::error::RouteError;
use crate::network::InterfaceResolver;
use crate::routing::{
    is_internal_net_id, TableType, VpnCarrier, ROUTE_INTERNAL_DEFAULT_TABLE,
    ROUTE_LOCAL_NETWORK_TABLE, ROUTE_TABLE_OFFSET_FROM_INDEX, ROUTE_UNREACHABLE_TABLE,
    ROUTE_VPN_NETWORK_TABLE,
};

/// Table numbers assigned to interfaces
///
/// Entries are created on first reference from the interface index, or
/// pinned explicitly for special network classes. The lock only covers map
/// access; no caller holds it across kernel I/O.
pub struct RouteRegistry {
    tables: Mutex<BTreeMap<String, u32>>,
    resolver: Arc<dyn InterfaceResolver>,
}

impl RouteRegistry {
    pub fn new(resolver: Arc<dyn InterfaceResolver>) -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            resolver,
        }
    }

    pub fn resolver(&self) -> &dyn InterfaceResolver {
        self.resolver.as_ref()
    }

    fn tables(&self) -> MutexGuard<'_, BTreeMap<String, u32>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Table of an interface, assigning one on first use
    ///
    /// Internal networks fold the table into the small internal pool.
    pub fn find_table(&self, name: &str, net_id: u16) -> Result<u32, RouteError> {
        let mut tables = self.tables();
        let table = match tables.get(name) {
            Some(table) => *table,
            None => {
                let Some(index) = self.resolver.index_of(name) else {
                    error!("cannot find interface {}", name);
                    return Err(RouteError::UnknownInterface {
                        name: name.to_string(),
                    });
                };
                let table = index.saturating_add(ROUTE_TABLE_OFFSET_FROM_INDEX);
                debug!("assigned table {} to {}", table, name);
                tables.insert(name.to_string(), table);
                table
            }
        };
        Ok(convert_table_by_net_id(net_id, table))
    }

    /// Table for a network class
    ///
    /// `carrier` only matters for VPN networks; pass [`VpnCarrier::None`]
    /// for VPNs that use the shared table.
    pub fn table_for_type(
        &self,
        table_type: TableType,
        name: &str,
        carrier: &VpnCarrier,
    ) -> Result<u32, RouteError> {
        match table_type {
            TableType::Interface => self.find_table(name, super::NETID_UNSET),
            TableType::LocalNetwork => Ok(ROUTE_LOCAL_NETWORK_TABLE),
            TableType::VpnNetwork => Ok(carrier.vpn_table().unwrap_or(ROUTE_VPN_NETWORK_TABLE)),
            TableType::InternalDefault => Ok(internal_default_table(
                self.find_table(name, super::NETID_UNSET)?,
            )),
            TableType::UnreachableNetwork => Ok(ROUTE_UNREACHABLE_TABLE),
        }
    }

    /// Current table of an interface without assigning one
    pub fn get(&self, name: &str) -> Option<u32> {
        self.tables().get(name).copied()
    }

    /// Bind an interface to a fixed table
    pub fn pin(&self, name: &str, table: u32) {
        self.tables().insert(name.to_string(), table);
    }

    pub fn evict(&self, name: &str) -> Option<u32> {
        self.tables().remove(name)
    }
}

fn internal_default_table(table: u32) -> u32 {
    table % ROUTE_INTERNAL_DEFAULT_TABLE + 1
}

fn convert_table_by_net_id(net_id: u16, table: u32) -> u32 {
    if is_internal_net_id(net_id) {
        internal_default_table(table)
    } else {
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::StaticInterfaceResolver;

    fn registry() -> RouteRegistry {
        let resolver = StaticInterfaceResolver::new()
            .with_interface("eth0", 3)
            .with_interface("wlan0", 17);
        RouteRegistry::new(Arc::new(resolver))
    }

    #[test]
    fn test_find_table_is_idempotent() {
        let registry = registry();
        let first = registry.find_table("wlan0", 0).unwrap();
        let second = registry.find_table("wlan0", 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, 17 + ROUTE_TABLE_OFFSET_FROM_INDEX);
        assert_eq!(registry.get("wlan0"), Some(2017));
    }

    #[test]
    fn test_unknown_interface() {
        let registry = registry();
        let err = registry.find_table("nonexistent-iface-xyz", 0).unwrap_err();
        assert_eq!(
            err,
            RouteError::UnknownInterface {
                name: "nonexistent-iface-xyz".to_string()
            }
        );
        assert_eq!(registry.get("nonexistent-iface-xyz"), None);
    }

    #[test]
    fn test_internal_net_id_folds_table() {
        let registry = registry();
        assert_eq!(registry.find_table("eth0", 10).unwrap(), 2003 % 10 + 1);
        // the registry keeps the unfolded table
        assert_eq!(registry.get("eth0"), Some(2003));
        assert_eq!(registry.find_table("eth0", 100).unwrap(), 2003);
    }

    #[test]
    fn test_table_for_type() {
        let registry = registry();
        let none = VpnCarrier::None;
        assert_eq!(
            registry.table_for_type(TableType::Interface, "eth0", &none).unwrap(),
            2003
        );
        assert_eq!(
            registry.table_for_type(TableType::LocalNetwork, "eth0", &none).unwrap(),
            ROUTE_LOCAL_NETWORK_TABLE
        );
        assert_eq!(
            registry.table_for_type(TableType::VpnNetwork, "vpn-tun", &none).unwrap(),
            ROUTE_VPN_NETWORK_TABLE
        );
        assert_eq!(
            registry
                .table_for_type(TableType::VpnNetwork, "xfrm-vpn4", &VpnCarrier::Xfrm(4))
                .unwrap(),
            1004
        );
        assert_eq!(
            registry.table_for_type(TableType::InternalDefault, "eth0", &none).unwrap(),
            4
        );
        assert_eq!(
            registry
                .table_for_type(TableType::UnreachableNetwork, "", &none)
                .unwrap(),
            ROUTE_UNREACHABLE_TABLE
        );
        assert!(registry
            .table_for_type(TableType::InternalDefault, "missing0", &none)
            .is_err());
    }

    #[test]
    fn test_pin_and_evict() {
        let registry = registry();
        registry.pin("eth0", ROUTE_LOCAL_NETWORK_TABLE);
        assert_eq!(registry.find_table("eth0", 0).unwrap(), ROUTE_LOCAL_NETWORK_TABLE);
        assert_eq!(registry.evict("eth0"), Some(ROUTE_LOCAL_NETWORK_TABLE));
        assert_eq!(registry.find_table("eth0", 0).unwrap(), 2003);
    }
}
