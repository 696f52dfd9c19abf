//! Interface name to kernel index resolution

use std::collections::HashMap;

use nix::net::if_::if_nametoindex;
use tracing::debug;

/// Resolves interface names to kernel interface indexes
pub trait InterfaceResolver: Send + Sync {
    /// Index of the named interface, `None` when the kernel does not know it
    fn index_of(&self, name: &str) -> Option<u32>;
}

/// Resolver backed by `if_nametoindex(3)`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaceResolver;

impl InterfaceResolver for SystemInterfaceResolver {
    fn index_of(&self, name: &str) -> Option<u32> {
        if name.is_empty() {
            return None;
        }
        match if_nametoindex(name) {
            Ok(0) => None,
            Ok(index) => Some(index),
            Err(errno) => {
                debug!("if_nametoindex({}) failed: {}", name, errno);
                None
            }
        }
    }
}

/// Fixed name to index table, for hosts without the real interfaces
#[derive(Debug, Default, Clone)]
pub struct StaticInterfaceResolver {
    indexes: HashMap<String, u32>,
}

impl StaticInterfaceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interface(mut self, name: &str, index: u32) -> Self {
        self.indexes.insert(name.to_string(), index);
        self
    }
}

impl InterfaceResolver for StaticInterfaceResolver {
    fn index_of(&self, name: &str) -> Option<u32> {
        self.indexes.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_resolver_unknown_interface() {
        let resolver = SystemInterfaceResolver;
        assert_eq!(resolver.index_of("nonexistent-iface-xyz"), None);
        assert_eq!(resolver.index_of(""), None);
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticInterfaceResolver::new()
            .with_interface("eth0", 3)
            .with_interface("wlan0", 5);

        assert_eq!(resolver.index_of("eth0"), Some(3));
        assert_eq!(resolver.index_of("wlan0"), Some(5));
        assert_eq!(resolver.index_of("rmnet0"), None);
    }
}
