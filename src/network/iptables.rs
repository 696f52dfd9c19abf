//! Packet-mark rules installed through iptables
//!
//! The fib rules match on socket fwmarks; packets that never carry a socket
//! mark (forwarded traffic, sockets owned by extended VPN users) get theirs
//! from mangle-table MARK rules built here.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::RouteError;
use crate::netlink::IpFamily;

/// Mangle chain marking inbound packets
pub const LOCAL_MANGLE_INPUT: &str = "routectrl_mangle_INPUT";
/// Mangle chain marking locally generated packets
pub const LOCAL_MANGLE_OUTPUT: &str = "routectrl_mangle_OUTPUT";

/// Executes one iptables command line for a family
#[async_trait]
pub trait IptablesRunner: Send + Sync {
    async fn run(&self, family: IpFamily, command: &str) -> Result<(), RouteError>;
}

/// Runner spawning the iptables binaries
#[derive(Debug, Clone)]
pub struct CommandIptablesRunner {
    iptables: String,
    ip6tables: String,
}

impl CommandIptablesRunner {
    pub fn new(iptables: &str, ip6tables: &str) -> Self {
        Self {
            iptables: iptables.to_string(),
            ip6tables: ip6tables.to_string(),
        }
    }
}

impl Default for CommandIptablesRunner {
    fn default() -> Self {
        Self::new("iptables", "ip6tables")
    }
}

#[async_trait]
impl IptablesRunner for CommandIptablesRunner {
    async fn run(&self, family: IpFamily, command: &str) -> Result<(), RouteError> {
        let binary = match family {
            IpFamily::V4 => &self.iptables,
            IpFamily::V6 => &self.ip6tables,
        };
        debug!("{} {}", binary, command);

        let output = Command::new(binary)
            .args(command.split_whitespace())
            .output()
            .await
            .map_err(|e| RouteError::Command(format!("{}: {}", binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("{} {} failed: {}", binary, command, stderr.trim());
            return Err(RouteError::Command(format!(
                "{} {}: {}",
                binary,
                command,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

fn append_or_delete(add: bool) -> &'static str {
    if add {
        "-A"
    } else {
        "-D"
    }
}

/// Create a mangle chain
pub fn new_chain_command(chain: &str) -> String {
    format!("-t mangle -N {}", chain)
}

/// Jump from a built-in mangle chain into one of ours
pub fn jump_command(from: &str, chain: &str) -> String {
    format!("-t mangle -A {} -j {}", from, chain)
}

/// Check whether the jump into one of our chains is already installed
pub fn jump_check_command(from: &str, chain: &str) -> String {
    format!("-t mangle -C {} -j {}", from, chain)
}

/// Mark packets arriving on an interface, preserving the uid billing bit
pub fn incoming_mark_command(interface: &str, mark: u32, mask: u32, add: bool) -> String {
    format!(
        "-t mangle {} {} -i {} -j MARK --set-mark 0x{:x}/0x{:x}",
        append_or_delete(add),
        LOCAL_MANGLE_INPUT,
        interface,
        mark,
        mask
    )
}

/// Mark packets sourced from a VPN-assigned address
pub fn outgoing_ip_mark_command(source: &str, mark: u32, add: bool) -> String {
    format!(
        "-t mangle {} {} -s {} -j MARK --set-mark 0x{:x}",
        append_or_delete(add),
        LOCAL_MANGLE_OUTPUT,
        source,
        mark
    )
}

/// Mark packets owned by a uid range
pub fn outgoing_uid_mark_command(start: u32, end: u32, mark: u32, add: bool) -> String {
    format!(
        "-t mangle {} {} -m owner --uid-owner {}-{} -j MARK --set-mark 0x{:x}",
        append_or_delete(add),
        LOCAL_MANGLE_OUTPUT,
        start,
        end,
        mark
    )
}
