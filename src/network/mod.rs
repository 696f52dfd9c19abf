//! Collaborators outside the netlink path
//!
//! Interface index lookup, iptables packet marking and the virtual NIC
//! devices used by distributed sessions.

pub mod distributed;
pub mod interface;
pub mod iptables;

pub use distributed::{DistributedInterfaceManager, IpCommandDistributedManager};
pub use interface::{InterfaceResolver, StaticInterfaceResolver, SystemInterfaceResolver};
pub use iptables::{CommandIptablesRunner, IptablesRunner};
