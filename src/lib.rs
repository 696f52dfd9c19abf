//! Netsys Routing - policy routing engine for per-network kernel routing tables
//!
//! Each logical network (physical interface, VPN, local network, sharing
//! session, distributed session) gets its own routing table plus prioritized
//! fib rules steering packets into it by fwmark, uid range, interface or
//! destination. [`routing::RouteManager`] carries the operations.

pub mod config;
pub mod error;
pub mod netlink;
pub mod network;
pub mod routing;

pub use error::AppError;
