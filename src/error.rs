//! Centralized error types and handling

use nix::errno::Errno;
use thiserror::Error;

/// Generic failure status used by the integer API surface
pub const ROUTEMANAGER_ERROR: i32 = -1;

/// Main application error type
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Route management error: {0}")]
    Route(#[from] RouteError),

    #[error("Netlink error: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Netlink transport and message assembly errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetlinkError {
    #[error("Netlink message would exceed {max} bytes (needs {needed})")]
    BufferOverflow { needed: usize, max: usize },

    #[error("Kernel rejected request: {}", Errno::from_raw(-code))]
    Kernel { code: i32 },

    #[error("Failed to open netlink connection: {0}")]
    Connection(String),

    #[error("Netlink transport failure: {0}")]
    Transport(String),
}

impl NetlinkError {
    /// Negative errno reported by the kernel, if any
    pub fn errno(&self) -> Option<i32> {
        match self {
            NetlinkError::Kernel { code } => Some(*code),
            _ => None,
        }
    }
}

/// Route and rule management errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("Cannot find interface: {name}")]
    UnknownInterface { name: String },

    #[error("Invalid rule priority: {0}")]
    InvalidPriority(i32),

    #[error("Mask {mask:#x} does not select all the bits set in fwmark {fwmark:#x}")]
    MaskMismatch { fwmark: u32, mask: u32 },

    #[error("Unspecified table is only allowed when deleting rules")]
    UnspecifiedTable,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Route already exists: {0}")]
    RouteExists(String),

    #[error("Netlink failure: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("Packet mark command failed: {0}")]
    Command(String),

    #[error("Distributed interface failure: {0}")]
    Distributed(String),

    #[error("Feature disabled: {0}")]
    FeatureDisabled(&'static str),
}

impl RouteError {
    /// Integer status for callers that still speak the legacy return-code API
    pub fn code(&self) -> i32 {
        match self {
            RouteError::UnspecifiedTable => -(Errno::ENOTUNIQ as i32),
            RouteError::RouteExists(_) => -(Errno::EEXIST as i32),
            RouteError::Netlink(err) => err.errno().unwrap_or(ROUTEMANAGER_ERROR),
            _ => ROUTEMANAGER_ERROR,
        }
    }

    /// True when the kernel refused a route add because it is already installed
    pub fn is_route_repeat(&self) -> bool {
        match self {
            RouteError::RouteExists(_) => true,
            RouteError::Netlink(err) => err.errno() == Some(-(Errno::EEXIST as i32)),
            _ => false,
        }
    }

    /// True when a delete targeted a rule or route the kernel does not have
    pub fn is_not_found(&self) -> bool {
        match self {
            RouteError::Netlink(err) => matches!(
                err.errno(),
                Some(code) if code == -(Errno::ENOENT as i32) || code == -(Errno::ESRCH as i32)
            ),
            _ => false,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid configuration format: {0}")]
    InvalidFormat(String),

    #[error("Missing required configuration: {field}")]
    MissingRequired { field: String },

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
