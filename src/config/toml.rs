//! TOML configuration file parsing

use serde::Deserialize;

use crate::config::RoutingPolicyConfig;
use crate::error::ConfigError;

/// TOML configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct TomlConfig {
    pub routing: Option<RoutingSection>,
    pub tools: Option<ToolsSection>,
    pub logging: Option<LoggingConfig>,
}

/// Policy switches
#[derive(Debug, Default, Deserialize)]
pub struct RoutingSection {
    pub supports_sys_vpn: Option<bool>,
    pub enterprise_route_custom: Option<bool>,
    pub route_init_dir: Option<String>,
}

/// External command paths
#[derive(Debug, Default, Deserialize)]
pub struct ToolsSection {
    pub iptables: Option<String>,
    pub ip6tables: Option<String>,
    pub ip: Option<String>,
}

/// Logging configuration
#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

/// Load configuration from TOML file
pub fn load_toml_config(path: &str) -> Result<TomlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_string(),
    })?;

    toml::from_str(&content).map_err(|e| ConfigError::InvalidFormat(e.to_string()))
}

/// Apply the values present in a TOML file over base configuration
pub fn apply_toml_config(mut base_config: RoutingPolicyConfig, file: TomlConfig) -> RoutingPolicyConfig {
    if let Some(routing) = file.routing {
        if let Some(enabled) = routing.supports_sys_vpn {
            base_config.supports_sys_vpn = enabled;
        }
        if let Some(enabled) = routing.enterprise_route_custom {
            base_config.enterprise_route_custom = enabled;
        }
        if let Some(dir) = routing.route_init_dir {
            base_config.route_init_dir = dir;
        }
    }

    if let Some(tools) = file.tools {
        if let Some(path) = tools.iptables {
            base_config.iptables_path = path;
        }
        if let Some(path) = tools.ip6tables {
            base_config.ip6tables_path = path;
        }
        if let Some(path) = tools.ip {
            base_config.ip_path = path;
        }
    }

    if let Some(level) = file.logging.and_then(|logging| logging.level) {
        base_config.log_level = level;
    }

    base_config
}
