//! Configuration management module
//!
//! Handles loading configuration from multiple sources with proper precedence:
//! CLI arguments > environment variables > TOML files > defaults

use crate::error::ConfigError;

pub mod cli;
pub mod env;
pub mod toml;

/// Directory whose presence means the baseline local network rules are installed
pub const DEFAULT_ROUTE_INIT_DIR: &str = "/data/service/el1/public/netmanager/route";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Routing policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingPolicyConfig {
    /// Per-instance VPN slots, VPN call mode and the outgoing mark chain
    pub supports_sys_vpn: bool,
    /// Enables the enterprise custom route band
    pub enterprise_route_custom: bool,
    pub route_init_dir: String,
    pub iptables_path: String,
    pub ip6tables_path: String,
    /// `ip` binary driving the distributed virtual NIC
    pub ip_path: String,
    pub log_level: String,
}

impl Default for RoutingPolicyConfig {
    fn default() -> Self {
        Self {
            supports_sys_vpn: false,
            enterprise_route_custom: false,
            route_init_dir: DEFAULT_ROUTE_INIT_DIR.to_string(),
            iptables_path: "iptables".to_string(),
            ip6tables_path: "ip6tables".to_string(),
            ip_path: "ip".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl RoutingPolicyConfig {
    /// Load configuration from every source in precedence order
    pub fn load(cli: &cli::CliArgs) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ref path) = cli.config {
            let file = toml::load_toml_config(path)?;
            config = toml::apply_toml_config(config, file);
        }
        let config = env::apply_env_config(config)?;
        let config = cli.apply_to_config(config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.route_init_dir.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "route_init_dir".to_string(),
            });
        }
        for (field, value) in [
            ("iptables_path", &self.iptables_path),
            ("ip6tables_path", &self.ip6tables_path),
            ("ip_path", &self.ip_path),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: field.to_string(),
                });
            }
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown log level '{}', expected one of {}",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}
