//! Environment variable configuration handling

use std::env;

use crate::config::RoutingPolicyConfig;
use crate::error::ConfigError;

/// Environment variable prefix
const ENV_PREFIX: &str = "NETSYS_ROUTING_";

/// Apply environment variable configuration over base configuration
pub fn apply_env_config(base_config: RoutingPolicyConfig) -> Result<RoutingPolicyConfig, ConfigError> {
    apply_env_vars(base_config, |name| env::var(name).ok())
}

/// Apply variables from `lookup`, which receives the full prefixed name
pub fn apply_env_vars<F>(
    mut base_config: RoutingPolicyConfig,
    lookup: F,
) -> Result<RoutingPolicyConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

    if let Some(value) = var("SUPPORTS_SYS_VPN") {
        base_config.supports_sys_vpn = parse_bool("SUPPORTS_SYS_VPN", &value)?;
    }

    if let Some(value) = var("ENTERPRISE_ROUTE_CUSTOM") {
        base_config.enterprise_route_custom = parse_bool("ENTERPRISE_ROUTE_CUSTOM", &value)?;
    }

    if let Some(dir) = var("ROUTE_INIT_DIR") {
        base_config.route_init_dir = dir;
    }

    if let Some(path) = var("IPTABLES_PATH") {
        base_config.iptables_path = path;
    }

    if let Some(path) = var("IP6TABLES_PATH") {
        base_config.ip6tables_path = path;
    }

    if let Some(path) = var("IP_PATH") {
        base_config.ip_path = path;
    }

    if let Some(level) = var("LOG_LEVEL") {
        base_config.log_level = level;
    }

    Ok(base_config)
}

/// Parse a boolean switch: true/false, 1/0, yes/no, on/off
pub fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidFormat(format!(
            "Invalid boolean '{}' for {}{}",
            value, ENV_PREFIX, name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_apply_env_vars() {
        let config = apply_env_vars(
            RoutingPolicyConfig::default(),
            lookup(&[
                ("NETSYS_ROUTING_SUPPORTS_SYS_VPN", "true"),
                ("NETSYS_ROUTING_ENTERPRISE_ROUTE_CUSTOM", "1"),
                ("NETSYS_ROUTING_ROUTE_INIT_DIR", "/run/route"),
                ("NETSYS_ROUTING_IPTABLES_PATH", "/system/bin/iptables"),
                ("NETSYS_ROUTING_IP6TABLES_PATH", "/system/bin/ip6tables"),
                ("NETSYS_ROUTING_IP_PATH", "/system/bin/ip"),
                ("NETSYS_ROUTING_LOG_LEVEL", "debug"),
            ]),
        )
        .unwrap();

        assert!(config.supports_sys_vpn);
        assert!(config.enterprise_route_custom);
        assert_eq!(config.route_init_dir, "/run/route");
        assert_eq!(config.iptables_path, "/system/bin/iptables");
        assert_eq!(config.ip6tables_path, "/system/bin/ip6tables");
        assert_eq!(config.ip_path, "/system/bin/ip");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_apply_env_vars_no_vars() {
        let base_config = RoutingPolicyConfig::default();
        let config = apply_env_vars(base_config.clone(), lookup(&[])).unwrap();
        assert_eq!(config, base_config);
    }

    #[test]
    fn test_invalid_bool() {
        let result = apply_env_vars(
            RoutingPolicyConfig::default(),
            lookup(&[("NETSYS_ROUTING_SUPPORTS_SYS_VPN", "sometimes")]),
        );
        assert!(matches!(result, Err(ConfigError::InvalidFormat(_))));
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "yes").unwrap());
        assert!(parse_bool("X", " ON ").unwrap());
        assert!(!parse_bool("X", "0").unwrap());
        assert!(!parse_bool("X", "false").unwrap());
        assert!(parse_bool("X", "").is_err());
    }

    #[test]
    fn test_apply_env_config_reads_process_env() {
        // only this test touches the process environment
        env::set_var("NETSYS_ROUTING_ROUTE_INIT_DIR", "/tmp/netsys-routing-env-test");

        let config = apply_env_config(RoutingPolicyConfig::default()).unwrap();
        assert_eq!(config.route_init_dir, "/tmp/netsys-routing-env-test");

        env::remove_var("NETSYS_ROUTING_ROUTE_INIT_DIR");
    }
}
