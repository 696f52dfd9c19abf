//! Command-line argument parsing

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::RoutingPolicyConfig;
use crate::error::ConfigError;
use crate::routing::{NetworkPermission, TableType, UidRange};

/// Command-line arguments structure
#[derive(Parser, Debug)]
#[command(name = "netsys-routing")]
#[command(about = "Policy routing engine for per-network kernel routing tables")]
#[command(version)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to TOML configuration file")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, help = "Set the logging level")]
    pub log_level: Option<String>,

    #[arg(long, help = "Enable per-instance VPN tables and VPN packet marks")]
    pub sys_vpn: bool,

    #[arg(long, help = "Enable the enterprise custom route band")]
    pub enterprise_route: bool,

    #[arg(long, help = "Marker directory of the baseline local network rules")]
    pub route_init_dir: Option<String>,

    #[arg(long, help = "Path to the iptables binary")]
    pub iptables_path: Option<String>,

    #[arg(long, help = "Path to the ip6tables binary")]
    pub ip6tables_path: Option<String>,

    #[arg(long, help = "Path to the ip binary")]
    pub ip_path: Option<String>,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit without touching the kernel")]
    pub validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    pub print_default_config: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Network class selecting the routing table of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TableArg {
    Interface,
    Local,
    Vpn,
    Internal,
    Unreachable,
}

impl From<TableArg> for TableType {
    fn from(arg: TableArg) -> Self {
        match arg {
            TableArg::Interface => TableType::Interface,
            TableArg::Local => TableType::LocalNetwork,
            TableArg::Vpn => TableType::VpnNetwork,
            TableArg::Internal => TableType::InternalDefault,
            TableArg::Unreachable => TableType::UnreachableNetwork,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PermissionArg {
    #[default]
    None,
    Network,
    System,
}

impl From<PermissionArg> for NetworkPermission {
    fn from(arg: PermissionArg) -> Self {
        match arg {
            PermissionArg::None => NetworkPermission::None,
            PermissionArg::Network => NetworkPermission::Network,
            PermissionArg::System => NetworkPermission::System,
        }
    }
}

/// Route given on the command line
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct RouteArgs {
    #[arg(value_enum)]
    pub table: TableArg,
    pub interface: String,
    /// Destination in CIDR notation
    pub destination: String,
    /// Gateway, or `unreachable` / `throw`
    #[arg(default_value = "")]
    pub next_hop: String,
    #[arg(long, help = "Install as an excluded (throw) route")]
    pub excluded: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Clear stale rules and install the baseline rules
    Init,
    /// Delete every policy rule between the local and main rules
    ClearRules,
    /// Delete every route of an interface's table
    ClearRoutes {
        interface: String,
        #[arg(default_value_t = 0)]
        net_id: u16,
    },
    AddRoute(RouteArgs),
    RemoveRoute(RouteArgs),
    UpdateRoute(RouteArgs),
    AddDefault {
        interface: String,
        #[arg(long, value_enum, default_value_t)]
        permission: PermissionArg,
    },
    RemoveDefault {
        interface: String,
        #[arg(long, value_enum, default_value_t)]
        permission: PermissionArg,
    },
    AddPhysical {
        net_id: u16,
        interface: String,
        #[arg(long, value_enum, default_value_t)]
        permission: PermissionArg,
    },
    RemovePhysical {
        net_id: u16,
        interface: String,
        #[arg(long, value_enum, default_value_t)]
        permission: PermissionArg,
    },
    AddLocal {
        net_id: u16,
        interface: String,
    },
    RemoveLocal {
        net_id: u16,
        interface: String,
    },
    AddVirtual {
        net_id: u16,
        interface: String,
    },
    RemoveVirtual {
        net_id: u16,
        interface: String,
    },
    /// Route uid ranges (`begin-end`) through a VPN
    AddUsers {
        net_id: u16,
        interface: String,
        #[arg(required = true, value_parser = parse_uid_range)]
        ranges: Vec<UidRange>,
    },
    RemoveUsers {
        net_id: u16,
        interface: String,
        #[arg(required = true, value_parser = parse_uid_range)]
        ranges: Vec<UidRange>,
    },
    EnableSharing {
        input: String,
        output: String,
    },
    DisableSharing {
        input: String,
        output: String,
    },
    /// Select extended (`0`) or system VPN call mode
    VpnCallMode {
        message: String,
    },
    VpnRules {
        net_id: u16,
        interface: String,
        #[arg(required = true)]
        addresses: Vec<String>,
        #[arg(long)]
        remove: bool,
    },
    DistributedClient {
        virnic_addr: String,
        iif: String,
    },
    DistributedServer {
        iif: String,
        dev_iface: String,
        dst_addr: String,
        #[arg(long, default_value = "")]
        gw: String,
    },
    DisableDistributed {
        #[arg(long)]
        server: bool,
    },
}

/// Parse `begin-end`, or a single uid
pub fn parse_uid_range(value: &str) -> Result<UidRange, String> {
    let parse = |uid: &str| {
        uid.trim()
            .parse::<u32>()
            .map_err(|_| format!("Invalid uid: '{}'", uid))
    };
    let range = match value.split_once('-') {
        Some((begin, end)) => UidRange::new(parse(begin)?, parse(end)?),
        None => UidRange::single(parse(value)?),
    };
    if range.begin > range.end {
        return Err(format!(
            "Invalid uid range: {} is greater than {}",
            range.begin, range.end
        ));
    }
    Ok(range)
}

impl CliArgs {
    /// Apply CLI arguments over base configuration
    pub fn apply_to_config(
        &self,
        mut base_config: RoutingPolicyConfig,
    ) -> Result<RoutingPolicyConfig, ConfigError> {
        if let Some(ref level) = self.log_level {
            base_config.log_level = level.clone();
        }

        if self.sys_vpn {
            base_config.supports_sys_vpn = true;
        }

        if self.enterprise_route {
            base_config.enterprise_route_custom = true;
        }

        if let Some(ref dir) = self.route_init_dir {
            base_config.route_init_dir = dir.clone();
        }

        if let Some(ref path) = self.iptables_path {
            base_config.iptables_path = path.clone();
        }

        if let Some(ref path) = self.ip6tables_path {
            base_config.ip6tables_path = path.clone();
        }

        if let Some(ref path) = self.ip_path {
            base_config.ip_path = path.clone();
        }

        Ok(base_config)
    }
}

/// Print default configuration in TOML format
pub fn print_default_config() {
    let default_config = RoutingPolicyConfig::default();

    println!("# Netsys Routing Configuration");
    println!("# This is the default configuration with all available options");
    println!();
    println!("[routing]");
    println!("# Per-instance VPN tables, VPN call mode and outgoing packet marks");
    println!("supports_sys_vpn = {}", default_config.supports_sys_vpn);
    println!("# Enterprise custom route band");
    println!(
        "enterprise_route_custom = {}",
        default_config.enterprise_route_custom
    );
    println!("# Baseline local network rules are skipped when this directory exists");
    println!("route_init_dir = \"{}\"", default_config.route_init_dir);
    println!();
    println!("[tools]");
    println!("iptables = \"{}\"", default_config.iptables_path);
    println!("ip6tables = \"{}\"", default_config.ip6tables_path);
    println!("ip = \"{}\"", default_config.ip_path);
    println!();
    println!("[logging]");
    println!("# Log level: trace, debug, info, warn, error");
    println!("level = \"{}\"", default_config.log_level);
}
