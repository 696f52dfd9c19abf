use std::sync::Arc;

use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netsys_routing::config::cli::{print_default_config, CliArgs, Command, RouteArgs};
use netsys_routing::config::RoutingPolicyConfig;
use netsys_routing::error::{AppError, RouteError};
use netsys_routing::netlink::RtNetlinkTransport;
use netsys_routing::network::SystemInterfaceResolver;
use netsys_routing::routing::{NetworkRouteInfo, RouteManager, StepResults};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = CliArgs::parse();

    if cli.print_default_config {
        print_default_config();
        return Ok(());
    }

    let config = RoutingPolicyConfig::load(&cli)?;
    if cli.validate_config {
        println!("Configuration is valid");
        return Ok(());
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.log_level))
        .init();

    let Some(command) = cli.command else {
        CliArgs::command().print_help()?;
        return Ok(());
    };

    info!("Starting Netsys Routing");
    let netlink = Arc::new(RtNetlinkTransport::new()?);
    let manager = RouteManager::new(netlink, Arc::new(SystemInterfaceResolver), config);

    if let Err(e) = run(&manager, command).await {
        error!("command failed: {} (status {})", e, e.code());
        return Err(e.into());
    }
    Ok(())
}

fn route_info(args: &RouteArgs) -> NetworkRouteInfo {
    let route = NetworkRouteInfo::new(&args.interface, &args.destination, &args.next_hop);
    if args.excluded {
        route.excluded()
    } else {
        route
    }
}

/// Log every failed step and report the first one
fn finish(steps: StepResults) -> Result<(), RouteError> {
    for (label, e) in steps.failures() {
        error!("{} failed: {}", label, e);
    }
    steps.into_result()
}

async fn run(manager: &RouteManager, command: Command) -> Result<(), RouteError> {
    match command {
        Command::Init => manager.init().await,
        Command::ClearRules => manager.clear_rules().await,
        Command::ClearRoutes { interface, net_id } => {
            manager.clear_routes(&interface, net_id).await
        }
        Command::AddRoute(args) => {
            let outcome = manager
                .add_route(args.table.into(), &route_info(&args))
                .await?;
            if outcome.is_repeat() {
                info!("route already present");
            }
            Ok(())
        }
        Command::RemoveRoute(args) => {
            manager
                .remove_route(args.table.into(), &route_info(&args))
                .await
        }
        Command::UpdateRoute(args) => {
            manager
                .update_route(args.table.into(), &route_info(&args))
                .await
        }
        Command::AddDefault {
            interface,
            permission,
        } => {
            manager
                .add_interface_to_default_network(&interface, permission.into())
                .await
        }
        Command::RemoveDefault {
            interface,
            permission,
        } => {
            manager
                .remove_interface_from_default_network(&interface, permission.into())
                .await
        }
        Command::AddPhysical {
            net_id,
            interface,
            permission,
        } => {
            manager
                .add_interface_to_physical_network(net_id, &interface, permission.into())
                .await
        }
        Command::RemovePhysical {
            net_id,
            interface,
            permission,
        } => {
            manager
                .remove_interface_from_physical_network(net_id, &interface, permission.into())
                .await
        }
        Command::AddLocal { net_id, interface } => {
            manager
                .add_interface_to_local_network(net_id, &interface)
                .await
        }
        Command::RemoveLocal { net_id, interface } => {
            manager
                .remove_interface_from_local_network(net_id, &interface)
                .await
        }
        Command::AddVirtual { net_id, interface } => finish(
            manager
                .add_interface_to_virtual_network(net_id, &interface)
                .await,
        ),
        Command::RemoveVirtual { net_id, interface } => finish(
            manager
                .remove_interface_from_virtual_network(net_id, &interface)
                .await,
        ),
        Command::AddUsers {
            net_id,
            interface,
            ranges,
        } => finish(
            manager
                .add_users_to_virtual_network(net_id, &interface, &ranges)
                .await,
        ),
        Command::RemoveUsers {
            net_id,
            interface,
            ranges,
        } => finish(
            manager
                .remove_users_from_virtual_network(net_id, &interface, &ranges)
                .await,
        ),
        Command::EnableSharing { input, output } => manager.enable_sharing(&input, &output).await,
        Command::DisableSharing { input, output } => {
            manager.disable_sharing(&input, &output).await
        }
        Command::VpnCallMode { message } => manager.set_vpn_call_mode(&message),
        Command::VpnRules {
            net_id,
            interface,
            addresses,
            remove,
        } => {
            manager
                .update_vpn_rules(net_id, &interface, &addresses, !remove)
                .await
        }
        Command::DistributedClient { virnic_addr, iif } => {
            manager
                .enable_distributed_client_net(&virnic_addr, &iif)
                .await
        }
        Command::DistributedServer {
            iif,
            dev_iface,
            dst_addr,
            gw,
        } => finish(
            manager
                .enable_distributed_server_net(&iif, &dev_iface, &dst_addr, &gw)
                .await,
        ),
        Command::DisableDistributed { server } => {
            finish(manager.disable_distributed_net(server).await)
        }
    }
}
