//! Virtual NIC lifecycle for cross-device distributed networking

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{error, info};

use crate::error::RouteError;

/// MTU of the distributed virtual NIC
pub const DISTRIBUTED_MTU: u32 = 1400;

/// Creates and tears down the devices backing distributed sessions
#[async_trait]
pub trait DistributedInterfaceManager: Send + Sync {
    /// Bring up the client TUN device with its address, plus its veth companion
    async fn config_virnic_and_veth(
        &self,
        virnic_addr: &str,
        virnic_name: &str,
        veth_name: &str,
    ) -> Result<(), RouteError>;

    /// Remember which interfaces the server session forwards between
    fn set_server_nic_info(&self, iif: &str, dev_iface: &str);

    fn server_iif_nic(&self) -> String;

    fn server_dev_iface_nic(&self) -> String;

    async fn disable_virnic(&self, virnic_name: &str) -> Result<(), RouteError>;
}

#[derive(Debug, Default, Clone)]
struct ServerNics {
    iif: String,
    dev_iface: String,
}

/// Manager driving the `ip` tool
#[derive(Debug)]
pub struct IpCommandDistributedManager {
    ip_path: String,
    server: Mutex<ServerNics>,
}

impl IpCommandDistributedManager {
    pub fn new(ip_path: &str) -> Self {
        Self {
            ip_path: ip_path.to_string(),
            server: Mutex::new(ServerNics::default()),
        }
    }

    async fn run_ip(&self, args: &[&str]) -> Result<(), RouteError> {
        let output = Command::new(&self.ip_path)
            .args(args)
            .output()
            .await
            .map_err(|e| RouteError::Distributed(format!("{}: {}", self.ip_path, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("ip {} failed: {}", args.join(" "), stderr.trim());
            return Err(RouteError::Distributed(format!(
                "ip {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn server(&self) -> std::sync::MutexGuard<'_, ServerNics> {
        self.server
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for IpCommandDistributedManager {
    fn default() -> Self {
        Self::new("ip")
    }
}

#[async_trait]
impl DistributedInterfaceManager for IpCommandDistributedManager {
    async fn config_virnic_and_veth(
        &self,
        virnic_addr: &str,
        virnic_name: &str,
        veth_name: &str,
    ) -> Result<(), RouteError> {
        info!("creating {} with mtu {}", virnic_name, DISTRIBUTED_MTU);
        let mtu = DISTRIBUTED_MTU.to_string();
        let address = format!("{}/24", virnic_addr);

        self.run_ip(&["tuntap", "add", "dev", virnic_name, "mode", "tun"])
            .await?;
        if let Err(e) = async {
            self.run_ip(&["link", "set", "dev", virnic_name, "mtu", &mtu])
                .await?;
            self.run_ip(&["addr", "add", &address, "dev", virnic_name])
                .await?;
            self.run_ip(&["link", "set", "dev", virnic_name, "up"]).await
        }
        .await
        {
            let _ = self.run_ip(&["link", "set", "dev", virnic_name, "down"]).await;
            return Err(e);
        }

        self.run_ip(&["link", "add", veth_name, "type", "veth"])
            .await?;
        self.run_ip(&["link", "set", "dev", veth_name, "up"]).await
    }

    fn set_server_nic_info(&self, iif: &str, dev_iface: &str) {
        let mut server = self.server();
        server.iif = iif.to_string();
        server.dev_iface = dev_iface.to_string();
    }

    fn server_iif_nic(&self) -> String {
        self.server().iif.clone()
    }

    fn server_dev_iface_nic(&self) -> String {
        self.server().dev_iface.clone()
    }

    async fn disable_virnic(&self, virnic_name: &str) -> Result<(), RouteError> {
        self.run_ip(&["link", "set", "dev", virnic_name, "down"])
            .await
    }
}
