//! Kernel transport over an rtnetlink connection

use std::net::{Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::route::RouteMessage;
use rtnetlink::packet_route::rule::RuleMessage;
use rtnetlink::{new_connection, Handle, IpVersion, RouteMessageBuilder};
use tracing::debug;

use crate::error::NetlinkError;
use crate::netlink::{IpFamily, NetlinkRequest, NetlinkTransport};

/// Transport implementation using an rtnetlink handle
pub struct RtNetlinkTransport {
    handle: Handle,
}

impl RtNetlinkTransport {
    /// Open a netlink route socket and drive it on the current runtime
    pub fn new() -> Result<Self, NetlinkError> {
        let (connection, handle, _) =
            new_connection().map_err(|e| NetlinkError::Connection(e.to_string()))?;

        // Spawn the connection handler
        tokio::spawn(connection);

        Ok(Self { handle })
    }
}

fn map_rtnetlink_error(err: rtnetlink::Error) -> NetlinkError {
    match err {
        rtnetlink::Error::NetlinkError(message) => match message.code {
            Some(code) => NetlinkError::Kernel { code: code.get() },
            None => NetlinkError::Transport("unexpected acknowledgement".to_string()),
        },
        other => NetlinkError::Transport(other.to_string()),
    }
}

#[async_trait]
impl NetlinkTransport for RtNetlinkTransport {
    async fn send(&self, request: NetlinkRequest) -> Result<(), NetlinkError> {
        debug!(
            "sending {:?} ({} bytes, flags {:#x})",
            request.action(),
            request.encoded_len(),
            request.flags()
        );
        let mut handle = self.handle.clone();
        let mut responses = handle
            .request(request.to_message())
            .map_err(map_rtnetlink_error)?;

        while let Some(reply) = responses.next().await {
            if let NetlinkPayload::Error(err) = reply.payload {
                if let Some(code) = err.code {
                    return Err(NetlinkError::Kernel { code: code.get() });
                }
            }
        }
        Ok(())
    }

    async fn dump_rules(&self, family: IpFamily) -> Result<Vec<RuleMessage>, NetlinkError> {
        let version = match family {
            IpFamily::V4 => IpVersion::V4,
            IpFamily::V6 => IpVersion::V6,
        };
        self.handle
            .rule()
            .get(version)
            .execute()
            .try_collect()
            .await
            .map_err(map_rtnetlink_error)
    }

    async fn dump_routes(&self, family: IpFamily) -> Result<Vec<RouteMessage>, NetlinkError> {
        let filter = match family {
            IpFamily::V4 => RouteMessageBuilder::<Ipv4Addr>::default().build(),
            IpFamily::V6 => RouteMessageBuilder::<Ipv6Addr>::default().build(),
        };
        self.handle
            .route()
            .get(filter)
            .execute()
            .try_collect()
            .await
            .map_err(map_rtnetlink_error)
    }
}
