//! Dual-stack UDP sending for fireflies.
//!
//! ## Design
//! - Separate IPv4 and IPv6 sockets on ephemeral ports
//! - Datagrams go out on the socket matching the destination family
//! - Hosts without IPv6 keep working with the IPv4 socket alone

use crate::error::{FlowError, FlowResult};
use anyhow::{Context, Result};
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Dual-stack UDP socket pair
pub struct DualStackSocket {
    /// IPv4 socket (always present)
    pconn4: UdpSocket,
    /// IPv6 socket (optional, may not be available)
    pconn6: Option<UdpSocket>,
}

impl DualStackSocket {
    /// Bind both families on ephemeral ports. A missing IPv6 stack only
    /// disables IPv6 destinations.
    pub async fn bind() -> Result<Self> {
        let pconn4 = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .await
            .context("Failed to bind IPv4 socket")?;
        info!("Bound IPv4 sender on {}", pconn4.local_addr()?);

        let pconn6 = match UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)).await
        {
            Ok(socket) => {
                if let Ok(addr) = socket.local_addr() {
                    info!("Bound IPv6 sender on {}", addr);
                }
                Some(socket)
            }
            Err(e) => {
                warn!("IPv6 not available: {}. Running in IPv4-only mode.", e);
                None
            }
        };

        Ok(Self { pconn4, pconn6 })
    }

    /// Check if IPv6 is available
    pub fn has_ipv6(&self) -> bool {
        self.pconn6.is_some()
    }

    /// Send data to the specified address, automatically selecting the right socket
    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> FlowResult<usize> {
        let socket = match addr {
            SocketAddr::V4(_) => &self.pconn4,
            SocketAddr::V6(_) => self.pconn6.as_ref().ok_or_else(|| {
                FlowError::Delivery(format!("IPv6 not available, cannot send to {}", addr))
            })?,
        };
        socket
            .send_to(buf, addr)
            .await
            .map_err(|e| FlowError::Delivery(format!("send to {} failed: {}", addr, e)))
    }

    /// Send on the IPv4 socket only.
    pub async fn send_to_v4(&self, buf: &[u8], addr: SocketAddr) -> FlowResult<usize> {
        if !addr.is_ipv4() {
            return Err(FlowError::Delivery(format!(
                "{} is not an IPv4 address",
                addr
            )));
        }
        self.send_to(buf, addr).await
    }
}
