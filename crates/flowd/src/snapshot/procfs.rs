use super::{ConnectionEntry, SnapshotSource};
use crate::error::{FlowError, FlowResult};
use crate::flow::{FlowKey, Protocol, TcpStatus};
use crate::net::normalize;
use async_trait::async_trait;
use log::{debug, trace};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use tokio::fs;

/// Connection listing from the kernel's procfs tables.
pub struct ProcNetSource {
    tcp: PathBuf,
    tcp6: PathBuf,
}

impl Default for ProcNetSource {
    fn default() -> Self {
        Self::new("/proc/net/tcp", "/proc/net/tcp6")
    }
}

impl ProcNetSource {
    pub fn new(tcp: impl Into<PathBuf>, tcp6: impl Into<PathBuf>) -> Self {
        Self {
            tcp: tcp.into(),
            tcp6: tcp6.into(),
        }
    }
}

#[async_trait]
impl SnapshotSource for ProcNetSource {
    async fn poll(&mut self) -> FlowResult<Vec<ConnectionEntry>> {
        let v4 = fs::read_to_string(&self.tcp).await.map_err(|e| {
            FlowError::TransientQuery(format!("failed to read {:?}: {}", self.tcp, e))
        })?;
        let mut entries = parse_proc_net(&v4);

        // Hosts with IPv6 disabled have no tcp6 table
        match fs::read_to_string(&self.tcp6).await {
            Ok(v6) => entries.extend(parse_proc_net(&v6)),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FlowError::TransientQuery(format!(
                    "failed to read {:?}: {}",
                    self.tcp6, e
                )))
            }
        }
        debug!("procfs query: {} connections", entries.len());
        Ok(entries)
    }

    fn name(&self) -> &'static str {
        "procfs"
    }
}

/// Parse one `/proc/net/tcp{,6}` table. Unparseable rows are skipped.
pub fn parse_proc_net(content: &str) -> Vec<ConnectionEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let row = parse_row(line);
            if row.is_none() {
                trace!("Skipping procfs row: {}", line);
            }
            row
        })
        .collect()
}

fn parse_row(line: &str) -> Option<ConnectionEntry> {
    let mut fields = line.split_whitespace();
    let _slot = fields.next()?;
    let (src_ip, src_port) = parse_endpoint(fields.next()?)?;
    let (dst_ip, dst_port) = parse_endpoint(fields.next()?)?;
    let state = u8::from_str_radix(fields.next()?, 16).ok()?;

    let key = FlowKey {
        protocol: Protocol::Tcp,
        src_ip,
        src_port,
        dst_ip,
        dst_port,
    };
    Some(ConnectionEntry::new(key, TcpStatus::from_proc(state)))
}

// Addresses are printed as native-endian 32-bit words in hex
fn parse_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..i * 8 + 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some((normalize(ip), port))
}
