//! Public address discovery
//!
//! Fireflies carry the public source address of a flow, which differs from
//! the socket address on hosts behind NAT.
//!
//! ### Algorithm:
//! 1. Find the local address per family by connecting a UDP socket to a
//!    public resolver (no packet is sent)
//! 2. If that address is private, ask STUN servers for the mapped address
//!    (RFC 5389 Binding Request, XOR-MAPPED-ADDRESS)
//! 3. If no STUN server answers, fall back to the my-ip.io HTTP echo

use crate::error::{FlowError, FlowResult};
use crate::net::{is_private, normalize};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::timeout;

/// Default STUN servers
pub const STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
    "stun.nextcloud.com:443",
];

const IP4_PROBE: &str = "8.8.8.8:53";
const IP6_PROBE: &str = "[2001:4860:4860::8888]:53";

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Addresses used as the firefly source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpConfig {
    pub pub_ip4: Option<Ipv4Addr>,
    pub int_ip4: Option<Ipv4Addr>,
    pub pub_ip6: Option<Ipv6Addr>,
    pub int_ip6: Option<Ipv6Addr>,
}

impl IpConfig {
    /// Public address of the same family as `ip`, if one was discovered.
    pub fn public_for(&self, ip: &IpAddr) -> Option<IpAddr> {
        match ip {
            IpAddr::V4(_) => self.pub_ip4.map(IpAddr::V4),
            IpAddr::V6(_) => self.pub_ip6.map(IpAddr::V6),
        }
    }
}

/// Discovery settings
pub struct Discovery {
    stun_servers: Vec<String>,
    query_timeout: Duration,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new(STUN_SERVERS.iter().map(|s| s.to_string()).collect())
    }
}

impl Discovery {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self {
            stun_servers,
            query_timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    /// Discover internal and public addresses. Never fails; anything not
    /// found stays `None`.
    pub async fn discover(&self) -> IpConfig {
        let mut config = IpConfig::default();

        if let Some(IpAddr::V4(ip)) = local_address(IP4_PROBE).await {
            debug!("Internal IPv4: {}", ip);
            config.int_ip4 = Some(ip);
            if is_private(&IpAddr::V4(ip)) {
                config.pub_ip4 = match self.public_address(false).await {
                    Some(IpAddr::V4(public)) => Some(public),
                    _ => None,
                };
            }
        }

        if let Some(IpAddr::V6(ip)) = local_address(IP6_PROBE).await {
            debug!("Internal IPv6: {}", ip);
            config.int_ip6 = Some(ip);
            if is_private(&IpAddr::V6(ip)) {
                config.pub_ip6 = match self.public_address(true).await {
                    Some(IpAddr::V6(public)) => Some(public),
                    _ => None,
                };
            }
        }

        info!(
            "Address discovery: ipv4 {:?} (public {:?}), ipv6 {:?} (public {:?})",
            config.int_ip4, config.pub_ip4, config.int_ip6, config.pub_ip6
        );
        config
    }

    async fn public_address(&self, ipv6: bool) -> Option<IpAddr> {
        for server in &self.stun_servers {
            match stun_query(server, ipv6, self.query_timeout).await {
                Ok(addr) => {
                    debug!("STUN {}: {}", server, addr);
                    return Some(addr.ip());
                }
                Err(e) => debug!("STUN {} failed: {}", server, e),
            }
        }
        match my_ip(ipv6).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("Public address discovery failed: {}", e);
                None
            }
        }
    }
}

/// Local source address the kernel would use towards `probe`.
async fn local_address(probe: &str) -> Option<IpAddr> {
    let target: SocketAddr = probe.parse().ok()?;
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = match UdpSocket::bind(bind).await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("Failed to detect local address towards {}: {}", probe, e);
            return None;
        }
    };
    if let Err(e) = socket.connect(target).await {
        debug!("Failed to detect local address towards {}: {}", probe, e);
        return None;
    }
    socket.local_addr().ok().map(|addr| normalize(addr.ip()))
}

/// Send one Binding Request and return the mapped address.
pub async fn stun_query(server: &str, ipv6: bool, query_timeout: Duration) -> FlowResult<SocketAddr> {
    let addrs = timeout(Duration::from_secs(2), lookup_host(server))
        .await
        .map_err(|_| FlowError::TransientQuery(format!("DNS resolution timeout for {}", server)))?
        .map_err(|e| FlowError::TransientQuery(format!("DNS resolution failed for {}: {}", server, e)))?;
    let target = addrs
        .into_iter()
        .find(|a| a.is_ipv6() == ipv6)
        .ok_or_else(|| FlowError::TransientQuery(format!("{} has no matching address", server)))?;

    let bind: SocketAddr = if ipv6 {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| FlowError::TransientQuery(format!("bind failed: {}", e)))?;

    let tx_id: [u8; 12] = rand::random();
    socket
        .send_to(&build_binding_request(&tx_id), target)
        .await
        .map_err(|e| FlowError::TransientQuery(format!("send failed: {}", e)))?;

    let mut buf = [0u8; 1024];
    let (n, _) = timeout(query_timeout, socket.recv_from(&mut buf))
        .await
        .map_err(|_| FlowError::TransientQuery("timeout".to_string()))?
        .map_err(|e| FlowError::TransientQuery(format!("recv failed: {}", e)))?;

    parse_binding_response(&buf[..n], &tx_id)
}

/// Ask the my-ip.io echo service for the public address.
pub async fn my_ip(ipv6: bool) -> FlowResult<IpAddr> {
    let url = format!("https://api{}.my-ip.io/ip", if ipv6 { 6 } else { 4 });
    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| FlowError::TransientQuery(format!("http client: {}", e)))?
        .get(&url)
        .send()
        .await
        .map_err(|e| FlowError::TransientQuery(format!("{}: {}", url, e)))?;
    if !response.status().is_success() {
        return Err(FlowError::TransientQuery(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }
    let body = response
        .text()
        .await
        .map_err(|e| FlowError::TransientQuery(format!("{}: {}", url, e)))?;
    body.trim()
        .parse()
        .map_err(|_| FlowError::TransientQuery(format!("{} returned '{}'", url, body.trim())))
}

// ============================================================================
// STUN wire format (RFC 5389)
// ============================================================================

/// Build a STUN Binding Request message
pub fn build_binding_request(tx_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    // No attributes
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(tx_id);
    msg
}

/// Validate a Binding Success Response and extract the mapped address.
/// XOR-MAPPED-ADDRESS wins over the legacy MAPPED-ADDRESS.
pub fn parse_binding_response(buf: &[u8], tx_id: &[u8; 12]) -> FlowResult<SocketAddr> {
    if buf.len() < 20 {
        return Err(FlowError::TransientQuery("response too short".to_string()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(FlowError::TransientQuery(format!(
            "unexpected message type: 0x{:04x}",
            msg_type
        )));
    }
    if buf[8..20] != tx_id[..] {
        return Err(FlowError::TransientQuery("transaction ID mismatch".to_string()));
    }

    let length = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let body = &buf[20..buf.len().min(20 + length)];
    let mut mapped = None;
    let mut offset = 0;

    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = usize::from(u16::from_be_bytes([body[offset + 2], body[offset + 3]]));
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > body.len() {
            break;
        }
        let value = &body[value_start..value_end];
        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(&buf[4..20])) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or_else(|| decode_address(value, None)),
            _ => {}
        }
        // Attributes are padded to 4 bytes
        offset = value_end + (4 - attr_len % 4) % 4;
    }

    mapped.ok_or_else(|| FlowError::TransientQuery("no mapped address in response".to_string()))
}

/// `xor_key` is the magic cookie followed by the transaction id.
fn decode_address(value: &[u8], xor_key: Option<&[u8]>) -> Option<SocketAddr> {
    if value.len() < 8 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    if xor_key.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let xor = |bytes: &[u8]| -> Vec<u8> {
        match xor_key {
            Some(key) => bytes.iter().zip(key).map(|(b, k)| b ^ k).collect(),
            None => bytes.to_vec(),
        }
    };

    match family {
        0x01 => {
            let octets: [u8; 4] = xor(&value[4..8]).try_into().ok()?;
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        0x02 if value.len() >= 20 => {
            let octets: [u8; 16] = xor(&value[4..20]).try_into().ok()?;
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TX_ID: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response(attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (attr_type, value) in attrs {
            body.extend_from_slice(&attr_type.to_be_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value);
            while body.len() % 4 != 0 {
                body.push(0);
            }
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&TX_ID);
        msg.extend_from_slice(&body);
        msg
    }

    fn xor_v4(ip: Ipv4Addr, port: u16) -> Vec<u8> {
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&(port ^ 0x2112).to_be_bytes());
        let cookie = MAGIC_COOKIE.to_be_bytes();
        value.extend(ip.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
        value
    }

    #[test]
    fn test_build_binding_request() {
        let msg = build_binding_request(&TX_ID);
        assert_eq!(msg.len(), 20);
        assert_eq!(&msg[0..2], &[0x00, 0x01]);
        assert_eq!(&msg[2..4], &[0x00, 0x00]);
        assert_eq!(&msg[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&msg[8..20], &TX_ID);
    }

    #[test]
    fn test_parse_xor_mapped_ipv4() {
        let ip = Ipv4Addr::new(192, 0, 2, 33);
        let msg = response(&[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(ip, 40000))]);
        let addr = parse_binding_response(&msg, &TX_ID).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V4(ip), 40000));
    }

    #[test]
    fn test_parse_xor_mapped_ipv6() {
        let ip: Ipv6Addr = "2001:db8::42".parse().unwrap();
        let mut key = MAGIC_COOKIE.to_be_bytes().to_vec();
        key.extend_from_slice(&TX_ID);

        let mut value = vec![0, 0x02];
        value.extend_from_slice(&(443u16 ^ 0x2112).to_be_bytes());
        value.extend(ip.octets().iter().zip(key.iter()).map(|(a, b)| a ^ b));

        let msg = response(&[(ATTR_XOR_MAPPED_ADDRESS, value)]);
        let addr = parse_binding_response(&msg, &TX_ID).unwrap();
        assert_eq!(addr, SocketAddr::new(IpAddr::V6(ip), 443));
    }

    #[test]
    fn test_legacy_mapped_address_and_precedence() {
        let legacy = vec![0, 0x01, 0x1F, 0x90, 198, 51, 100, 9];
        let msg = response(&[(ATTR_MAPPED_ADDRESS, legacy.clone())]);
        assert_eq!(
            parse_binding_response(&msg, &TX_ID).unwrap(),
            "198.51.100.9:8080".parse().unwrap()
        );

        let xor_ip = Ipv4Addr::new(192, 0, 2, 33);
        let msg = response(&[
            (ATTR_MAPPED_ADDRESS, legacy),
            (0x8022, b"soft".to_vec()),
            (ATTR_XOR_MAPPED_ADDRESS, xor_v4(xor_ip, 1)),
        ]);
        assert_eq!(
            parse_binding_response(&msg, &TX_ID).unwrap(),
            SocketAddr::new(IpAddr::V4(xor_ip), 1)
        );
    }

    #[test]
    fn test_rejects_bad_responses() {
        assert!(parse_binding_response(&[0u8; 10], &TX_ID).is_err());

        let mut msg = response(&[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(Ipv4Addr::LOCALHOST, 1))]);
        msg[19] ^= 0xFF;
        assert!(parse_binding_response(&msg, &TX_ID).is_err());

        let mut msg = response(&[]);
        msg[1] = 0x11;
        assert!(parse_binding_response(&msg, &TX_ID).is_err());

        let msg = response(&[]);
        assert!(matches!(
            parse_binding_response(&msg, &TX_ID),
            Err(FlowError::TransientQuery(_))
        ));
    }

    #[test]
    fn test_public_for() {
        let config = IpConfig {
            pub_ip4: Some(Ipv4Addr::new(192, 0, 2, 1)),
            ..Default::default()
        };
        assert_eq!(
            config.public_for(&"203.0.113.7".parse().unwrap()),
            Some("192.0.2.1".parse().unwrap())
        );
        assert_eq!(config.public_for(&"2001:db8::1".parse().unwrap()), None);
    }
}
