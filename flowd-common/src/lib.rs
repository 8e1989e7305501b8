#![no_std]

/// Name of the map holding the flow label per connection
pub const FLOW_LABEL_MAP: &str = "FLOW_LABELS";

/// Name of the map holding connections scheduled for removal
pub const TO_BE_DELETED_MAP: &str = "TO_BE_DELETED";

/// Name of the TC classifier program
pub const CLASSIFIER_NAME: &str = "set_flow_label";

/// Capacity of both marking maps
pub const MAX_FLOWS: u32 = 100_000;

/// The IPv6 flow label occupies the low 20 bits of the first header word
pub const FLOW_LABEL_MASK: u32 = 0x000F_FFFF;

/// Marking table key for BPF HashMap compatibility (aya requires Pod trait)
///
/// The IPv6 destination is split into two u64 halves in host order and
/// ports are stored in host order as well. Padding is explicit so the key
/// hashes identically on both sides of the map.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub ip6_hi: u64,
    pub ip6_lo: u64,
    pub dport: u16,
    pub sport: u16,
    pub _pad: u32,
}

impl FourTuple {
    pub const fn new(ip6_hi: u64, ip6_lo: u64, dport: u16, sport: u16) -> Self {
        FourTuple {
            ip6_hi,
            ip6_lo,
            dport,
            sport,
            _pad: 0,
        }
    }

    /// Build from the 16 network-order bytes of an IPv6 address
    pub const fn from_octets(octets: [u8; 16], dport: u16, sport: u16) -> Self {
        let addr = u128::from_be_bytes(octets);
        Self::new((addr >> 64) as u64, addr as u64, dport, sport)
    }

    /// Reassemble the 128-bit destination address
    pub const fn ip6(&self) -> u128 {
        ((self.ip6_hi as u128) << 64) | (self.ip6_lo as u128)
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FourTuple {}
