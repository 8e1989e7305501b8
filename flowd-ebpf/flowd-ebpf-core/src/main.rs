#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::TC_ACT_OK,
    macros::{classifier, map},
    maps::HashMap,
    programs::TcContext,
};
use flowd_common::{FourTuple, FLOW_LABEL_MASK, MAX_FLOWS};

const ETH_HLEN: usize = 14;
const VLAN_HLEN: usize = 4;
const IPV6_HLEN: usize = 40;
const ETH_P_IPV6: u16 = 0x86DD;
const ETH_P_8021Q: u16 = 0x8100;
const IPPROTO_TCP: u8 = 6;

#[map]
static FLOW_LABELS: HashMap<FourTuple, u32> = HashMap::with_max_entries(MAX_FLOWS, 0);

// Userspace flags a key here on flow end; the next matching packet removes it
#[map]
static TO_BE_DELETED: HashMap<FourTuple, u32> = HashMap::with_max_entries(MAX_FLOWS, 0);

#[classifier]
pub fn set_flow_label(mut ctx: TcContext) -> i32 {
    // Packets are never dropped, only relabelled
    let _ = try_set_flow_label(&mut ctx);
    TC_ACT_OK
}

#[inline(always)]
fn try_set_flow_label(ctx: &mut TcContext) -> Result<(), i64> {
    let mut l3 = ETH_HLEN;
    let mut ether_type = u16::from_be(ctx.load::<u16>(12)?);
    if ether_type == ETH_P_8021Q {
        ether_type = u16::from_be(ctx.load::<u16>(ETH_HLEN + 2)?);
        l3 += VLAN_HLEN;
    }
    if ether_type != ETH_P_IPV6 {
        return Ok(());
    }

    let next_header: u8 = ctx.load(l3 + 6)?;
    if next_header != IPPROTO_TCP {
        return Ok(());
    }

    let daddr: [u8; 16] = ctx.load(l3 + 24)?;
    let l4 = l3 + IPV6_HLEN;
    let sport = u16::from_be(ctx.load::<u16>(l4)?);
    let dport = u16::from_be(ctx.load::<u16>(l4 + 2)?);
    let key = FourTuple::from_octets(daddr, dport, sport);

    if unsafe { TO_BE_DELETED.get(&key) }.is_some() {
        let _ = FLOW_LABELS.remove(&key);
        let _ = TO_BE_DELETED.remove(&key);
        return Ok(());
    }

    let label = match unsafe { FLOW_LABELS.get(&key) } {
        Some(label) => *label,
        None => return Ok(()),
    };

    // version:4 | traffic class:8 | flow label:20
    let word = u32::from_be(ctx.load::<u32>(l3)?);
    let word = (word & !FLOW_LABEL_MASK) | (label & FLOW_LABEL_MASK);
    ctx.store(l3, &word.to_be(), 0)?;
    Ok(())
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
