//! VLAN tag encapsulation for multiplexed frames.
//!
//! Single-level proxies carry their xid in one 802.1Q tag. VLAN proxies use
//! two tags: an 802.1ad provider tag with the low 12 bits of the xid (the
//! port or lag underneath) and an 802.1Q tag with the high bits (the VLAN
//! id).

use std::hash::{DefaultHasher, Hash, Hasher};

use smoltcp::wire::EthernetFrame;

use crate::proxy::ProxyKind;
use crate::xid::{self, VID_BITS, VID_MASK};

pub const ETH_ALEN: usize = 6;
pub const ETH_HLEN: usize = 14;
pub const VLAN_HLEN: usize = 4;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88a8;

/// Smallest frame that can carry a tag: MAC header plus one tag.
pub const MIN_TAGGED_LEN: usize = ETH_HLEN + VLAN_HLEN;

/// Offset of the first tag (after destination and source MAC).
const TAG_OFFSET: usize = 2 * ETH_ALEN;

const PCP_SHIFT: u16 = 13;
const DEI_BIT: u16 = 1 << 12;

/// Tags a proxy's frames carry on the lowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encap {
    Single { vid: u16 },
    Double { outer: u16, inner: u16 },
}

impl Encap {
    pub fn for_proxy(kind: ProxyKind, xid: u32) -> Self {
        match kind {
            ProxyKind::Vlan => Encap::Double {
                outer: xid::low(xid),
                inner: xid::high(xid),
            },
            _ => Encap::Single { vid: xid::low(xid) },
        }
    }

    pub fn xid(&self) -> u32 {
        match *self {
            Encap::Single { vid } => u32::from(vid),
            Encap::Double { outer, inner } => u32::from(outer) | (u32::from(inner) << VID_BITS),
        }
    }

    /// Bytes of tag this encapsulation adds.
    pub fn tag_len(&self) -> usize {
        match self {
            Encap::Single { .. } => VLAN_HLEN,
            Encap::Double { .. } => 2 * VLAN_HLEN,
        }
    }
}

/// One decoded VLAN tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub tpid: u16,
    pub pcp: u8,
    pub dei: bool,
    pub vid: u16,
}

impl Tag {
    pub fn new(tpid: u16, pcp: u8, vid: u16) -> Self {
        Self {
            tpid,
            pcp: pcp & 0x7,
            dei: false,
            vid: vid & VID_MASK as u16,
        }
    }

    pub fn tci(&self) -> u16 {
        let dei = if self.dei { DEI_BIT } else { 0 };
        (u16::from(self.pcp & 0x7) << PCP_SHIFT) | dei | (self.vid & VID_MASK as u16)
    }

    fn from_wire(tpid: u16, tci: u16) -> Self {
        Self {
            tpid,
            pcp: (tci >> PCP_SHIFT) as u8,
            dei: tci & DEI_BIT != 0,
            vid: tci & VID_MASK as u16,
        }
    }

    fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.tpid.to_be_bytes());
        out.extend_from_slice(&self.tci().to_be_bytes());
    }
}

pub fn is_vlan_tpid(ethertype: u16) -> bool {
    ethertype == ETH_P_8021Q || ethertype == ETH_P_8021AD
}

/// Why a frame could not be decapsulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Shorter than a MAC header plus one tag.
    TooShort(usize),
}

/// Result of parsing a frame received from a lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// No VLAN tag: not mux traffic.
    Untagged,
    Tagged {
        outer: Tag,
        inner: Option<Tag>,
        /// xid from the VLAN id field(s).
        xid: u32,
        /// Total tag bytes following the MAC addresses.
        tag_len: usize,
    },
}

/// Build the wire frame for `frame` sent by a proxy with encapsulation `encap`.
///
/// Returns `None` when `frame` is shorter than a MAC header.
pub fn encapsulate(frame: &[u8], encap: Encap, pcp: u8) -> Option<Vec<u8>> {
    if frame.len() < ETH_HLEN {
        return None;
    }
    let mut out = Vec::with_capacity(frame.len() + encap.tag_len());
    out.extend_from_slice(&frame[..TAG_OFFSET]);
    match encap {
        Encap::Single { vid } => Tag::new(ETH_P_8021Q, pcp, vid).emit(&mut out),
        Encap::Double { outer, inner } => {
            Tag::new(ETH_P_8021AD, pcp, outer).emit(&mut out);
            Tag::new(ETH_P_8021Q, pcp, inner).emit(&mut out);
        }
    }
    out.extend_from_slice(&frame[TAG_OFFSET..]);
    Some(out)
}

/// Parse the tag(s) of a frame received on a lower.
///
/// The inner tag only counts when the outer one is a provider (802.1ad) tag.
pub fn decode(frame: &[u8]) -> Result<Decoded, FrameError> {
    let eth = EthernetFrame::new_checked(frame).map_err(|_| FrameError::TooShort(frame.len()))?;
    let ethertype = u16::from(eth.ethertype());
    if !is_vlan_tpid(ethertype) {
        return Ok(Decoded::Untagged);
    }
    if frame.len() < MIN_TAGGED_LEN {
        return Err(FrameError::TooShort(frame.len()));
    }

    let outer = Tag::from_wire(ethertype, be16(frame, ETH_HLEN));
    let mut xid = u32::from(outer.vid);
    let mut tag_len = VLAN_HLEN;
    let mut inner = None;

    let next = TAG_OFFSET + VLAN_HLEN;
    if outer.tpid == ETH_P_8021AD && frame.len() >= next + 2 + VLAN_HLEN {
        let tpid = be16(frame, next);
        if tpid == ETH_P_8021Q {
            let tag = Tag::from_wire(tpid, be16(frame, next + 2));
            xid |= u32::from(tag.vid) << VID_BITS;
            tag_len += VLAN_HLEN;
            inner = Some(tag);
        }
    }

    Ok(Decoded::Tagged {
        outer,
        inner,
        xid,
        tag_len,
    })
}

/// Drop `tag_len` bytes of tag, keeping the MAC header ahead of the payload.
pub fn strip(frame: &[u8], tag_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(frame.len().saturating_sub(tag_len));
    out.extend_from_slice(&frame[..TAG_OFFSET]);
    if let Some(rest) = frame.get(TAG_OFFSET + tag_len..) {
        out.extend_from_slice(rest);
    }
    out
}

/// Rewrite the PCP of the outermost tag in place.
pub fn set_outer_pcp(frame: &mut [u8], pcp: u8) -> bool {
    if frame.len() < MIN_TAGGED_LEN || !is_vlan_tpid(be16(frame, TAG_OFFSET)) {
        return false;
    }
    let tci = be16(frame, ETH_HLEN) & !(0x7 << PCP_SHIFT) | (u16::from(pcp & 0x7) << PCP_SHIFT);
    frame[ETH_HLEN..ETH_HLEN + 2].copy_from_slice(&tci.to_be_bytes());
    true
}

/// Hash used to pin a flow to one lower.
///
/// Frames that already carry a tag hash on its VLAN id; everything else
/// hashes the MAC addresses and EtherType.
pub fn flow_hash(frame: &[u8]) -> u32 {
    if frame.len() >= MIN_TAGGED_LEN && is_vlan_tpid(be16(frame, TAG_OFFSET)) {
        return u32::from(be16(frame, ETH_HLEN) & VID_MASK as u16);
    }
    let mut h = DefaultHasher::new();
    frame[..frame.len().min(ETH_HLEN)].hash(&mut h);
    h.finish() as u32
}

fn be16(frame: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}
