//! Side-band message framing and catalogue.
//!
//! Every message starts with a 17-byte header:
//!
//! ```text
//! z64: u64 = 0 | z32: u32 = 0 | z16: u16 = 0 | z8: u8 = 0 | version: u8 | kind: u8
//! ```
//!
//! The 15 zero bytes can never open a tagged Ethernet frame (its source MAC
//! and TPID are non-zero), so anything else on the channel is a raw
//! exception frame. Payloads follow packed, little-endian; IP addresses are
//! kept in network byte order.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

use crate::error::ProtocolError;
use crate::proxy::{EthtoolSettings, ProxyKind};

pub const VERSION: u8 = 1;

/// Leading all-zero guard bytes.
pub const GUARD_LEN: usize = 15;

pub const HEADER_LEN: usize = GUARD_LEN + 2;

/// Largest buffer on the channel, message or frame.
pub const MAX_MSG_LEN: usize = 9728;

pub const IFNAMSIZ: usize = 16;

const CHANGE_UPPER_LEN: usize = 9;
const ETHTOOL_FLAGS_LEN: usize = 8;
const ETHTOOL_SETTINGS_LEN: usize = 15;
const LINK_MODES_LEN: usize = 12;
const IFINFO_LEN: usize = 52;
const STAT_LEN: usize = 16;
const SPEED_LEN: usize = 8;
const CARRIER_LEN: usize = 5;
const FIB_LEN: usize = 24;
const NEXT_HOP_LEN: usize = 17;
const FIB6_LEN: usize = 32;
const NEXT_HOP6_LEN: usize = 28;
const IFA_LEN: usize = 16;
const IFA6_LEN: usize = 25;
const NEIGH_LEN: usize = 36;
const NETNS_LEN: usize = 8;

/// Next-hop counts travel in a single byte.
pub const MAX_FIB_NEXT_HOPS: usize = u8::MAX as usize;
pub const MAX_FIB6_SIBLINGS: usize = u8::MAX as usize;

const AF_INET: u8 = 2;
const AF_INET6: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    Break = 0,
    LinkStat = 1,
    EthtoolStat = 2,
    EthtoolFlags = 3,
    EthtoolSettings = 4,
    DumpIfinfo = 5,
    Carrier = 6,
    Speed = 7,
    Ifinfo = 8,
    Ifa = 9,
    DumpFibinfo = 10,
    FibEntry = 11,
    NeighUpdate = 12,
    Ifa6 = 13,
    Fib6Entry = 14,
    ChangeUpperXid = 15,
    EthtoolLinkModesAdvertising = 16,
    NetnsAdd = 17,
    NetnsDel = 18,
}

impl MsgKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MsgKind::*;
        Some(match v {
            0 => Break,
            1 => LinkStat,
            2 => EthtoolStat,
            3 => EthtoolFlags,
            4 => EthtoolSettings,
            5 => DumpIfinfo,
            6 => Carrier,
            7 => Speed,
            8 => Ifinfo,
            9 => Ifa,
            10 => DumpFibinfo,
            11 => FibEntry,
            12 => NeighUpdate,
            13 => Ifa6,
            14 => Fib6Entry,
            15 => ChangeUpperXid,
            16 => EthtoolLinkModesAdvertising,
            17 => NetnsAdd,
            18 => NetnsDel,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Break => "break",
            MsgKind::LinkStat => "link-stat",
            MsgKind::EthtoolStat => "ethtool-stat",
            MsgKind::EthtoolFlags => "ethtool-flags",
            MsgKind::EthtoolSettings => "ethtool-settings",
            MsgKind::DumpIfinfo => "dump-ifinfo",
            MsgKind::Carrier => "carrier",
            MsgKind::Speed => "speed",
            MsgKind::Ifinfo => "ifinfo",
            MsgKind::Ifa => "ifa",
            MsgKind::DumpFibinfo => "dump-fibinfo",
            MsgKind::FibEntry => "fib-entry",
            MsgKind::NeighUpdate => "neigh-update",
            MsgKind::Ifa6 => "ifa6",
            MsgKind::Fib6Entry => "fib6-entry",
            MsgKind::ChangeUpperXid => "change-upper-xid",
            MsgKind::EthtoolLinkModesAdvertising => "ethtool-link-modes-advertising",
            MsgKind::NetnsAdd => "netns-add",
            MsgKind::NetnsDel => "netns-del",
        }
    }
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an `Ifinfo` was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IfinfoReason {
    New = 0,
    Del = 1,
    Up = 2,
    Down = 3,
    Dump = 4,
    Reg = 5,
    Unreg = 6,
    Features = 7,
}

impl IfinfoReason {
    fn from_u8(v: u8) -> Option<Self> {
        use IfinfoReason::*;
        [New, Del, Up, Down, Dump, Reg, Unreg, Features]
            .into_iter()
            .find(|r| *r as u8 == v)
    }
}

/// Address add/remove event, using the kernel's netdev event numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IfaEvent {
    Up = 1,
    Down = 2,
}

impl IfaEvent {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(IfaEvent::Up),
            2 => Some(IfaEvent::Down),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeUpperXid {
    pub upper: u32,
    pub lower: u32,
    pub linking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthtoolFlags {
    pub xid: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthtoolSettingsMsg {
    pub xid: u32,
    pub settings: EthtoolSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkModes {
    pub xid: u32,
    pub modes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifinfo {
    pub ifname: String,
    pub net: u64,
    pub ifindex: i32,
    pub xid: u32,
    pub flags: u32,
    pub addr: [u8; 6],
    pub kind: ProxyKind,
    pub reason: IfinfoReason,
    pub features: u64,
}

/// A link or vendor statistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub xid: u32,
    pub index: u32,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Speed {
    pub xid: u32,
    pub mbps: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carrier {
    pub xid: u32,
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop {
    pub ifindex: i32,
    pub weight: i32,
    pub flags: u32,
    pub gw: Ipv4Addr,
    pub scope: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FibEntry {
    pub net: u64,
    pub prefix: Ipv4Net,
    pub event: u8,
    pub tos: u8,
    pub route_type: u8,
    pub table: u32,
    pub next_hops: Vec<NextHop>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextHop6 {
    pub ifindex: i32,
    pub weight: i32,
    pub flags: u32,
    pub gw: Ipv6Addr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fib6Entry {
    pub net: u64,
    pub prefix: Ipv6Net,
    pub event: u8,
    pub route_type: u8,
    pub table: u32,
    pub next_hop: NextHop6,
    pub siblings: Vec<NextHop6>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ifa {
    pub xid: u32,
    pub event: IfaEvent,
    pub addr: Ipv4Net,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ifa6 {
    pub xid: u32,
    pub event: IfaEvent,
    pub addr: Ipv6Net,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighUpdate {
    pub ifindex: i32,
    pub net: u64,
    pub dst: IpAddr,
    /// `None` when the neighbour is being removed or unresolved.
    pub lladdr: Option<[u8; 6]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Break,
    LinkStat(Stat),
    EthtoolStat(Stat),
    EthtoolFlags(EthtoolFlags),
    EthtoolSettings(EthtoolSettingsMsg),
    DumpIfinfo,
    Carrier(Carrier),
    Speed(Speed),
    Ifinfo(Ifinfo),
    Ifa(Ifa),
    DumpFibinfo,
    FibEntry(FibEntry),
    NeighUpdate(NeighUpdate),
    Ifa6(Ifa6),
    Fib6Entry(Fib6Entry),
    ChangeUpperXid(ChangeUpperXid),
    EthtoolLinkModesAdvertising(LinkModes),
    NetnsAdd(u64),
    NetnsDel(u64),
}

impl Message {
    pub fn kind(&self) -> MsgKind {
        match self {
            Message::Break => MsgKind::Break,
            Message::LinkStat(_) => MsgKind::LinkStat,
            Message::EthtoolStat(_) => MsgKind::EthtoolStat,
            Message::EthtoolFlags(_) => MsgKind::EthtoolFlags,
            Message::EthtoolSettings(_) => MsgKind::EthtoolSettings,
            Message::DumpIfinfo => MsgKind::DumpIfinfo,
            Message::Carrier(_) => MsgKind::Carrier,
            Message::Speed(_) => MsgKind::Speed,
            Message::Ifinfo(_) => MsgKind::Ifinfo,
            Message::Ifa(_) => MsgKind::Ifa,
            Message::DumpFibinfo => MsgKind::DumpFibinfo,
            Message::FibEntry(_) => MsgKind::FibEntry,
            Message::NeighUpdate(_) => MsgKind::NeighUpdate,
            Message::Ifa6(_) => MsgKind::Ifa6,
            Message::Fib6Entry(_) => MsgKind::Fib6Entry,
            Message::ChangeUpperXid(_) => MsgKind::ChangeUpperXid,
            Message::EthtoolLinkModesAdvertising(_) => MsgKind::EthtoolLinkModesAdvertising,
            Message::NetnsAdd(_) => MsgKind::NetnsAdd,
            Message::NetnsDel(_) => MsgKind::NetnsDel,
        }
    }

    /// Header plus payload length.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Message::Break | Message::DumpIfinfo | Message::DumpFibinfo => 0,
                Message::LinkStat(_) | Message::EthtoolStat(_) => STAT_LEN,
                Message::EthtoolFlags(_) => ETHTOOL_FLAGS_LEN,
                Message::EthtoolSettings(_) => ETHTOOL_SETTINGS_LEN,
                Message::Carrier(_) => CARRIER_LEN,
                Message::Speed(_) => SPEED_LEN,
                Message::Ifinfo(_) => IFINFO_LEN,
                Message::Ifa(_) => IFA_LEN,
                Message::FibEntry(e) => FIB_LEN + e.next_hops.len() * NEXT_HOP_LEN,
                Message::NeighUpdate(_) => NEIGH_LEN,
                Message::Ifa6(_) => IFA6_LEN,
                Message::Fib6Entry(e) => {
                    FIB6_LEN + NEXT_HOP6_LEN + e.siblings.len() * NEXT_HOP6_LEN
                }
                Message::ChangeUpperXid(_) => CHANGE_UPPER_LEN,
                Message::EthtoolLinkModesAdvertising(_) => LINK_MODES_LEN,
                Message::NetnsAdd(_) | Message::NetnsDel(_) => NETNS_LEN,
            }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Append the encoded message to `buf`.
    ///
    /// Callers that must not abort on allocation failure reserve
    /// [`Message::encoded_len`] bytes first.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let len = self.encoded_len();
        let too_many_hops = match self {
            Message::FibEntry(e) => e.next_hops.len() > MAX_FIB_NEXT_HOPS,
            Message::Fib6Entry(e) => e.siblings.len() > MAX_FIB6_SIBLINGS,
            _ => false,
        };
        if len > MAX_MSG_LEN || too_many_hops {
            return Err(ProtocolError::TooLarge(len));
        }

        let mut w = Writer(buf);
        w.bytes(&[0; GUARD_LEN]);
        w.u8(VERSION);
        w.u8(self.kind() as u8);

        match self {
            Message::Break | Message::DumpIfinfo | Message::DumpFibinfo => {}
            Message::LinkStat(s) | Message::EthtoolStat(s) => {
                w.u32(s.xid);
                w.u32(s.index);
                w.u64(s.count);
            }
            Message::EthtoolFlags(m) => {
                w.u32(m.xid);
                w.u32(m.flags);
            }
            Message::EthtoolSettings(m) => {
                let s = &m.settings;
                w.u32(m.xid);
                w.u32(s.speed);
                w.u8(s.duplex);
                w.u8(s.port);
                w.u8(s.phy_address);
                w.u8(s.autoneg);
                w.u8(s.mdio_support);
                w.u8(s.eth_tp_mdix);
                w.u8(s.eth_tp_mdix_ctrl);
            }
            Message::Carrier(m) => {
                w.u32(m.xid);
                w.u8(m.on.into());
            }
            Message::Speed(m) => {
                w.u32(m.xid);
                w.u32(m.mbps);
            }
            Message::Ifinfo(m) => {
                let mut name = [0u8; IFNAMSIZ];
                let n = m.ifname.len().min(IFNAMSIZ - 1);
                name[..n].copy_from_slice(&m.ifname.as_bytes()[..n]);
                w.bytes(&name);
                w.u64(m.net);
                w.i32(m.ifindex);
                w.u32(m.xid);
                w.u32(m.flags);
                w.bytes(&m.addr);
                w.u8(m.kind as u8);
                w.u8(m.reason as u8);
                w.u64(m.features);
            }
            Message::Ifa(m) => {
                w.u32(m.xid);
                w.u32(m.event as u32);
                w.bytes(&m.addr.addr().octets());
                w.bytes(&m.addr.netmask().octets());
            }
            Message::FibEntry(m) => {
                w.u64(m.net);
                w.bytes(&m.prefix.addr().octets());
                w.bytes(&m.prefix.netmask().octets());
                w.u8(m.event);
                w.u8(m.next_hops.len() as u8);
                w.u8(m.tos);
                w.u8(m.route_type);
                w.u32(m.table);
                for nh in &m.next_hops {
                    w.i32(nh.ifindex);
                    w.i32(nh.weight);
                    w.u32(nh.flags);
                    w.bytes(&nh.gw.octets());
                    w.u8(nh.scope);
                }
            }
            Message::NeighUpdate(m) => {
                let (family, len, dst) = match m.dst {
                    IpAddr::V4(a) => {
                        let mut dst = [0u8; 16];
                        dst[..4].copy_from_slice(&a.octets());
                        (AF_INET, 4, dst)
                    }
                    IpAddr::V6(a) => (AF_INET6, 16, a.octets()),
                };
                w.i32(m.ifindex);
                w.u64(m.net);
                w.u8(family);
                w.u8(len);
                w.bytes(&dst);
                w.bytes(&m.lladdr.unwrap_or_default());
            }
            Message::Ifa6(m) => {
                w.u32(m.xid);
                w.u32(m.event as u32);
                w.bytes(&m.addr.addr().octets());
                w.u8(m.addr.prefix_len());
            }
            Message::Fib6Entry(m) => {
                w.u64(m.net);
                w.bytes(&m.prefix.addr().octets());
                w.u8(m.prefix.prefix_len());
                w.u8(m.event);
                w.u8(m.siblings.len() as u8);
                w.u8(m.route_type);
                w.u32(m.table);
                for nh in std::iter::once(&m.next_hop).chain(&m.siblings) {
                    w.i32(nh.ifindex);
                    w.i32(nh.weight);
                    w.u32(nh.flags);
                    w.bytes(&nh.gw.octets());
                }
            }
            Message::ChangeUpperXid(m) => {
                w.u32(m.upper);
                w.u32(m.lower);
                w.u8(m.linking.into());
            }
            Message::EthtoolLinkModesAdvertising(m) => {
                w.u32(m.xid);
                w.u64(m.modes);
            }
            Message::NetnsAdd(net) | Message::NetnsDel(net) => w.u64(*net),
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        let kind = decode_header(buf)?;
        let mut r = Reader {
            buf,
            pos: HEADER_LEN,
            kind,
        };

        let msg = match kind {
            MsgKind::Break => Message::Break,
            MsgKind::DumpIfinfo => Message::DumpIfinfo,
            MsgKind::DumpFibinfo => Message::DumpFibinfo,
            MsgKind::LinkStat => Message::LinkStat(r.stat()?),
            MsgKind::EthtoolStat => Message::EthtoolStat(r.stat()?),
            MsgKind::EthtoolFlags => Message::EthtoolFlags(EthtoolFlags {
                xid: r.u32()?,
                flags: r.u32()?,
            }),
            MsgKind::EthtoolSettings => {
                let xid = r.u32()?;
                let settings = EthtoolSettings {
                    speed: r.u32()?,
                    duplex: r.u8()?,
                    port: r.u8()?,
                    phy_address: r.u8()?,
                    autoneg: r.u8()?,
                    mdio_support: r.u8()?,
                    eth_tp_mdix: r.u8()?,
                    eth_tp_mdix_ctrl: r.u8()?,
                };
                Message::EthtoolSettings(EthtoolSettingsMsg { xid, settings })
            }
            MsgKind::Carrier => Message::Carrier(Carrier {
                xid: r.u32()?,
                on: r.u8()? != 0,
            }),
            MsgKind::Speed => Message::Speed(Speed {
                xid: r.u32()?,
                mbps: r.u32()?,
            }),
            MsgKind::Ifinfo => {
                let name: [u8; IFNAMSIZ] = r.array()?;
                let end = name.iter().position(|b| *b == 0).unwrap_or(IFNAMSIZ);
                let ifname = String::from_utf8_lossy(&name[..end]).into_owned();
                let net = r.u64()?;
                let ifindex = r.i32()?;
                let xid = r.u32()?;
                let flags = r.u32()?;
                let addr = r.array()?;
                let raw_kind = r.u8()?;
                let kind = ProxyKind::from_u8(raw_kind).ok_or(r.bad("kind", raw_kind.into()))?;
                let raw_reason = r.u8()?;
                let reason =
                    IfinfoReason::from_u8(raw_reason).ok_or(r.bad("reason", raw_reason.into()))?;
                let features = r.u64()?;
                Message::Ifinfo(Ifinfo {
                    ifname,
                    net,
                    ifindex,
                    xid,
                    flags,
                    addr,
                    kind,
                    reason,
                    features,
                })
            }
            MsgKind::Ifa => {
                let xid = r.u32()?;
                let event = r.ifa_event()?;
                let addr = Ipv4Addr::from(r.array::<4>()?);
                let mask = Ipv4Addr::from(r.array::<4>()?);
                let addr = Ipv4Net::new(addr, r.mask_len(mask)?)
                    .map_err(|_| r.bad("mask", u32::from(mask).into()))?;
                Message::Ifa(Ifa { xid, event, addr })
            }
            MsgKind::FibEntry => {
                let net = r.u64()?;
                let addr = Ipv4Addr::from(r.array::<4>()?);
                let mask = Ipv4Addr::from(r.array::<4>()?);
                let prefix = Ipv4Net::new(addr, r.mask_len(mask)?)
                    .map_err(|_| r.bad("mask", u32::from(mask).into()))?;
                let event = r.u8()?;
                let nhs = r.u8()?;
                let tos = r.u8()?;
                let route_type = r.u8()?;
                let table = r.u32()?;
                let mut next_hops = Vec::with_capacity(nhs.into());
                for _ in 0..nhs {
                    next_hops.push(NextHop {
                        ifindex: r.i32()?,
                        weight: r.i32()?,
                        flags: r.u32()?,
                        gw: Ipv4Addr::from(r.array::<4>()?),
                        scope: r.u8()?,
                    });
                }
                Message::FibEntry(FibEntry {
                    net,
                    prefix,
                    event,
                    tos,
                    route_type,
                    table,
                    next_hops,
                })
            }
            MsgKind::NeighUpdate => {
                let ifindex = r.i32()?;
                let net = r.u64()?;
                let family = r.u8()?;
                let _len = r.u8()?;
                let dst: [u8; 16] = r.array()?;
                let dst = match family {
                    AF_INET => IpAddr::V4(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3])),
                    AF_INET6 => IpAddr::V6(Ipv6Addr::from(dst)),
                    other => return Err(r.bad("family", other.into())),
                };
                let lladdr: [u8; 6] = r.array()?;
                let lladdr = (lladdr != [0; 6]).then_some(lladdr);
                Message::NeighUpdate(NeighUpdate {
                    ifindex,
                    net,
                    dst,
                    lladdr,
                })
            }
            MsgKind::Ifa6 => {
                let xid = r.u32()?;
                let event = r.ifa_event()?;
                let addr = Ipv6Addr::from(r.array::<16>()?);
                let len = r.u8()?;
                let addr = Ipv6Net::new(addr, len).map_err(|_| r.bad("length", len.into()))?;
                Message::Ifa6(Ifa6 { xid, event, addr })
            }
            MsgKind::Fib6Entry => {
                let net = r.u64()?;
                let addr = Ipv6Addr::from(r.array::<16>()?);
                let len = r.u8()?;
                let prefix = Ipv6Net::new(addr, len).map_err(|_| r.bad("length", len.into()))?;
                let event = r.u8()?;
                let nsiblings = r.u8()?;
                let route_type = r.u8()?;
                let table = r.u32()?;
                let next_hop = r.next_hop6()?;
                let mut siblings = Vec::with_capacity(nsiblings.into());
                for _ in 0..nsiblings {
                    siblings.push(r.next_hop6()?);
                }
                Message::Fib6Entry(Fib6Entry {
                    net,
                    prefix,
                    event,
                    route_type,
                    table,
                    next_hop,
                    siblings,
                })
            }
            MsgKind::ChangeUpperXid => Message::ChangeUpperXid(ChangeUpperXid {
                upper: r.u32()?,
                lower: r.u32()?,
                linking: r.u8()? != 0,
            }),
            MsgKind::EthtoolLinkModesAdvertising => {
                Message::EthtoolLinkModesAdvertising(LinkModes {
                    xid: r.u32()?,
                    modes: r.u64()?,
                })
            }
            MsgKind::NetnsAdd => Message::NetnsAdd(r.u64()?),
            MsgKind::NetnsDel => Message::NetnsDel(r.u64()?),
        };
        Ok(msg)
    }
}

/// Whether `buf` opens with the message guard (as far as it goes).
pub fn has_guard(buf: &[u8]) -> bool {
    let n = buf.len().min(GUARD_LEN);
    n > 0 && buf[..n].iter().all(|b| *b == 0)
}

/// Validate the header and return the message kind.
pub fn decode_header(buf: &[u8]) -> Result<MsgKind, ProtocolError> {
    if !has_guard(buf) {
        return Err(ProtocolError::NotAMessage);
    }
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::ShortHeader(buf.len()));
    }
    if buf.len() > MAX_MSG_LEN {
        return Err(ProtocolError::TooLarge(buf.len()));
    }
    let version = buf[GUARD_LEN];
    if version != VERSION {
        return Err(ProtocolError::VersionMismatch {
            got: version,
            want: VERSION,
        });
    }
    let raw = buf[GUARD_LEN + 1];
    MsgKind::from_u8(raw).ok_or(ProtocolError::UnknownKind(raw))
}

struct Writer<'a>(&'a mut Vec<u8>);

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.0.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.0.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.0.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: MsgKind,
}

impl Reader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], ProtocolError> {
        let end = self.pos + n;
        let Some(bytes) = self.buf.get(self.pos..end) else {
            return Err(ProtocolError::Truncated {
                kind: self.kind,
                len: self.buf.len(),
                need: end,
            });
        };
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn stat(&mut self) -> Result<Stat, ProtocolError> {
        Ok(Stat {
            xid: self.u32()?,
            index: self.u32()?,
            count: self.u64()?,
        })
    }

    fn ifa_event(&mut self) -> Result<IfaEvent, ProtocolError> {
        let raw = self.u32()?;
        IfaEvent::from_u32(raw).ok_or(self.bad("event", raw.into()))
    }

    fn next_hop6(&mut self) -> Result<NextHop6, ProtocolError> {
        Ok(NextHop6 {
            ifindex: self.i32()?,
            weight: self.i32()?,
            flags: self.u32()?,
            gw: Ipv6Addr::from(self.array::<16>()?),
        })
    }

    /// Prefix length of a contiguous netmask.
    fn mask_len(&self, mask: Ipv4Addr) -> Result<u8, ProtocolError> {
        let m = u32::from(mask);
        let len = m.leading_ones();
        if m.count_ones() != len {
            return Err(self.bad("mask", m.into()));
        }
        Ok(len as u8)
    }

    fn bad(&self, field: &'static str, value: u64) -> ProtocolError {
        ProtocolError::BadValue {
            kind: self.kind,
            field,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let buf = msg.encode().unwrap();
        assert_eq!(buf.len(), msg.encoded_len(), "{}", msg.kind());
        assert_eq!(Message::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn test_header_layout() {
        let buf = Message::Break.encode().unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        assert!(buf[..GUARD_LEN].iter().all(|b| *b == 0));
        assert_eq!(buf[GUARD_LEN], VERSION);
        assert_eq!(buf[GUARD_LEN + 1], MsgKind::Break as u8);
    }

    #[test]
    fn test_payload_is_little_endian() {
        let buf = Message::Speed(Speed {
            xid: 0x0102_0304,
            mbps: 100_000,
        })
        .encode()
        .unwrap();
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + 4], &[4, 3, 2, 1]);
        assert_eq!(&buf[HEADER_LEN + 4..], &100_000u32.to_le_bytes());
    }

    #[test]
    fn test_ifinfo_roundtrip_and_name_truncation() {
        roundtrip(Message::Ifinfo(Ifinfo {
            ifname: "xeth1-1".to_string(),
            net: 1,
            ifindex: 42,
            xid: 3999,
            flags: 0x1043,
            addr: [2, 0, 0, 0, 0, 1],
            kind: ProxyKind::Port,
            reason: IfinfoReason::Dump,
            features: 0xdead_beef,
        }));

        let long = Message::Ifinfo(Ifinfo {
            ifname: "abcdefghijklmnopqrstuvwxyz".to_string(),
            net: 1,
            ifindex: 1,
            xid: 1,
            flags: 0,
            addr: [0; 6],
            kind: ProxyKind::Lag,
            reason: IfinfoReason::New,
            features: 0,
        });
        match Message::decode(&long.encode().unwrap()).unwrap() {
            Message::Ifinfo(info) => assert_eq!(info.ifname, "abcdefghijklmno"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_route_messages_roundtrip() {
        roundtrip(Message::FibEntry(FibEntry {
            net: 1,
            prefix: "10.1.0.0/16".parse().unwrap(),
            event: 1,
            tos: 0,
            route_type: 1,
            table: 254,
            next_hops: vec![
                NextHop {
                    ifindex: 5,
                    weight: 1,
                    flags: 0,
                    gw: Ipv4Addr::new(10, 0, 0, 1),
                    scope: 0,
                },
                NextHop {
                    ifindex: 6,
                    weight: 2,
                    flags: 4,
                    gw: Ipv4Addr::new(10, 0, 0, 2),
                    scope: 253,
                },
            ],
        }));
        roundtrip(Message::Fib6Entry(Fib6Entry {
            net: 1,
            prefix: "2001:db8::/32".parse().unwrap(),
            event: 1,
            route_type: 1,
            table: 254,
            next_hop: NextHop6 {
                ifindex: 5,
                weight: 1,
                flags: 0,
                gw: "fe80::1".parse().unwrap(),
            },
            siblings: vec![NextHop6 {
                ifindex: 6,
                weight: 1,
                flags: 0,
                gw: "fe80::2".parse().unwrap(),
            }],
        }));
        roundtrip(Message::NeighUpdate(NeighUpdate {
            ifindex: 9,
            net: 1,
            dst: "192.168.1.7".parse().unwrap(),
            lladdr: Some([0, 1, 2, 3, 4, 5]),
        }));
        roundtrip(Message::NeighUpdate(NeighUpdate {
            ifindex: 9,
            net: 3,
            dst: "2001:db8::7".parse().unwrap(),
            lladdr: None,
        }));
    }

    #[test]
    fn test_address_messages_roundtrip() {
        roundtrip(Message::Ifa(Ifa {
            xid: 3999,
            event: IfaEvent::Up,
            addr: "10.0.0.1/24".parse().unwrap(),
        }));
        roundtrip(Message::Ifa6(Ifa6 {
            xid: 3999,
            event: IfaEvent::Down,
            addr: "2001:db8::1/64".parse().unwrap(),
        }));
    }

    #[test]
    fn test_short_header() {
        let buf = Message::Break.encode().unwrap();
        assert_eq!(
            Message::decode(&buf[..HEADER_LEN - 1]),
            Err(ProtocolError::ShortHeader(HEADER_LEN - 1))
        );
    }

    #[test]
    fn test_version_mismatch() {
        let mut buf = Message::NetnsAdd(7).encode().unwrap();
        buf[GUARD_LEN] = VERSION + 1;
        assert_eq!(
            Message::decode(&buf),
            Err(ProtocolError::VersionMismatch {
                got: VERSION + 1,
                want: VERSION
            })
        );
    }

    #[test]
    fn test_unknown_kind_and_guard() {
        let mut buf = Message::Break.encode().unwrap();
        buf[GUARD_LEN + 1] = 200;
        assert_eq!(Message::decode(&buf), Err(ProtocolError::UnknownKind(200)));

        buf[3] = 1;
        assert_eq!(Message::decode(&buf), Err(ProtocolError::NotAMessage));
        assert!(!has_guard(&[]));
    }

    #[test]
    fn test_truncated_payload() {
        let buf = Message::Carrier(Carrier { xid: 1, on: true })
            .encode()
            .unwrap();
        assert_eq!(
            Message::decode(&buf[..buf.len() - 1]),
            Err(ProtocolError::Truncated {
                kind: MsgKind::Carrier,
                len: HEADER_LEN + CARRIER_LEN - 1,
                need: HEADER_LEN + CARRIER_LEN,
            })
        );
    }

    #[test]
    fn test_bad_mask_rejected() {
        let mut buf = Message::Ifa(Ifa {
            xid: 1,
            event: IfaEvent::Up,
            addr: "10.0.0.1/24".parse().unwrap(),
        })
        .encode()
        .unwrap();
        // 255.0.255.0 is not contiguous.
        buf[HEADER_LEN + 12..HEADER_LEN + 16].copy_from_slice(&[255, 0, 255, 0]);
        assert!(matches!(
            Message::decode(&buf),
            Err(ProtocolError::BadValue { field: "mask", .. })
        ));
    }

    #[test]
    fn test_fib_entry_size_limit() {
        let hop = NextHop {
            ifindex: 1,
            weight: 1,
            flags: 0,
            gw: Ipv4Addr::LOCALHOST,
            scope: 0,
        };
        let mut entry = FibEntry {
            net: 1,
            prefix: "0.0.0.0/0".parse().unwrap(),
            event: 1,
            tos: 0,
            route_type: 1,
            table: 254,
            next_hops: vec![hop; 255],
        };
        let buf = Message::FibEntry(entry.clone()).encode().unwrap();
        assert!(buf.len() <= MAX_MSG_LEN);

        entry.next_hops = vec![hop; MAX_FIB_NEXT_HOPS + 1];
        assert!(matches!(
            Message::FibEntry(entry).encode(),
            Err(ProtocolError::TooLarge(_))
        ));
    }

    #[test]
    fn test_payload_sizes() {
        let settings = Message::EthtoolSettings(EthtoolSettingsMsg {
            xid: 1,
            settings: EthtoolSettings::default(),
        });
        assert_eq!(settings.encoded_len(), HEADER_LEN + 15);
        roundtrip(settings);
        roundtrip(Message::ChangeUpperXid(ChangeUpperXid {
            upper: 3000,
            lower: 3999,
            linking: true,
        }));
        roundtrip(Message::EthtoolLinkModesAdvertising(LinkModes {
            xid: 3999,
            modes: 1 << 40,
        }));
    }
}
