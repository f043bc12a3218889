//! Proxy interfaces: the host-side stand-ins for ASIC ports, VLANs, lags,
//! bridges and loopbacks.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::dataplane::encap::Encap;
use crate::dev::NetDevice;
use crate::link_stats::LinkStats;
use crate::sb::msg::{Ifa, Ifa6, IfaEvent, Ifinfo, IfinfoReason, Message};

/// Namespace id of the main network namespace.
pub const MAIN_NETNS: u64 = 1;

/// Maximum ports in one lag.
pub const MAX_LAG_MEMBERS: usize = 8;

/// Maximum vendor statistics per port.
pub const MAX_ETHTOOL_STATS: usize = 512;

/// Interface flag bits reported in `Ifinfo`.
pub mod iff {
    pub const UP: u32 = 0x1;
    pub const BROADCAST: u32 = 0x2;
    pub const RUNNING: u32 = 0x40;
    pub const MASTER: u32 = 0x400;
    pub const SLAVE: u32 = 0x800;
    pub const MULTICAST: u32 = 0x1000;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ProxyKind {
    Port = 1,
    Vlan = 2,
    Bridge = 3,
    Lag = 4,
    Loopback = 5,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Port => "port",
            ProxyKind::Vlan => "vlan",
            ProxyKind::Bridge => "bridge",
            ProxyKind::Lag => "lag",
            ProxyKind::Loopback => "loopback",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(ProxyKind::Port),
            2 => Some(ProxyKind::Vlan),
            3 => Some(ProxyKind::Bridge),
            4 => Some(ProxyKind::Lag),
            5 => Some(ProxyKind::Loopback),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "port" => Ok(ProxyKind::Port),
            "vlan" => Ok(ProxyKind::Vlan),
            "bridge" => Ok(ProxyKind::Bridge),
            "lag" => Ok(ProxyKind::Lag),
            "loopback" => Ok(ProxyKind::Loopback),
            _ => Err(format!("Invalid proxy kind: {}", s)),
        }
    }
}

/// Link settings as carried by `EthtoolSettings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthtoolSettings {
    pub speed: u32,
    pub duplex: u8,
    pub port: u8,
    pub phy_address: u8,
    pub autoneg: u8,
    pub mdio_support: u8,
    pub eth_tp_mdix: u8,
    pub eth_tp_mdix_ctrl: u8,
}

impl EthtoolSettings {
    pub const DUPLEX_FULL: u8 = 1;
    pub const PORT_OTHER: u8 = 0xff;
    pub const AUTONEG_ENABLE: u8 = 1;

    pub fn autoneg(&self) -> bool {
        self.autoneg == Self::AUTONEG_ENABLE
    }
}

impl Default for EthtoolSettings {
    fn default() -> Self {
        Self {
            speed: 0,
            duplex: Self::DUPLEX_FULL,
            port: Self::PORT_OTHER,
            phy_address: 0,
            autoneg: Self::AUTONEG_ENABLE,
            mdio_support: 0,
            eth_tp_mdix: 0,
            eth_tp_mdix_ctrl: 0,
        }
    }
}

/// State only ports carry.
pub struct PortState {
    settings: Mutex<EthtoolSettings>,
    advertising: AtomicU64,
    flags: AtomicU32,
    stats: Box<[AtomicU64]>,
}

impl PortState {
    pub fn new(n_stats: usize) -> Self {
        Self {
            settings: Mutex::new(EthtoolSettings::default()),
            advertising: AtomicU64::new(0),
            flags: AtomicU32::new(0),
            stats: (0..n_stats.min(MAX_ETHTOOL_STATS))
                .map(|_| AtomicU64::new(0))
                .collect(),
        }
    }

    pub fn settings(&self) -> EthtoolSettings {
        *self.settings.lock().unwrap()
    }

    pub fn set_settings(&self, s: EthtoolSettings) {
        *self.settings.lock().unwrap() = s;
    }

    pub fn set_speed(&self, mbps: u32) {
        self.settings.lock().unwrap().speed = mbps;
    }

    pub fn advertising(&self) -> u64 {
        self.advertising.load(Ordering::Relaxed)
    }

    pub fn set_advertising(&self, modes: u64) {
        self.advertising.store(modes, Ordering::Relaxed);
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Relaxed);
    }

    pub fn stat(&self, index: usize) -> Option<u64> {
        self.stats.get(index).map(|s| s.load(Ordering::Relaxed))
    }

    /// Returns false if `index` is past the configured stat table.
    pub fn set_stat(&self, index: u32, count: u64) -> bool {
        match self.stats.get(index as usize) {
            Some(s) => {
                s.store(count, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn n_stats(&self) -> usize {
        self.stats.len()
    }

    fn reset_stats(&self) {
        for s in self.stats.iter() {
            s.store(0, Ordering::Relaxed);
        }
    }
}

/// Lower members of a lag or bridge, in join order.
#[derive(Debug, Default)]
pub struct Members {
    xids: Mutex<Vec<u32>>,
}

impl Members {
    pub fn list(&self) -> Vec<u32> {
        self.xids.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.xids.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.xids.lock().unwrap().contains(&xid)
    }

    pub(crate) fn add(&self, xid: u32) {
        let mut xids = self.xids.lock().unwrap();
        if !xids.contains(&xid) {
            xids.push(xid);
        }
    }

    pub(crate) fn remove(&self, xid: u32) -> bool {
        let mut xids = self.xids.lock().unwrap();
        let before = xids.len();
        xids.retain(|x| *x != xid);
        xids.len() != before
    }
}

/// Per-kind state.
pub enum ProxyVariant {
    Port(PortState),
    Vlan { lower: u32, vid: u16 },
    Lag(Members),
    Bridge(Members),
    Loopback,
}

impl ProxyVariant {
    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyVariant::Port(_) => ProxyKind::Port,
            ProxyVariant::Vlan { .. } => ProxyKind::Vlan,
            ProxyVariant::Lag(_) => ProxyKind::Lag,
            ProxyVariant::Bridge(_) => ProxyKind::Bridge,
            ProxyVariant::Loopback => ProxyKind::Loopback,
        }
    }
}

/// An address object configured on a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfAddr {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

/// Behaviour every proxy kind provides to the mux.
pub trait ProxyOps {
    fn kind(&self) -> ProxyKind;

    fn xid(&self) -> u32;

    /// Interface brought administratively up.
    fn on_open(&self) -> io::Result<()>;

    /// Interface brought administratively down.
    fn on_close(&self) -> io::Result<()>;

    /// Encapsulation for an outbound frame, or `None` if the proxy cannot
    /// transmit right now.
    fn on_transmit(&self) -> Option<Encap>;
}

pub struct Proxy {
    xid: u32,
    name: String,
    device: Arc<dyn NetDevice>,
    variant: ProxyVariant,
    link_stats: LinkStats,
    admin_up: AtomicBool,
    carrier: AtomicBool,
    netns: AtomicU64,
    upper: AtomicU32,
    features: AtomicU64,
    addrs: Mutex<Vec<IfAddr>>,
}

impl Proxy {
    pub fn new(xid: u32, device: Arc<dyn NetDevice>, variant: ProxyVariant) -> Self {
        Self {
            xid,
            name: device.name().to_string(),
            device,
            variant,
            link_stats: LinkStats::new(),
            admin_up: AtomicBool::new(false),
            carrier: AtomicBool::new(false),
            netns: AtomicU64::new(MAIN_NETNS),
            upper: AtomicU32::new(0),
            features: AtomicU64::new(0),
            addrs: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &Arc<dyn NetDevice> {
        &self.device
    }

    pub fn ifindex(&self) -> u32 {
        self.device.ifindex()
    }

    pub fn variant(&self) -> &ProxyVariant {
        &self.variant
    }

    pub fn port(&self) -> Option<&PortState> {
        match &self.variant {
            ProxyVariant::Port(p) => Some(p),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&Members> {
        match &self.variant {
            ProxyVariant::Lag(m) | ProxyVariant::Bridge(m) => Some(m),
            _ => None,
        }
    }

    /// For VLANs, the xid of the port or lag underneath.
    pub fn vlan_lower(&self) -> Option<u32> {
        match self.variant {
            ProxyVariant::Vlan { lower, .. } => Some(lower),
            _ => None,
        }
    }

    /// Whether a proxy of kind `lower` may join this one.
    pub fn accepts_member(&self, lower: ProxyKind) -> bool {
        match self.variant {
            ProxyVariant::Lag(_) => lower == ProxyKind::Port,
            ProxyVariant::Bridge(_) => {
                matches!(lower, ProxyKind::Port | ProxyKind::Vlan | ProxyKind::Lag)
            }
            _ => false,
        }
    }

    pub fn link_stats(&self) -> &LinkStats {
        &self.link_stats
    }

    /// Zero link stats and, for ports, vendor stats.
    pub fn reset_stats(&self) {
        self.link_stats.reset();
        if let Some(port) = self.port() {
            port.reset_stats();
        }
    }

    pub fn is_up(&self) -> bool {
        self.admin_up.load(Ordering::SeqCst)
    }

    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::SeqCst)
    }

    /// Store the carrier flag, then propagate it to the host interface.
    pub fn set_carrier(&self, on: bool) -> io::Result<()> {
        self.carrier.store(on, Ordering::SeqCst);
        self.device.set_carrier(on)
    }

    pub fn netns(&self) -> u64 {
        self.netns.load(Ordering::Relaxed)
    }

    pub fn set_netns(&self, net: u64) {
        self.netns.store(net, Ordering::Relaxed);
    }

    /// xid of the lag or bridge this proxy belongs to, 0 if none.
    pub fn upper(&self) -> u32 {
        self.upper.load(Ordering::SeqCst)
    }

    pub(crate) fn set_upper(&self, xid: u32) {
        self.upper.store(xid, Ordering::SeqCst);
    }

    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Relaxed)
    }

    pub fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Relaxed);
    }

    pub fn addrs(&self) -> Vec<IfAddr> {
        self.addrs.lock().unwrap().clone()
    }

    /// Returns false if the address was already present.
    pub fn add_addr(&self, addr: IfAddr) -> bool {
        let mut addrs = self.addrs.lock().unwrap();
        if addrs.contains(&addr) {
            return false;
        }
        addrs.push(addr);
        true
    }

    pub fn del_addr(&self, addr: IfAddr) -> bool {
        let mut addrs = self.addrs.lock().unwrap();
        let before = addrs.len();
        addrs.retain(|a| *a != addr);
        addrs.len() != before
    }

    pub fn flags(&self) -> u32 {
        let mut flags = iff::BROADCAST | iff::MULTICAST;
        if self.is_up() {
            flags |= iff::UP;
        }
        if self.carrier() {
            flags |= iff::RUNNING;
        }
        if matches!(self.variant, ProxyVariant::Lag(_)) {
            flags |= iff::MASTER;
        }
        if self.upper() != 0 {
            flags |= iff::SLAVE;
        }
        flags
    }

    pub fn ifinfo(&self, reason: IfinfoReason) -> Ifinfo {
        Ifinfo {
            ifname: self.name.clone(),
            net: self.netns(),
            ifindex: self.ifindex() as i32,
            xid: self.xid,
            flags: self.flags(),
            addr: self.device.mac(),
            kind: self.kind(),
            reason,
            features: self.features(),
        }
    }

    /// `Ifa`/`Ifa6` messages announcing every configured address.
    pub fn addr_messages(&self) -> Vec<Message> {
        self.addrs()
            .into_iter()
            .map(|addr| match addr {
                IfAddr::V4(net) => Message::Ifa(Ifa {
                    xid: self.xid,
                    event: IfaEvent::Up,
                    addr: net,
                }),
                IfAddr::V6(net) => Message::Ifa6(Ifa6 {
                    xid: self.xid,
                    event: IfaEvent::Up,
                    addr: net,
                }),
            })
            .collect()
    }
}

impl ProxyOps for Proxy {
    fn kind(&self) -> ProxyKind {
        self.variant.kind()
    }

    fn xid(&self) -> u32 {
        self.xid
    }

    fn on_open(&self) -> io::Result<()> {
        self.admin_up.store(true, Ordering::SeqCst);
        // Only ports get link state from the daemon.
        if !matches!(self.variant, ProxyVariant::Port(_)) {
            self.set_carrier(true)?;
        }
        Ok(())
    }

    fn on_close(&self) -> io::Result<()> {
        self.admin_up.store(false, Ordering::SeqCst);
        self.set_carrier(false)
    }

    fn on_transmit(&self) -> Option<Encap> {
        if !self.carrier() {
            return None;
        }
        Some(Encap::for_proxy(self.kind(), self.xid))
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("xid", &self.xid)
            .field("kind", &self.kind())
            .field("name", &self.name)
            .field("up", &self.is_up())
            .field("carrier", &self.carrier())
            .finish()
    }
}
