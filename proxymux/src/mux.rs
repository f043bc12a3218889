//! The multiplexer instance.
//!
//! A `Mux` owns the proxy registry, the lower table, the side-band queue and
//! the threads that serve them. Several instances can live in one process;
//! each listens on its own abstract socket name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::config::MuxConfig;
use crate::counters::MuxCounters;
use crate::dataplane::worker::{self, WorkerHandle};
use crate::dev::{ChannelFactory, DeviceFactory, DeviceSpec, NetDevice, mac_add};
use crate::error::{ConfigError, LinkError, MuxError, RegistryError, Result};
use crate::link_stats::LinkStats;
use crate::lower::LowerTable;
use crate::notify::{Forwarding, NoRoutes, RouteSource};
use crate::proxy::{
    EthtoolSettings, MAX_LAG_MEMBERS, Members, PortState, Proxy, ProxyKind, ProxyOps,
    ProxyVariant,
};
use crate::registry::ProxyRegistry;
use crate::sb::channel::{self, ChannelState};
use crate::sb::msg::{
    ChangeUpperXid, EthtoolFlags, EthtoolSettingsMsg, IfinfoReason, LinkModes, Message,
};
use crate::sb::queue::SbQueue;
use crate::sb::socket::SeqPacketListener;
use crate::xid::{self, Direction, MAX_VID};

/// Longest interface name the kernel accepts.
const MAX_IFNAME_LEN: usize = 15;

pub struct MuxBuilder {
    config: MuxConfig,
    factory: Option<Arc<dyn DeviceFactory>>,
    routes: Option<Arc<dyn RouteSource>>,
}

impl MuxBuilder {
    /// Device factory for proxy interfaces. Defaults to in-memory devices.
    pub fn devices(mut self, factory: Arc<dyn DeviceFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Route tables replayed on `DumpFibinfo`. Defaults to none.
    pub fn routes(mut self, routes: Arc<dyn RouteSource>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn build(self) -> Result<Arc<Mux>> {
        self.config.validate()?;
        let base_mac = self
            .config
            .base_mac()
            .ok_or_else(|| ConfigError::Invalid(format!("bad base_mac {}", self.config.base_mac)))?;
        let sbtx = SbQueue::new()?;
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(ChannelFactory::new()));
        let routes = self.routes.unwrap_or_else(|| Arc::new(NoRoutes));

        Ok(Arc::new_cyclic(|me| Mux {
            me: me.clone(),
            config: self.config,
            base_mac,
            registry: ProxyRegistry::new(),
            lowers: LowerTable::new(),
            counters: MuxCounters::new(),
            link_stats: LinkStats::new(),
            factory,
            routes,
            sbtx,
            state: Mutex::new(ChannelState::Listening),
            forwarding: Forwarding::default(),
            links: Mutex::new(()),
            stop: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            proxy_workers: Mutex::new(HashMap::new()),
            lower_workers: Mutex::new(HashMap::new()),
        }))
    }
}

pub struct Mux {
    me: Weak<Mux>,
    pub(crate) config: MuxConfig,
    base_mac: [u8; 6],
    pub(crate) registry: ProxyRegistry,
    pub(crate) lowers: LowerTable,
    pub(crate) counters: MuxCounters,
    /// Receive-side drops not attributable to any proxy.
    pub(crate) link_stats: LinkStats,
    factory: Arc<dyn DeviceFactory>,
    pub(crate) routes: Arc<dyn RouteSource>,
    pub(crate) sbtx: SbQueue,
    pub(crate) state: Mutex<ChannelState>,
    pub(crate) forwarding: Forwarding,
    /// Serializes membership changes, VLAN creation and deletes.
    links: Mutex<()>,
    stop: Arc<AtomicBool>,
    listener: Mutex<Option<JoinHandle<()>>>,
    proxy_workers: Mutex<HashMap<u32, WorkerHandle>>,
    lower_workers: Mutex<HashMap<usize, WorkerHandle>>,
}

impl Mux {
    pub fn builder(config: MuxConfig) -> MuxBuilder {
        MuxBuilder {
            config,
            factory: None,
            routes: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProxyRegistry {
        &self.registry
    }

    pub fn lowers(&self) -> &LowerTable {
        &self.lowers
    }

    pub fn counters(&self) -> &MuxCounters {
        &self.counters
    }

    pub fn link_stats(&self) -> &LinkStats {
        &self.link_stats
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Bind the side-band socket and start accepting the daemon.
    pub fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock().unwrap();
        if listener.is_some() || self.stop.load(Ordering::SeqCst) {
            return Err(MuxError::AlreadyRunning(self.config.name.clone()));
        }
        let sock = SeqPacketListener::bind(&self.config.name)?;
        *listener = Some(channel::spawn_listener(
            self.me.clone(),
            sock,
            self.stop.clone(),
        )?);
        info!(name = %self.config.name, "Side-band listening");
        Ok(())
    }

    /// Stop every thread, drop carriers and release the lowers.
    ///
    /// Calling it again is a no-op.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sbtx.signal();

        let listener = self.listener.lock().unwrap().take();
        if let Some(handle) = listener
            && handle.join().is_err()
        {
            warn!(name = %self.config.name, "Listener thread panicked");
        }
        self.disconnect();

        for lower in self.lowers.detach_all() {
            self.stop_lower_worker(lower.index());
        }
        let workers: Vec<WorkerHandle> = self
            .proxy_workers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, w)| w)
            .collect();
        for w in workers {
            stop_worker(w);
        }
        info!(name = %self.config.name, "Mux stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Register an uplink. Devices with a pollable fd get a reader thread.
    pub fn attach_lower(&self, device: Arc<dyn NetDevice>) -> Result<usize> {
        let index = self.lowers.attach(device.clone())?;
        let weak = self.me.clone();
        let spawned = worker::spawn_reader(format!("lower-{index}"), device, move |frame| {
            if let Some(mux) = weak.upgrade() {
                mux.receive(index, frame);
            }
        });
        match spawned {
            Ok(Some(handle)) => {
                self.lower_workers.lock().unwrap().insert(index, handle);
            }
            Ok(None) => {}
            Err(e) => {
                self.lowers.detach(index);
                return Err(e.into());
            }
        }
        Ok(index)
    }

    pub fn detach_lower(&self, index: usize) -> bool {
        let found = self.lowers.detach(index).is_some();
        self.stop_lower_worker(index);
        found
    }

    fn stop_lower_worker(&self, index: usize) {
        let handle = self.lower_workers.lock().unwrap().remove(&index);
        if let Some(w) = handle {
            stop_worker(w);
        }
    }

    /// Create every port listed in the configuration.
    pub fn provision_ports(&self) -> Result<Vec<Arc<Proxy>>> {
        let ports = self.config.ports.clone();
        ports
            .iter()
            .map(|p| self.create_port(&p.name, p.xid))
            .collect()
    }

    /// Create a port proxy. Without an explicit xid, the highest free port
    /// xid is used.
    pub fn create_port(&self, name: &str, xid: Option<u32>) -> Result<Arc<Proxy>> {
        check_name(name)?;
        let range = self.config.port_xids;
        let n_stats = self.config.ethtool_stat_names.len();
        let make = |xid: u32| -> Result<Proxy> {
            // Port N from the top of the range gets base_mac + N.
            let mac = mac_add(self.base_mac, range.last - xid);
            let device = self.make_device(name, ProxyKind::Port, mac)?;
            Ok(Proxy::new(
                xid,
                device,
                ProxyVariant::Port(PortState::new(n_stats)),
            ))
        };

        let proxy = match xid {
            Some(xid) => {
                if !range.contains(xid) {
                    return Err(RegistryError::ExhaustedRange {
                        kind: ProxyKind::Port,
                        first: range.first,
                        last: range.last,
                    }
                    .into());
                }
                if self.registry.contains(xid) {
                    return Err(RegistryError::DuplicateXid(xid).into());
                }
                let proxy = Arc::new(make(xid)?);
                if let Err(e) = self.registry.register(proxy.clone()) {
                    self.factory.destroy(proxy.name());
                    return Err(e.into());
                }
                proxy
            }
            None => self
                .registry
                .register_next(ProxyKind::Port, range, Direction::Down, make)?,
        };
        self.publish(&proxy)?;
        Ok(proxy)
    }

    /// Create a VLAN proxy on top of a port or lag.
    pub fn create_vlan(&self, lower_xid: u32, vid: u16) -> Result<Arc<Proxy>> {
        if vid == 0 || vid > MAX_VID {
            return Err(LinkError::InvalidVid(vid).into());
        }
        // Held until registered: a delete of the lower must see this VLAN.
        let _links = self.links.lock().unwrap();
        let lower = self.registry.lookup(lower_xid)?;
        if !matches!(lower.kind(), ProxyKind::Port | ProxyKind::Lag) {
            return Err(LinkError::WrongKind {
                xid: lower_xid,
                kind: lower.kind(),
                expected: "port or lag",
            }
            .into());
        }

        let name = format!("{}.{}", lower.name(), vid);
        check_name(&name)?;
        let xid = xid::vlan_xid(lower_xid, vid);
        if self.registry.contains(xid) {
            return Err(RegistryError::DuplicateXid(xid).into());
        }
        let device = self.make_device(&name, ProxyKind::Vlan, lower.device().mac())?;
        let proxy = Arc::new(Proxy::new(
            xid,
            device,
            ProxyVariant::Vlan {
                lower: lower_xid,
                vid,
            },
        ));
        if let Err(e) = self.registry.register(proxy.clone()) {
            self.factory.destroy(&name);
            return Err(e.into());
        }
        self.publish(&proxy)?;
        Ok(proxy)
    }

    pub fn create_lag(&self, name: &str) -> Result<Arc<Proxy>> {
        self.create_upper(name, ProxyKind::Lag)
    }

    pub fn create_bridge(&self, name: &str) -> Result<Arc<Proxy>> {
        self.create_upper(name, ProxyKind::Bridge)
    }

    pub fn create_loopback(&self, name: &str) -> Result<Arc<Proxy>> {
        self.create_upper(name, ProxyKind::Loopback)
    }

    fn create_upper(&self, name: &str, kind: ProxyKind) -> Result<Arc<Proxy>> {
        check_name(name)?;
        let make = |xid: u32| -> Result<Proxy> {
            let device = self.make_device(name, kind, mac_add(self.base_mac, xid))?;
            let variant = match kind {
                ProxyKind::Lag => ProxyVariant::Lag(Members::default()),
                ProxyKind::Bridge => ProxyVariant::Bridge(Members::default()),
                _ => ProxyVariant::Loopback,
            };
            Ok(Proxy::new(xid, device, variant))
        };
        let proxy =
            self.registry
                .register_next(kind, self.config.upper_xids, Direction::Up, make)?;
        self.publish(&proxy)?;
        Ok(proxy)
    }

    fn make_device(
        &self,
        name: &str,
        kind: ProxyKind,
        mac: [u8; 6],
    ) -> std::result::Result<Arc<dyn NetDevice>, LinkError> {
        let spec = DeviceSpec {
            name: name.to_string(),
            kind,
            mac,
        };
        Ok(self.factory.create(&spec)?)
    }

    /// Announce a freshly registered proxy and start its reader.
    fn publish(&self, proxy: &Arc<Proxy>) -> Result<()> {
        let xid = proxy.xid();
        let weak = self.me.clone();
        let spawned = worker::spawn_reader(
            format!("proxy-{}", proxy.name()),
            proxy.device().clone(),
            move |frame| {
                if let Some(mux) = weak.upgrade() {
                    mux.transmit(xid, frame, 0);
                }
            },
        );
        match spawned {
            Ok(Some(handle)) => {
                self.proxy_workers.lock().unwrap().insert(xid, handle);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = self.registry.unregister(xid);
                self.factory.destroy(proxy.name());
                return Err(LinkError::Device(e).into());
            }
        }

        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::New)));
        info!(xid, kind = %proxy.kind(), name = proxy.name(), "Proxy created");
        Ok(())
    }

    /// Tear down a proxy: release its members, leave its upper, delete the
    /// VLANs stacked on it, then unregister it.
    pub fn delete(&self, xid: u32) -> Result<()> {
        let _links = self.links.lock().unwrap();
        self.delete_locked(xid)
    }

    fn delete_locked(&self, xid: u32) -> Result<()> {
        let proxy = self.registry.lookup(xid)?;

        if let Some(members) = proxy.members() {
            for member in members.list() {
                self.remove_member_locked(xid, member)?;
            }
        }
        let upper = proxy.upper();
        if upper != 0 {
            self.remove_member_locked(upper, xid)?;
        }
        if matches!(proxy.kind(), ProxyKind::Port | ProxyKind::Lag) {
            let stacked: Vec<u32> = self
                .registry
                .snapshot_kind(ProxyKind::Vlan)
                .iter()
                .filter(|v| v.vlan_lower() == Some(xid))
                .map(|v| v.xid())
                .collect();
            for vlan in stacked {
                self.delete_locked(vlan)?;
            }
        }

        let proxy = self.registry.unregister(xid)?;
        let handle = self.proxy_workers.lock().unwrap().remove(&xid);
        if let Some(w) = handle {
            stop_worker(w);
        }
        self.factory.destroy(proxy.name());
        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::Del)));
        info!(xid, kind = %proxy.kind(), name = proxy.name(), "Proxy deleted");
        Ok(())
    }

    pub fn open(&self, xid: u32) -> Result<()> {
        let proxy = self.registry.lookup(xid)?;
        proxy.on_open()?;
        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::Up)));
        debug!(xid, "Proxy up");
        Ok(())
    }

    pub fn close(&self, xid: u32) -> Result<()> {
        let proxy = self.registry.lookup(xid)?;
        proxy.on_close()?;
        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::Down)));
        debug!(xid, "Proxy down");
        Ok(())
    }

    /// Enslave `lower` to the lag or bridge `upper`.
    pub fn add_member(&self, upper: u32, lower: u32) -> Result<()> {
        let _links = self.links.lock().unwrap();
        let up = self.registry.lookup(upper)?;
        let low = self.registry.lookup(lower)?;

        let Some(members) = up.members() else {
            return Err(LinkError::WrongKind {
                xid: upper,
                kind: up.kind(),
                expected: "lag or bridge",
            }
            .into());
        };
        if !up.accepts_member(low.kind()) {
            return Err(LinkError::BadMember {
                upper: up.kind(),
                lower: low.kind(),
            }
            .into());
        }
        if low.upper() != 0 {
            return Err(LinkError::AlreadyMember {
                upper: low.upper(),
                lower,
            }
            .into());
        }
        if up.kind() == ProxyKind::Lag && members.len() >= MAX_LAG_MEMBERS {
            return Err(LinkError::LagFull(upper).into());
        }

        members.add(lower);
        low.set_upper(upper);
        self.enqueue(&Message::ChangeUpperXid(ChangeUpperXid {
            upper,
            lower,
            linking: true,
        }));
        info!(upper, lower, "Member added");
        Ok(())
    }

    pub fn remove_member(&self, upper: u32, lower: u32) -> Result<()> {
        let _links = self.links.lock().unwrap();
        self.remove_member_locked(upper, lower)
    }

    fn remove_member_locked(&self, upper: u32, lower: u32) -> Result<()> {
        let up = self.registry.lookup(upper)?;
        let removed = up.members().is_some_and(|m| m.remove(lower));
        if !removed {
            return Err(LinkError::NotMember { upper, lower }.into());
        }
        if let Some(low) = self.registry.get(lower) {
            low.set_upper(0);
        }
        self.enqueue(&Message::ChangeUpperXid(ChangeUpperXid {
            upper,
            lower,
            linking: false,
        }));
        info!(upper, lower, "Member removed");
        Ok(())
    }

    fn port_proxy(&self, xid: u32) -> Result<Arc<Proxy>> {
        let proxy = self.registry.lookup(xid)?;
        if proxy.port().is_none() {
            return Err(LinkError::WrongKind {
                xid,
                kind: proxy.kind(),
                expected: "port",
            }
            .into());
        }
        Ok(proxy)
    }

    pub fn set_ethtool_flags(&self, xid: u32, flags: u32) -> Result<()> {
        let proxy = self.port_proxy(xid)?;
        if let Some(port) = proxy.port() {
            port.set_flags(flags);
        }
        self.enqueue(&Message::EthtoolFlags(EthtoolFlags { xid, flags }));
        Ok(())
    }

    pub fn set_ethtool_settings(&self, xid: u32, settings: EthtoolSettings) -> Result<()> {
        let proxy = self.port_proxy(xid)?;
        if let Some(port) = proxy.port() {
            port.set_settings(settings);
        }
        self.enqueue(&settings_message(xid, settings));
        Ok(())
    }

    pub fn set_advertising(&self, xid: u32, modes: u64) -> Result<()> {
        let proxy = self.port_proxy(xid)?;
        if let Some(port) = proxy.port() {
            port.set_advertising(modes);
        }
        self.enqueue(&Message::EthtoolLinkModesAdvertising(LinkModes { xid, modes }));
        Ok(())
    }

    pub fn set_features(&self, xid: u32, features: u64) -> Result<()> {
        let proxy = self.registry.lookup(xid)?;
        proxy.set_features(features);
        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::Features)));
        Ok(())
    }

    /// Record that a proxy moved to namespace `net`.
    pub fn set_netns(&self, xid: u32, net: u64) -> Result<()> {
        let proxy = self.registry.lookup(xid)?;
        proxy.set_netns(net);
        self.enqueue(&Message::Ifinfo(proxy.ifinfo(IfinfoReason::New)));
        Ok(())
    }

    /// Counters worth showing, mux-wide and per proxy.
    pub fn stats_summary(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .counters
            .snapshot()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        out.extend(
            self.link_stats
                .nonzero()
                .into_iter()
                .map(|(k, v)| (format!("mux.{k}"), v)),
        );
        for proxy in self.registry.snapshot() {
            out.extend(
                proxy
                    .link_stats()
                    .nonzero()
                    .into_iter()
                    .map(|(k, v)| (format!("{}.{k}", proxy.name()), v)),
            );
        }
        out
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// `EthtoolSettings` as sent to the daemon: speed is 0 while autoneg is on.
pub(crate) fn settings_message(xid: u32, mut settings: EthtoolSettings) -> Message {
    if settings.autoneg() {
        settings.speed = 0;
    }
    Message::EthtoolSettings(EthtoolSettingsMsg { xid, settings })
}

fn stop_worker(w: WorkerHandle) {
    w.stop();
    if let Err(e) = w.join() {
        error!(error = %e, "Reader thread panicked");
    }
}

fn check_name(name: &str) -> std::result::Result<(), LinkError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name != "."
        && name != ".."
        && !name.bytes().any(|b| b == b'/' || b == b':' || b.is_ascii_whitespace());
    if ok {
        Ok(())
    } else {
        Err(LinkError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::{TxDrop, TxVerdict};

    fn mux() -> Arc<Mux> {
        Mux::builder(MuxConfig::default()).build().unwrap()
    }

    #[test]
    fn test_check_name() {
        assert!(check_name("xe1").is_ok());
        assert!(check_name("eth-1.100").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("a-very-long-name0").is_err());
        assert!(check_name("a/b").is_err());
        assert!(check_name("a b").is_err());
    }

    #[test]
    fn test_builder_validates() {
        let config = MuxConfig::default().with_exception_priority(9);
        assert!(matches!(
            Mux::builder(config).build(),
            Err(MuxError::Config(_))
        ));
    }

    #[test]
    fn test_port_xids_and_macs() {
        let mux = mux();
        let xe1 = mux.create_port("xe1", None).unwrap();
        let xe2 = mux.create_port("xe2", None).unwrap();
        assert_eq!(xe1.xid(), 3999);
        assert_eq!(xe2.xid(), 3998);
        assert_eq!(xe1.device().mac(), [2, 0, 0, 0, 0, 0]);
        assert_eq!(xe2.device().mac(), [2, 0, 0, 0, 0, 1]);

        let fixed = mux.create_port("xe9", Some(3990)).unwrap();
        assert_eq!(fixed.xid(), 3990);
        assert!(matches!(
            mux.create_port("xe10", Some(3990)),
            Err(MuxError::Registry(RegistryError::DuplicateXid(3990)))
        ));
        assert!(matches!(
            mux.create_port("xe11", Some(4000)),
            Err(MuxError::Registry(RegistryError::ExhaustedRange { .. }))
        ));
        assert!(matches!(
            mux.create_port("xe1", None),
            Err(MuxError::Link(LinkError::Device(_)))
        ));
    }

    #[test]
    fn test_uppers_allocate_upward() {
        let mux = mux();
        assert_eq!(mux.create_lag("bond0").unwrap().xid(), 3000);
        assert_eq!(mux.create_bridge("br0").unwrap().xid(), 3001);
        assert_eq!(mux.create_loopback("lo1").unwrap().xid(), 3002);
    }

    #[test]
    fn test_vlan_on_port() {
        let mux = mux();
        let xe1 = mux.create_port("xe1", None).unwrap();
        let vlan = mux.create_vlan(xe1.xid(), 100).unwrap();
        assert_eq!(vlan.xid(), (100 << 12) | 3999);
        assert_eq!(vlan.name(), "xe1.100");
        assert!(matches!(
            mux.create_vlan(xe1.xid(), 4095),
            Err(MuxError::Link(LinkError::InvalidVid(4095)))
        ));
        assert!(matches!(
            mux.create_vlan(vlan.xid(), 5),
            Err(MuxError::Link(LinkError::WrongKind { .. }))
        ));
    }

    #[test]
    fn test_lag_membership_rules() {
        let mux = mux();
        let lag = mux.create_lag("bond0").unwrap().xid();
        let br = mux.create_bridge("br0").unwrap().xid();
        let ports: Vec<u32> = (0..9)
            .map(|i| mux.create_port(&format!("xe{i}"), None).unwrap().xid())
            .collect();

        for p in &ports[..8] {
            mux.add_member(lag, *p).unwrap();
        }
        assert!(matches!(
            mux.add_member(lag, ports[8]),
            Err(MuxError::Link(LinkError::LagFull(_)))
        ));
        assert!(matches!(
            mux.add_member(br, ports[0]),
            Err(MuxError::Link(LinkError::AlreadyMember { .. }))
        ));
        assert!(matches!(
            mux.add_member(lag, br),
            Err(MuxError::Link(LinkError::BadMember { .. }))
        ));
        mux.add_member(br, lag).unwrap();

        mux.remove_member(lag, ports[0]).unwrap();
        assert_eq!(mux.registry().lookup(ports[0]).unwrap().upper(), 0);
        assert!(matches!(
            mux.remove_member(lag, ports[0]),
            Err(MuxError::Link(LinkError::NotMember { .. }))
        ));
    }

    #[test]
    fn test_delete_cascades() {
        let mux = mux();
        let lag = mux.create_lag("bond0").unwrap().xid();
        let xe1 = mux.create_port("xe1", None).unwrap().xid();
        let xe2 = mux.create_port("xe2", None).unwrap().xid();
        mux.add_member(lag, xe1).unwrap();
        mux.add_member(lag, xe2).unwrap();
        let vlan = mux.create_vlan(lag, 10).unwrap().xid();

        mux.delete(lag).unwrap();
        assert!(!mux.registry().contains(lag));
        assert!(!mux.registry().contains(vlan));
        assert_eq!(mux.registry().lookup(xe1).unwrap().upper(), 0);
        assert_eq!(mux.registry().lookup(xe2).unwrap().upper(), 0);
        assert!(matches!(
            mux.delete(lag),
            Err(MuxError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[test]
    fn test_port_only_setters() {
        let mux = mux();
        let xe1 = mux.create_port("xe1", None).unwrap().xid();
        let br = mux.create_bridge("br0").unwrap().xid();

        mux.set_ethtool_flags(xe1, 0b101).unwrap();
        mux.set_advertising(xe1, 1 << 40).unwrap();
        let port = mux.registry().lookup(xe1).unwrap();
        assert_eq!(port.port().unwrap().flags(), 0b101);
        assert_eq!(port.port().unwrap().advertising(), 1 << 40);

        assert!(matches!(
            mux.set_ethtool_flags(br, 1),
            Err(MuxError::Link(LinkError::WrongKind { .. }))
        ));
    }

    #[test]
    fn test_settings_message_zeroes_speed_under_autoneg() {
        let mut s = EthtoolSettings {
            speed: 100_000,
            ..Default::default()
        };
        let Message::EthtoolSettings(m) = settings_message(1, s) else {
            panic!("wrong kind");
        };
        assert_eq!(m.settings.speed, 0);

        s.autoneg = 0;
        let Message::EthtoolSettings(m) = settings_message(1, s) else {
            panic!("wrong kind");
        };
        assert_eq!(m.settings.speed, 100_000);
    }

    #[test]
    fn test_opened_lag_transmits() {
        let factory = Arc::new(ChannelFactory::new());
        let mux = Mux::builder(MuxConfig::default())
            .devices(factory.clone())
            .build()
            .unwrap();
        let eth1 = factory.make("eth1", [2, 0, 0, 0, 0xff, 1]);
        mux.attach_lower(eth1.clone()).unwrap();
        let lag = mux.create_lag("bond0").unwrap().xid();

        let mut frame = vec![0u8; 60];
        frame[12..14].copy_from_slice(&[0x08, 0x00]);
        assert!(matches!(
            mux.transmit(lag, &frame, 0),
            TxVerdict::Dropped(TxDrop::NoCarrier)
        ));

        mux.open(lag).unwrap();
        assert_eq!(mux.transmit(lag, &frame, 0), TxVerdict::Sent(0));
        assert_eq!(eth1.drain().len(), 1);
        assert!(factory.device("bond0").unwrap().carrier());
    }

    #[test]
    fn test_deleted_names_can_be_reused() {
        let mux = mux();
        let xe1 = mux.create_port("xe1", None).unwrap().xid();
        let vlan = mux.create_vlan(xe1, 100).unwrap().xid();
        mux.delete(xe1).unwrap();
        assert!(!mux.registry().contains(vlan));

        let again = mux.create_port("xe1", None).unwrap();
        assert_eq!(again.xid(), xe1);
        mux.create_vlan(xe1, 100).unwrap();

        let lag = mux.create_lag("bond0").unwrap().xid();
        mux.delete(lag).unwrap();
        mux.create_lag("bond0").unwrap();
    }

    #[test]
    fn test_delete_races_add_member() {
        let mux = mux();
        let port = mux.create_port("xe1", None).unwrap();
        for _ in 0..200 {
            let lag = mux.create_lag("bond0").unwrap().xid();
            let adder = {
                let mux = mux.clone();
                let xid = port.xid();
                std::thread::spawn(move || {
                    let _ = mux.add_member(lag, xid);
                })
            };
            mux.delete(lag).unwrap();
            adder.join().unwrap();

            assert_eq!(port.upper(), 0, "port left enslaved to deleted lag");
        }
    }

    #[test]
    fn test_delete_races_create_vlan() {
        let mux = mux();
        for _ in 0..200 {
            let xid = mux.create_port("xe1", None).unwrap().xid();
            let creator = {
                let mux = mux.clone();
                std::thread::spawn(move || {
                    let _ = mux.create_vlan(xid, 10);
                })
            };
            mux.delete(xid).unwrap();
            creator.join().unwrap();

            assert!(mux.registry().snapshot_kind(ProxyKind::Vlan).is_empty());
        }
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mux = mux();
        mux.stop();
        mux.stop();
        assert!(mux.is_stopped());
        assert!(matches!(mux.start(), Err(MuxError::AlreadyRunning(_))));
    }
}
