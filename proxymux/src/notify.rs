//! Host events translated into side-band messages.
//!
//! Address and namespace events flow once the daemon has asked for a dump;
//! route and neighbour events once it has asked for the fib dump. Before
//! that the daemon would not know what the events refer to.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use ipnet::{Ipv4Net, Ipv6Net};
use tracing::trace;

use crate::mux::Mux;
use crate::proxy::{IfAddr, Proxy, ProxyOps};
use crate::sb::msg::{Fib6Entry, FibEntry, Ifa, Ifa6, IfaEvent, Message, NeighUpdate};

/// Snapshot provider for the route and neighbour tables.
pub trait RouteSource: Send + Sync {
    fn fib(&self) -> Vec<FibEntry> {
        Vec::new()
    }

    fn fib6(&self) -> Vec<Fib6Entry> {
        Vec::new()
    }

    fn neighbours(&self) -> Vec<NeighUpdate> {
        Vec::new()
    }
}

/// Empty route tables.
pub struct NoRoutes;

impl RouteSource for NoRoutes {}

/// Route tables held in memory.
#[derive(Default)]
pub struct StaticRoutes {
    fib: Mutex<Vec<FibEntry>>,
    fib6: Mutex<Vec<Fib6Entry>>,
    neigh: Mutex<Vec<NeighUpdate>>,
}

impl StaticRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fib(&self, entry: FibEntry) {
        self.fib.lock().unwrap().push(entry);
    }

    pub fn add_fib6(&self, entry: Fib6Entry) {
        self.fib6.lock().unwrap().push(entry);
    }

    pub fn add_neighbour(&self, neigh: NeighUpdate) {
        self.neigh.lock().unwrap().push(neigh);
    }
}

impl RouteSource for StaticRoutes {
    fn fib(&self) -> Vec<FibEntry> {
        self.fib.lock().unwrap().clone()
    }

    fn fib6(&self) -> Vec<Fib6Entry> {
        self.fib6.lock().unwrap().clone()
    }

    fn neighbours(&self) -> Vec<NeighUpdate> {
        self.neigh.lock().unwrap().clone()
    }
}

/// Which event streams the daemon has asked for on this connection.
#[derive(Debug, Default)]
pub(crate) struct Forwarding {
    netdev: AtomicBool,
    fib: AtomicBool,
    neigh: AtomicBool,
}

impl Forwarding {
    pub fn enable_netdev(&self) {
        self.netdev.store(true, Ordering::SeqCst);
    }

    pub fn enable_fib(&self) {
        self.fib.store(true, Ordering::SeqCst);
    }

    pub fn enable_neigh(&self) {
        self.neigh.store(true, Ordering::SeqCst);
    }

    pub fn netdev(&self) -> bool {
        self.netdev.load(Ordering::SeqCst)
    }

    pub fn fib(&self) -> bool {
        self.fib.load(Ordering::SeqCst)
    }

    pub fn neigh(&self) -> bool {
        self.neigh.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.netdev.store(false, Ordering::SeqCst);
        self.fib.store(false, Ordering::SeqCst);
        self.neigh.store(false, Ordering::SeqCst);
    }
}

impl Mux {
    /// An IPv4 address came or went on interface `ifindex`.
    ///
    /// Returns true if a message was queued. Interfaces that are not
    /// proxies are ignored.
    pub fn notify_ifa(&self, ifindex: u32, event: IfaEvent, addr: Ipv4Net) -> bool {
        let Some(proxy) = self.registry.lookup_by_ifindex(ifindex) else {
            return false;
        };
        track_addr(&*proxy, event, IfAddr::V4(addr));
        if !self.forwarding.netdev() {
            return false;
        }
        self.enqueue(&Message::Ifa(Ifa {
            xid: proxy.xid(),
            event,
            addr,
        }))
    }

    pub fn notify_ifa6(&self, ifindex: u32, event: IfaEvent, addr: Ipv6Net) -> bool {
        let Some(proxy) = self.registry.lookup_by_ifindex(ifindex) else {
            return false;
        };
        track_addr(&*proxy, event, IfAddr::V6(addr));
        if !self.forwarding.netdev() {
            return false;
        }
        self.enqueue(&Message::Ifa6(Ifa6 {
            xid: proxy.xid(),
            event,
            addr,
        }))
    }

    pub fn notify_fib(&self, entry: FibEntry) -> bool {
        if !self.forwarding.fib() {
            trace!(prefix = %entry.prefix, "Fib event before fib dump");
            return false;
        }
        self.enqueue(&Message::FibEntry(entry))
    }

    pub fn notify_fib6(&self, entry: Fib6Entry) -> bool {
        if !self.forwarding.fib() {
            trace!(prefix = %entry.prefix, "Fib6 event before fib dump");
            return false;
        }
        self.enqueue(&Message::Fib6Entry(entry))
    }

    pub fn notify_neigh(&self, neigh: NeighUpdate) -> bool {
        if !self.forwarding.neigh() {
            return false;
        }
        self.enqueue(&Message::NeighUpdate(neigh))
    }

    pub fn notify_netns_add(&self, net: u64) -> bool {
        self.forwarding.netdev() && self.enqueue(&Message::NetnsAdd(net))
    }

    pub fn notify_netns_del(&self, net: u64) -> bool {
        self.forwarding.netdev() && self.enqueue(&Message::NetnsDel(net))
    }
}

fn track_addr(proxy: &Proxy, event: IfaEvent, addr: IfAddr) {
    match event {
        IfaEvent::Up => {
            proxy.add_addr(addr);
        }
        IfaEvent::Down => {
            proxy.del_addr(addr);
        }
    }
    trace!(xid = proxy.xid(), ?event, ?addr, "Address event");
}
