//! Proxy registry keyed by xid.
//!
//! Lookups are lock-free: the maps live behind `ArcSwap` and every mutation
//! publishes a fresh copy. Writers serialize on one mutex so two racing
//! registrations can never both claim an xid. A reader that loaded the old
//! map keeps its `Arc<Proxy>` alive until it is done with it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::error::RegistryError;
use crate::proxy::{Proxy, ProxyKind, ProxyOps};
use crate::xid::{Direction, XidRange};

pub type Result<T> = std::result::Result<T, RegistryError>;

pub struct ProxyRegistry {
    by_xid: ArcSwap<HashMap<u32, Arc<Proxy>>>,
    /// ifindex -> xid, for host-side notifications.
    by_ifindex: ArcSwap<HashMap<u32, u32>>,
    write: Mutex<()>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            by_xid: ArcSwap::new(Arc::new(HashMap::new())),
            by_ifindex: ArcSwap::new(Arc::new(HashMap::new())),
            write: Mutex::new(()),
        }
    }

    /// Publish `proxy`. Fails if its xid is taken.
    pub fn register(&self, proxy: Arc<Proxy>) -> Result<()> {
        let _guard = self.write.lock().unwrap();
        self.insert_locked(proxy)
    }

    /// Allocate a free xid in `range` and register the proxy `make` builds
    /// for it, without letting another writer in between.
    ///
    /// Nothing is registered if `make` fails.
    pub fn register_next<F, E>(
        &self,
        kind: ProxyKind,
        range: XidRange,
        dir: Direction,
        make: F,
    ) -> std::result::Result<Arc<Proxy>, E>
    where
        F: FnOnce(u32) -> std::result::Result<Proxy, E>,
        E: From<RegistryError>,
    {
        let _guard = self.write.lock().unwrap();
        let xid = self.free_xid(kind, range, dir)?;
        let proxy = Arc::new(make(xid)?);
        self.insert_locked(proxy.clone())?;
        Ok(proxy)
    }

    /// Remove and return the proxy. Fails if the xid is not registered.
    pub fn unregister(&self, xid: u32) -> Result<Arc<Proxy>> {
        let _guard = self.write.lock().unwrap();

        let mut map = (**self.by_xid.load()).clone();
        let proxy = map.remove(&xid).ok_or(RegistryError::NotFound(xid))?;
        self.by_xid.store(Arc::new(map));

        let mut ifmap = (**self.by_ifindex.load()).clone();
        if ifmap.get(&proxy.ifindex()) == Some(&xid) {
            ifmap.remove(&proxy.ifindex());
        }
        self.by_ifindex.store(Arc::new(ifmap));

        debug!(xid, kind = %proxy.kind(), "Proxy unregistered");
        Ok(proxy)
    }

    pub fn lookup(&self, xid: u32) -> Result<Arc<Proxy>> {
        self.get(xid).ok_or(RegistryError::NotFound(xid))
    }

    /// Hot-path variant of [`lookup`](Self::lookup).
    pub fn get(&self, xid: u32) -> Option<Arc<Proxy>> {
        self.by_xid.load().get(&xid).cloned()
    }

    pub fn lookup_by_ifindex(&self, ifindex: u32) -> Option<Arc<Proxy>> {
        let xid = *self.by_ifindex.load().get(&ifindex)?;
        self.get(xid)
    }

    pub fn contains(&self, xid: u32) -> bool {
        self.by_xid.load().contains_key(&xid)
    }

    pub fn len(&self) -> usize {
        self.by_xid.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next free xid in `range`, scanning in `dir`.
    pub fn xid_alloc(&self, kind: ProxyKind, range: XidRange, dir: Direction) -> Result<u32> {
        let _guard = self.write.lock().unwrap();
        self.free_xid(kind, range, dir)
    }

    /// Every proxy, ordered by xid.
    pub fn snapshot(&self) -> Vec<Arc<Proxy>> {
        let mut all: Vec<_> = self.by_xid.load().values().cloned().collect();
        all.sort_by_key(|p| p.xid());
        all
    }

    /// Proxies of one kind, ordered by xid.
    pub fn snapshot_kind(&self, kind: ProxyKind) -> Vec<Arc<Proxy>> {
        let mut some: Vec<_> = self
            .by_xid
            .load()
            .values()
            .filter(|p| p.kind() == kind)
            .cloned()
            .collect();
        some.sort_by_key(|p| p.xid());
        some
    }

    fn free_xid(&self, kind: ProxyKind, range: XidRange, dir: Direction) -> Result<u32> {
        let map = self.by_xid.load();
        dir.scan(range)
            .find(|xid| !map.contains_key(xid))
            .ok_or(RegistryError::ExhaustedRange {
                kind,
                first: range.first,
                last: range.last,
            })
    }

    fn insert_locked(&self, proxy: Arc<Proxy>) -> Result<()> {
        let xid = proxy.xid();
        let mut map = (**self.by_xid.load()).clone();
        if map.contains_key(&xid) {
            return Err(RegistryError::DuplicateXid(xid));
        }
        let ifindex = proxy.ifindex();
        let kind = proxy.kind();
        map.insert(xid, proxy);

        let mut ifmap = (**self.by_ifindex.load()).clone();
        ifmap.insert(ifindex, xid);

        self.by_ifindex.store(Arc::new(ifmap));
        self.by_xid.store(Arc::new(map));
        debug!(xid, ifindex, kind = %kind, "Proxy registered");
        Ok(())
    }
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
