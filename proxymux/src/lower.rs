//! Lower (uplink) table and transmit load balancing.
//!
//! Lowers are spread round-robin over a fixed set of buckets; a frame's
//! flow hash picks the bucket. Both the lower list and the buckets are
//! published through `ArcSwap`, so transmit never takes a lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::info;

use crate::dev::NetDevice;
use crate::error::MuxError;

pub const LB_BUCKETS: usize = 16;

/// Most lowers one mux will take.
pub const MAX_LOWERS: usize = 16;

pub struct Lower {
    index: usize,
    device: Arc<dyn NetDevice>,
    mac: Mutex<[u8; 6]>,
    registered: AtomicBool,
}

impl Lower {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &Arc<dyn NetDevice> {
        &self.device
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// MAC address seen when the lower was attached or last refreshed.
    pub fn mac(&self) -> [u8; 6] {
        *self.mac.lock().unwrap()
    }

    pub fn refresh_mac(&self) {
        *self.mac.lock().unwrap() = self.device.mac();
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Attached and carrying traffic.
    pub fn is_up(&self) -> bool {
        self.is_registered() && self.device.is_up()
    }
}

/// Outcome of picking a lower for transmit.
pub enum Selection {
    Lower(Arc<Lower>),
    /// Lowers exist but none is up.
    NoneUp,
    /// No lowers at all.
    Empty,
}

pub struct LowerTable {
    lowers: ArcSwap<Vec<Arc<Lower>>>,
    buckets: ArcSwap<Vec<Arc<Lower>>>,
    write: Mutex<usize>,
}

impl LowerTable {
    pub fn new() -> Self {
        Self {
            lowers: ArcSwap::new(Arc::new(Vec::new())),
            buckets: ArcSwap::new(Arc::new(Vec::new())),
            write: Mutex::new(0),
        }
    }

    /// Register a device as a lower. Returns its index.
    pub fn attach(&self, device: Arc<dyn NetDevice>) -> Result<usize, MuxError> {
        let mut next_index = self.write.lock().unwrap();
        let mut lowers = (**self.lowers.load()).clone();
        if lowers.len() >= MAX_LOWERS {
            return Err(MuxError::TooManyLowers);
        }

        let index = *next_index;
        *next_index += 1;
        let lower = Arc::new(Lower {
            index,
            mac: Mutex::new(device.mac()),
            device,
            registered: AtomicBool::new(true),
        });
        info!(index, name = lower.name(), "Lower registered");
        lowers.push(lower);

        self.buckets.store(Arc::new(spread(&lowers)));
        self.lowers.store(Arc::new(lowers));
        Ok(index)
    }

    /// Take a lower out of service.
    ///
    /// The lower stops demultiplexing before it leaves the buckets; the
    /// device is released once the last in-flight user drops its `Arc`.
    pub fn detach(&self, index: usize) -> Option<Arc<Lower>> {
        let _guard = self.write.lock().unwrap();
        let mut lowers = (**self.lowers.load()).clone();
        let pos = lowers.iter().position(|l| l.index == index)?;
        let lower = lowers.remove(pos);

        lower.registered.store(false, Ordering::SeqCst);
        self.buckets.store(Arc::new(spread(&lowers)));
        self.lowers.store(Arc::new(lowers));
        info!(index, name = lower.name(), "Lower unregistered");
        Some(lower)
    }

    /// Detach every lower, returning them in index order.
    pub fn detach_all(&self) -> Vec<Arc<Lower>> {
        let indices: Vec<usize> = self.lowers.load().iter().map(|l| l.index).collect();
        indices.into_iter().filter_map(|i| self.detach(i)).collect()
    }

    pub fn get(&self, index: usize) -> Option<Arc<Lower>> {
        self.lowers.load().iter().find(|l| l.index == index).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Lower>> {
        (**self.lowers.load()).clone()
    }

    pub fn len(&self) -> usize {
        self.lowers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the lower for a frame with flow hash `hash`.
    ///
    /// Falls through to the next bucket whose lower is up when the hashed
    /// one is down.
    pub fn select(&self, hash: u32) -> Selection {
        let buckets = self.buckets.load();
        if buckets.is_empty() {
            return Selection::Empty;
        }
        let start = hash as usize % buckets.len();
        (0..buckets.len())
            .map(|i| &buckets[(start + i) % buckets.len()])
            .find(|l| l.is_up())
            .map(|l| Selection::Lower(l.clone()))
            .unwrap_or(Selection::NoneUp)
    }
}

impl Default for LowerTable {
    fn default() -> Self {
        Self::new()
    }
}

fn spread(lowers: &[Arc<Lower>]) -> Vec<Arc<Lower>> {
    if lowers.is_empty() {
        return Vec::new();
    }
    (0..LB_BUCKETS)
        .map(|i| lowers[i % lowers.len()].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dev::ChannelDevice;

    fn device(name: &str, ifindex: u32) -> Arc<ChannelDevice> {
        Arc::new(ChannelDevice::new(name, ifindex, [2, 0, 0, 0, 0, ifindex as u8]))
    }

    fn picked(sel: Selection) -> Option<usize> {
        match sel {
            Selection::Lower(l) => Some(l.index()),
            _ => None,
        }
    }

    #[test]
    fn test_round_robin_buckets() {
        let table = LowerTable::new();
        assert!(matches!(table.select(0), Selection::Empty));

        table.attach(device("eth1", 1)).unwrap();
        table.attach(device("eth2", 2)).unwrap();

        assert_eq!(picked(table.select(0)), Some(0));
        assert_eq!(picked(table.select(1)), Some(1));
        assert_eq!(picked(table.select(2)), Some(0));
        assert_eq!(picked(table.select(17)), Some(1));
    }

    #[test]
    fn test_falls_back_to_next_up() {
        let table = LowerTable::new();
        let eth1 = device("eth1", 1);
        let eth2 = device("eth2", 2);
        table.attach(eth1.clone()).unwrap();
        table.attach(eth2.clone()).unwrap();

        eth1.set_up(false);
        assert_eq!(picked(table.select(0)), Some(1));
        assert_eq!(picked(table.select(1)), Some(1));

        eth2.set_up(false);
        assert!(matches!(table.select(0), Selection::NoneUp));
    }

    #[test]
    fn test_detach_clears_registered() {
        let table = LowerTable::new();
        table.attach(device("eth1", 1)).unwrap();
        let idx = table.attach(device("eth2", 2)).unwrap();

        let held = table.get(idx).unwrap();
        let gone = table.detach(idx).unwrap();
        assert!(!gone.is_registered());
        assert!(!held.is_up());
        assert_eq!(table.len(), 1);
        assert_eq!(picked(table.select(1)), Some(0));
        assert!(table.detach(idx).is_none());

        assert_eq!(table.detach_all().len(), 1);
        assert!(matches!(table.select(0), Selection::Empty));
    }

    #[test]
    fn test_lower_limit() {
        let table = LowerTable::new();
        for i in 0..MAX_LOWERS {
            table.attach(device(&format!("eth{i}"), i as u32)).unwrap();
        }
        assert!(matches!(
            table.attach(device("eth99", 99)),
            Err(MuxError::TooManyLowers)
        ));
    }
}
