//! Per-interface link statistics.
//!
//! The index order is part of the side-band protocol: `LinkStat` messages
//! address a counter by its position in [`LINK_STAT_NAMES`].

use std::sync::atomic::{AtomicU64, Ordering};

pub const N_LINK_STATS: usize = 24;

pub const LINK_STAT_NAMES: [&str; N_LINK_STATS] = [
    "rx-packets",
    "tx-packets",
    "rx-bytes",
    "tx-bytes",
    "rx-errors",
    "tx-errors",
    "rx-dropped",
    "tx-dropped",
    "multicast",
    "collisions",
    "rx-length-errors",
    "rx-over-errors",
    "rx-crc-errors",
    "rx-frame-errors",
    "rx-fifo-errors",
    "rx-missed-errors",
    "tx-aborted-errors",
    "tx-carrier-errors",
    "tx-fifo-errors",
    "tx-heartbeat-errors",
    "tx-window-errors",
    "rx-compressed",
    "tx-compressed",
    "rx-nohandler",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LinkStat {
    RxPackets = 0,
    TxPackets,
    RxBytes,
    TxBytes,
    RxErrors,
    TxErrors,
    RxDropped,
    TxDropped,
    Multicast,
    Collisions,
    RxLengthErrors,
    RxOverErrors,
    RxCrcErrors,
    RxFrameErrors,
    RxFifoErrors,
    RxMissedErrors,
    TxAbortedErrors,
    TxCarrierErrors,
    TxFifoErrors,
    TxHeartbeatErrors,
    TxWindowErrors,
    RxCompressed,
    TxCompressed,
    RxNohandler,
}

impl LinkStat {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        LINK_STAT_NAMES[self.index()]
    }
}

/// Atomic link counters, one slot per [`LinkStat`].
#[derive(Debug, Default)]
pub struct LinkStats {
    counters: [AtomicU64; N_LINK_STATS],
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, stat: LinkStat) {
        self.add(stat, 1);
    }

    pub fn add(&self, stat: LinkStat, n: u64) {
        self.counters[stat.index()].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, stat: LinkStat) -> u64 {
        self.counters[stat.index()].load(Ordering::Relaxed)
    }

    /// Overwrite a counter by wire index. Returns false if the index is out of range.
    pub fn set(&self, index: u32, count: u64) -> bool {
        match self.counters.get(index as usize) {
            Some(c) => {
                c.store(count, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn reset(&self) {
        for c in &self.counters {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> [u64; N_LINK_STATS] {
        std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed))
    }

    /// Non-zero counters as `(name, value)` pairs.
    pub fn nonzero(&self) -> Vec<(&'static str, u64)> {
        self.snapshot()
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .map(|(i, v)| (LINK_STAT_NAMES[i], *v))
            .collect()
    }
}
