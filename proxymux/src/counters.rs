//! Mux-wide counters for the exception and side-band paths.

use std::sync::atomic::{AtomicU64, Ordering};

pub const N_COUNTERS: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxCounter {
    /// Exception frames forwarded to the daemon.
    ExFrames,
    ExBytes,
    /// Side-band connections accepted.
    SbConnections,
    /// Side-band connections refused because one was already active.
    SbRefused,
    /// Exception frames from the daemon that could not be parsed.
    SbexInvalid,
    /// Exception frames dropped for lack of a destination or connection.
    SbexDropped,
    SbrxInvalid,
    SbrxNoDev,
    SbrxNoMem,
    SbrxMsgs,
    SbrxTicks,
    SbtxMsgs,
    SbtxRetries,
    SbtxNoMem,
    /// Current sbtx queue depth.
    SbtxQueued,
    /// Queued messages discarded on disconnect.
    SbtxFree,
    SbtxTicks,
}

impl MuxCounter {
    pub const ALL: [MuxCounter; N_COUNTERS] = [
        MuxCounter::ExFrames,
        MuxCounter::ExBytes,
        MuxCounter::SbConnections,
        MuxCounter::SbRefused,
        MuxCounter::SbexInvalid,
        MuxCounter::SbexDropped,
        MuxCounter::SbrxInvalid,
        MuxCounter::SbrxNoDev,
        MuxCounter::SbrxNoMem,
        MuxCounter::SbrxMsgs,
        MuxCounter::SbrxTicks,
        MuxCounter::SbtxMsgs,
        MuxCounter::SbtxRetries,
        MuxCounter::SbtxNoMem,
        MuxCounter::SbtxQueued,
        MuxCounter::SbtxFree,
        MuxCounter::SbtxTicks,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MuxCounter::ExFrames => "ex_frames",
            MuxCounter::ExBytes => "ex_bytes",
            MuxCounter::SbConnections => "sb_connections",
            MuxCounter::SbRefused => "sb_refused",
            MuxCounter::SbexInvalid => "sbex_invalid",
            MuxCounter::SbexDropped => "sbex_dropped",
            MuxCounter::SbrxInvalid => "sbrx_invalid",
            MuxCounter::SbrxNoDev => "sbrx_no_dev",
            MuxCounter::SbrxNoMem => "sbrx_no_mem",
            MuxCounter::SbrxMsgs => "sbrx_msgs",
            MuxCounter::SbrxTicks => "sbrx_ticks",
            MuxCounter::SbtxMsgs => "sbtx_msgs",
            MuxCounter::SbtxRetries => "sbtx_retries",
            MuxCounter::SbtxNoMem => "sbtx_no_mem",
            MuxCounter::SbtxQueued => "sbtx_queued",
            MuxCounter::SbtxFree => "sbtx_free",
            MuxCounter::SbtxTicks => "sbtx_ticks",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct MuxCounters {
    slots: [AtomicU64; N_COUNTERS],
}

impl MuxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, c: MuxCounter) {
        self.add(c, 1);
    }

    pub fn add(&self, c: MuxCounter, n: u64) {
        self.slots[c.slot()].fetch_add(n, Ordering::Relaxed);
    }

    /// Saturating decrement, used for gauges like the queue depth.
    pub fn sub(&self, c: MuxCounter, n: u64) {
        let _ = self.slots[c.slot()].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_sub(n))
        });
    }

    pub fn get(&self, c: MuxCounter) -> u64 {
        self.slots[c.slot()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        MuxCounter::ALL
            .iter()
            .map(|c| (c.as_str(), self.get(*c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_distinct() {
        let counters = MuxCounters::new();
        for (i, c) in MuxCounter::ALL.iter().enumerate() {
            counters.add(*c, i as u64 + 1);
        }
        for (i, c) in MuxCounter::ALL.iter().enumerate() {
            assert_eq!(counters.get(*c), i as u64 + 1, "{}", c.as_str());
        }
    }

    #[test]
    fn test_sub_saturates() {
        let counters = MuxCounters::new();
        counters.add(MuxCounter::SbtxQueued, 2);
        counters.sub(MuxCounter::SbtxQueued, 5);
        assert_eq!(counters.get(MuxCounter::SbtxQueued), 0);
    }
}
