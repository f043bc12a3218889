//! Transmit and receive paths.
//!
//! Nothing here returns an error: every drop is accounted in a link stat or
//! a mux counter and the caller gets a verdict.

use tracing::trace;

use super::encap::{self, Decoded, MIN_TAGGED_LEN};
use crate::counters::MuxCounter;
use crate::link_stats::{LinkStat, LinkStats};
use crate::lower::Selection;
use crate::mux::Mux;
use crate::proxy::ProxyOps;

/// What happened to a frame received on a lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// Delivered to the proxy with this xid.
    Delivered(u32),
    /// Not mux traffic; leave it to the host stack.
    PassThrough,
    /// Forwarded to the daemon as an exception frame.
    Exception,
    Dropped,
}

/// Why a transmit was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxDrop {
    NoProxy,
    NoCarrier,
    TooShort,
    /// No lowers, or a VLAN whose port or lag is gone.
    NoLower,
    /// Lowers exist but none is up.
    NoneUp,
    DeviceError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVerdict {
    /// Sent on the lower with this index.
    Sent(usize),
    Dropped(TxDrop),
}

fn drop_with(stats: &LinkStats, specific: LinkStat) {
    stats.inc(LinkStat::TxErrors);
    stats.inc(specific);
}

impl Mux {
    /// Priority actually written to the tag of a data frame.
    fn data_pcp(&self, pcp: u8) -> u8 {
        let pcp = pcp & 0x7;
        let ex = self.config.exception_priority;
        if pcp != ex {
            pcp
        } else if ex == 0 {
            1
        } else {
            ex - 1
        }
    }

    /// Send a frame from proxy `xid` out a lower.
    pub fn transmit(&self, xid: u32, frame: &[u8], pcp: u8) -> TxVerdict {
        let Some(proxy) = self.registry.get(xid) else {
            self.link_stats.inc(LinkStat::TxDropped);
            return TxVerdict::Dropped(TxDrop::NoProxy);
        };
        let stats = proxy.link_stats();

        let Some(encap) = proxy.on_transmit() else {
            stats.inc(LinkStat::TxDropped);
            return TxVerdict::Dropped(TxDrop::NoCarrier);
        };
        if let Some(lower) = proxy.vlan_lower()
            && !self.registry.contains(lower)
        {
            drop_with(stats, LinkStat::TxAbortedErrors);
            return TxVerdict::Dropped(TxDrop::NoLower);
        }
        let Some(wire) = encap::encapsulate(frame, encap, self.data_pcp(pcp)) else {
            drop_with(stats, LinkStat::TxDropped);
            return TxVerdict::Dropped(TxDrop::TooShort);
        };

        let lower = match self.lowers.select(encap::flow_hash(frame)) {
            Selection::Lower(lower) => lower,
            Selection::NoneUp => {
                drop_with(stats, LinkStat::TxHeartbeatErrors);
                return TxVerdict::Dropped(TxDrop::NoneUp);
            }
            Selection::Empty => {
                drop_with(stats, LinkStat::TxAbortedErrors);
                return TxVerdict::Dropped(TxDrop::NoLower);
            }
        };

        match lower.device().send(&wire) {
            Ok(()) => {
                stats.inc(LinkStat::TxPackets);
                stats.add(LinkStat::TxBytes, frame.len() as u64);
                trace!(xid, lower = lower.index(), len = wire.len(), "Transmit");
                TxVerdict::Sent(lower.index())
            }
            Err(e) => {
                trace!(xid, lower = lower.index(), error = %e, "Transmit failed");
                drop_with(stats, LinkStat::TxCarrierErrors);
                TxVerdict::Dropped(TxDrop::DeviceError)
            }
        }
    }

    /// Demultiplex a frame received on lower `lower`.
    pub fn receive(&self, lower: usize, frame: &[u8]) -> RxVerdict {
        if !self.lowers.get(lower).is_some_and(|l| l.is_registered()) {
            return RxVerdict::PassThrough;
        }
        if frame.len() < MIN_TAGGED_LEN {
            self.rx_length_error();
            return RxVerdict::Dropped;
        }
        let (outer, xid, tag_len) = match encap::decode(frame) {
            Ok(Decoded::Tagged {
                outer,
                xid,
                tag_len,
                ..
            }) => (outer, xid, tag_len),
            Ok(Decoded::Untagged) => return RxVerdict::PassThrough,
            Err(_) => {
                self.rx_length_error();
                return RxVerdict::Dropped;
            }
        };

        if outer.pcp == self.config.exception_priority {
            return if self.forward_exception(frame) {
                RxVerdict::Exception
            } else {
                RxVerdict::Dropped
            };
        }

        if self.deliver(xid, frame, tag_len) {
            RxVerdict::Delivered(xid)
        } else {
            self.link_stats.inc(LinkStat::RxErrors);
            self.link_stats.inc(LinkStat::RxNohandler);
            RxVerdict::Dropped
        }
    }

    fn rx_length_error(&self) {
        self.link_stats.inc(LinkStat::RxErrors);
        self.link_stats.inc(LinkStat::RxLengthErrors);
    }

    /// Strip the tags and hand the frame to the proxy owning `xid`.
    ///
    /// Returns false if no proxy has that xid.
    fn deliver(&self, xid: u32, frame: &[u8], tag_len: usize) -> bool {
        let Some(proxy) = self.registry.get(xid) else {
            trace!(xid, "No proxy for frame");
            return false;
        };
        let inner = encap::strip(frame, tag_len);
        let stats = proxy.link_stats();
        match proxy.device().send(&inner) {
            Ok(()) => {
                stats.inc(LinkStat::RxPackets);
                stats.add(LinkStat::RxBytes, inner.len() as u64);
            }
            Err(e) => {
                trace!(xid, error = %e, "Delivery failed");
                stats.inc(LinkStat::RxDropped);
            }
        }
        true
    }

    /// Queue a raw frame for the daemon. Returns false if it was dropped.
    fn forward_exception(&self, frame: &[u8]) -> bool {
        if self.enqueue_frame(frame) {
            self.counters.inc(MuxCounter::ExFrames);
            self.counters.add(MuxCounter::ExBytes, frame.len() as u64);
            true
        } else {
            self.counters.inc(MuxCounter::SbexDropped);
            false
        }
    }

    /// Deliver an exception frame the daemon sent back over the side-band.
    ///
    /// The priority bits are cleared first so the frame reads as ordinary
    /// traffic.
    pub(crate) fn inject_exception(&self, frame: &mut [u8]) {
        if frame.len() < MIN_TAGGED_LEN || !encap::set_outer_pcp(frame, 0) {
            self.counters.inc(MuxCounter::SbexInvalid);
            return;
        }
        match encap::decode(frame) {
            Ok(Decoded::Tagged { xid, tag_len, .. }) => {
                if !self.deliver(xid, frame, tag_len) {
                    self.counters.inc(MuxCounter::SbexDropped);
                }
            }
            _ => self.counters.inc(MuxCounter::SbexInvalid),
        }
    }
}
