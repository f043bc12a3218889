//! Side-band receive: buffer classification and message dispatch.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::msg::{self, MAX_MSG_LEN, Message};
use super::socket::SeqPacket;
use crate::counters::MuxCounter;
use crate::error::{LinkError, MuxError, ProtocolError, RegistryError};
use crate::mux::Mux;
use crate::proxy::ProxyOps;

/// Receive poll interval, so the loop notices `stop`.
pub const SBRX_POLL: Duration = Duration::from_millis(10);

impl Mux {
    /// Handle one buffer read from the side-band.
    ///
    /// Buffers that open with the zero guard are messages; anything else is
    /// an exception frame headed for a proxy.
    pub(crate) fn handle_sb_buffer(&self, buf: &mut [u8]) {
        if !msg::has_guard(buf) {
            self.inject_exception(buf);
            return;
        }
        self.counters.inc(MuxCounter::SbrxMsgs);

        let result = Message::decode(buf)
            .map_err(MuxError::from)
            .and_then(|m| self.dispatch(m));
        if let Err(e) = result {
            match &e {
                MuxError::Registry(RegistryError::NotFound(_)) => {
                    self.counters.inc(MuxCounter::SbrxNoDev)
                }
                _ => self.counters.inc(MuxCounter::SbrxInvalid),
            }
            warn!(error = %e, len = buf.len(), "Dropped side-band message");
        }
    }

    fn dispatch(&self, m: Message) -> Result<(), MuxError> {
        trace!(kind = %m.kind(), "Side-band message");
        match m {
            Message::Carrier(c) => {
                let proxy = self.registry.lookup(c.xid)?;
                proxy.set_carrier(c.on)?;
                debug!(xid = c.xid, on = c.on, "Carrier");
            }
            Message::LinkStat(s) => {
                let proxy = self.registry.lookup(s.xid)?;
                if !proxy.link_stats().set(s.index, s.count) {
                    return Err(ProtocolError::BadIndex {
                        kind: msg::MsgKind::LinkStat,
                        index: s.index,
                    }
                    .into());
                }
            }
            Message::EthtoolStat(s) => {
                let proxy = self.registry.lookup(s.xid)?;
                let port = proxy.port().ok_or_else(|| LinkError::WrongKind {
                    xid: s.xid,
                    kind: proxy.kind(),
                    expected: "port",
                })?;
                if !port.set_stat(s.index, s.count) {
                    return Err(ProtocolError::BadIndex {
                        kind: msg::MsgKind::EthtoolStat,
                        index: s.index,
                    }
                    .into());
                }
            }
            Message::Speed(s) => {
                let proxy = self.registry.lookup(s.xid)?;
                let port = proxy.port().ok_or_else(|| LinkError::WrongKind {
                    xid: s.xid,
                    kind: proxy.kind(),
                    expected: "port",
                })?;
                port.set_speed(s.mbps);
                debug!(xid = s.xid, mbps = s.mbps, "Speed");
            }
            Message::DumpIfinfo => {
                self.dump();
            }
            Message::DumpFibinfo => {
                self.dump_fibinfo();
            }
            other => return Err(ProtocolError::Unexpected(other.kind()).into()),
        }
        Ok(())
    }
}

/// Read buffers from `sock` until `stop` is set, the peer hangs up, or the
/// socket fails.
pub(crate) fn run_receiver(mux: &Mux, sock: &SeqPacket, stop: &AtomicBool) -> io::Result<()> {
    let mut buf = Vec::new();
    if buf.try_reserve_exact(MAX_MSG_LEN).is_err() {
        mux.counters.inc(MuxCounter::SbrxNoMem);
        return Err(io::Error::from(io::ErrorKind::OutOfMemory));
    }
    buf.resize(MAX_MSG_LEN, 0);

    while !stop.load(Ordering::SeqCst) {
        let got = sock.recv_timeout(&mut buf, SBRX_POLL)?;
        mux.counters.inc(MuxCounter::SbrxTicks);
        match got {
            None => continue,
            Some(0) => {
                debug!("Side-band peer hung up");
                return Ok(());
            }
            Some(n) => mux.handle_sb_buffer(&mut buf[..n]),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::MuxConfig;
    use crate::link_stats::LinkStat;
    use crate::sb::msg::{Carrier, Speed, Stat};

    fn mux_with_port() -> (Arc<Mux>, u32) {
        let config = MuxConfig::default().with_stat_names(["a", "b"]);
        let mux = Mux::builder(config).build().unwrap();
        let xid = mux.create_port("xe1", None).unwrap().xid();
        (mux, xid)
    }

    fn feed(mux: &Mux, m: Message) {
        let mut buf = m.encode().unwrap();
        mux.handle_sb_buffer(&mut buf);
    }

    #[test]
    fn test_carrier_and_speed() {
        let (mux, xid) = mux_with_port();
        feed(&mux, Message::Carrier(Carrier { xid, on: true }));
        feed(&mux, Message::Speed(Speed { xid, mbps: 25_000 }));

        let port = mux.registry().lookup(xid).unwrap();
        assert!(port.carrier());
        assert_eq!(port.port().unwrap().settings().speed, 25_000);
        assert_eq!(mux.counters().get(MuxCounter::SbrxMsgs), 2);
    }

    #[test]
    fn test_stat_indices_checked() {
        let (mux, xid) = mux_with_port();
        feed(&mux, Message::LinkStat(Stat { xid, index: 0, count: 9 }));
        feed(&mux, Message::LinkStat(Stat { xid, index: 24, count: 9 }));
        feed(&mux, Message::EthtoolStat(Stat { xid, index: 1, count: 5 }));
        feed(&mux, Message::EthtoolStat(Stat { xid, index: 2, count: 5 }));

        let port = mux.registry().lookup(xid).unwrap();
        assert_eq!(port.link_stats().get(LinkStat::RxPackets), 9);
        assert_eq!(port.port().unwrap().stat(1), Some(5));
        assert_eq!(mux.counters().get(MuxCounter::SbrxInvalid), 2);
    }

    #[test]
    fn test_unknown_xid_and_unexpected_kind() {
        let (mux, _) = mux_with_port();
        feed(&mux, Message::Carrier(Carrier { xid: 7, on: true }));
        assert_eq!(mux.counters().get(MuxCounter::SbrxNoDev), 1);

        feed(&mux, Message::NetnsAdd(5));
        assert_eq!(mux.counters().get(MuxCounter::SbrxInvalid), 1);
    }

    #[test]
    fn test_bad_version_is_counted() {
        let (mux, xid) = mux_with_port();
        let mut buf = Message::Carrier(Carrier { xid, on: true }).encode().unwrap();
        buf[msg::GUARD_LEN] = msg::VERSION + 1;
        mux.handle_sb_buffer(&mut buf);

        assert_eq!(mux.counters().get(MuxCounter::SbrxInvalid), 1);
        assert!(!mux.registry().lookup(xid).unwrap().carrier());
    }
}
