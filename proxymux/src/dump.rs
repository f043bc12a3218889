//! Full-state dump sent to the daemon.
//!
//! Order matters to the daemon: ports first (each followed by its ethtool
//! state and addresses), then lags, VLANs, bridges and loopbacks, then a
//! membership pass, then `Break`.

use tracing::info;

use crate::mux::{Mux, settings_message};
use crate::proxy::{Proxy, ProxyKind, ProxyOps};
use crate::sb::msg::{ChangeUpperXid, EthtoolFlags, IfinfoReason, LinkModes, Message};

/// Kinds in dump order.
const DUMP_ORDER: [ProxyKind; 5] = [
    ProxyKind::Port,
    ProxyKind::Lag,
    ProxyKind::Vlan,
    ProxyKind::Bridge,
    ProxyKind::Loopback,
];

/// Messages describing one proxy, in dump order.
fn proxy_messages(proxy: &Proxy) -> Vec<Message> {
    let xid = proxy.xid();
    let mut out = vec![Message::Ifinfo(proxy.ifinfo(IfinfoReason::Dump))];
    if let Some(port) = proxy.port() {
        out.push(settings_message(xid, port.settings()));
        out.push(Message::EthtoolLinkModesAdvertising(LinkModes {
            xid,
            modes: port.advertising(),
        }));
        out.push(Message::EthtoolFlags(EthtoolFlags {
            xid,
            flags: port.flags(),
        }));
    }
    out.extend(proxy.addr_messages());
    out
}

impl Mux {
    /// Every message of a full dump, without sending anything.
    pub fn dump_messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        for kind in DUMP_ORDER {
            for proxy in self.registry.snapshot_kind(kind) {
                out.extend(proxy_messages(&proxy));
            }
        }

        for kind in [ProxyKind::Lag, ProxyKind::Bridge] {
            for upper in self.registry.snapshot_kind(kind) {
                let Some(members) = upper.members() else {
                    continue;
                };
                out.extend(members.list().into_iter().map(|lower| {
                    Message::ChangeUpperXid(ChangeUpperXid {
                        upper: upper.xid(),
                        lower,
                        linking: true,
                    })
                }));
            }
        }
        out.push(Message::Break);
        out
    }

    /// Start forwarding address and namespace events, then queue a full
    /// dump.
    ///
    /// Forwarding goes first so an event racing the snapshot is at worst
    /// sent twice, never lost.
    pub(crate) fn dump(&self) {
        self.forwarding.enable_netdev();
        let msgs = self.dump_messages();
        let total = msgs.len();
        let queued = msgs.iter().filter(|m| self.enqueue(m)).count();
        info!(queued, total, "Dump queued");
    }

    /// Replay the route tables, then start forwarding route and neighbour
    /// events.
    pub(crate) fn dump_fibinfo(&self) {
        let mut queued = 0;
        for entry in self.routes.fib() {
            queued += usize::from(self.enqueue(&Message::FibEntry(entry)));
        }
        for entry in self.routes.fib6() {
            queued += usize::from(self.enqueue(&Message::Fib6Entry(entry)));
        }
        for neigh in self.routes.neighbours() {
            queued += usize::from(self.enqueue(&Message::NeighUpdate(neigh)));
        }
        self.enqueue(&Message::Break);
        self.forwarding.enable_fib();
        self.forwarding.enable_neigh();
        info!(queued, "Fib dump queued");
    }
}
