//! Side-band connection lifecycle.
//!
//! One listener thread accepts the daemon. At most one connection is live;
//! it runs an `sb-rx` and an `sb-tx` thread. Whichever of the two exits
//! first tears the connection down, and the listener reaps it before
//! accepting the next one.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::rx::run_receiver;
use super::socket::{SeqPacket, SeqPacketListener};
use super::tx::run_sender;
use crate::counters::MuxCounter;
use crate::mux::Mux;
use crate::proxy::ProxyOps;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Listening,
    Connected,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Listening => "listening",
            ChannelState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A live daemon connection and its two threads.
struct Connection {
    sock: Arc<SeqPacket>,
    stop: Arc<AtomicBool>,
    rx: Option<JoinHandle<()>>,
    tx: Option<JoinHandle<()>>,
}

impl Connection {
    fn start(mux: Arc<Mux>, sock: SeqPacket) -> io::Result<Self> {
        let sock = Arc::new(sock);
        let stop = Arc::new(AtomicBool::new(false));
        mux.connect();

        let rx = spawn_side(&mux, &sock, &stop, "sb-rx", run_receiver);
        let rx = match rx {
            Ok(h) => h,
            Err(e) => {
                mux.disconnect();
                return Err(e);
            }
        };
        let tx = match spawn_side(&mux, &sock, &stop, "sb-tx", run_sender) {
            Ok(h) => h,
            Err(e) => {
                teardown(&mux, &sock, &stop);
                let _ = rx.join();
                return Err(e);
            }
        };

        Ok(Self {
            sock,
            stop,
            rx: Some(rx),
            tx: Some(tx),
        })
    }

    fn is_finished(&self) -> bool {
        [&self.rx, &self.tx]
            .iter()
            .all(|h| h.as_ref().is_none_or(|h| h.is_finished()))
    }

    /// Torn down from one side, threads possibly still exiting.
    fn is_closing(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn close(mut self, mux: &Mux) {
        teardown(mux, &self.sock, &self.stop);
        for handle in [self.rx.take(), self.tx.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("Side-band thread panicked");
            }
        }
    }
}

type SideFn = fn(&Mux, &SeqPacket, &AtomicBool) -> io::Result<()>;

fn spawn_side(
    mux: &Arc<Mux>,
    sock: &Arc<SeqPacket>,
    stop: &Arc<AtomicBool>,
    name: &'static str,
    run: SideFn,
) -> io::Result<JoinHandle<()>> {
    let mux = mux.clone();
    let sock = sock.clone();
    let stop = stop.clone();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        match run(&mux, &sock, &stop) {
            Ok(()) => debug!(thread = name, "Side-band thread exited"),
            Err(e) => warn!(thread = name, error = %e, "Side-band connection failed"),
        }
        teardown(&mux, &sock, &stop);
    })
}

/// Stop both sides of a connection and fall back to listening.
fn teardown(mux: &Mux, sock: &SeqPacket, stop: &AtomicBool) {
    stop.store(true, Ordering::SeqCst);
    sock.shutdown();
    mux.sbtx.signal();
    mux.disconnect();
}

/// Start the accept loop on its own thread.
///
/// The thread only holds a weak reference, so dropping the last `Arc<Mux>`
/// is never blocked by the listener itself.
pub(crate) fn spawn_listener(
    mux: Weak<Mux>,
    listener: SeqPacketListener,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("sb-listen".to_string())
        .spawn(move || {
            if let Err(e) = run_listener(&mux, &listener, &stop) {
                error!(name = listener.name(), error = %e, "Side-band listener failed");
            }
            debug!(name = listener.name(), "Side-band listener exited");
        })
}

fn run_listener(mux: &Weak<Mux>, listener: &SeqPacketListener, stop: &AtomicBool) -> io::Result<()> {
    let mut conn: Option<Connection> = None;

    while !stop.load(Ordering::SeqCst) {
        let Some(mux) = mux.upgrade() else {
            break;
        };
        if let Some(done) = conn.take_if(|c| c.is_finished()) {
            done.close(&mux);
            debug!("Side-band connection reaped");
        }

        let Some(sock) = listener.accept_timeout(ACCEPT_POLL)? else {
            continue;
        };
        if let Some(old) = conn.take_if(|c| c.is_closing()) {
            old.close(&mux);
        }
        if conn.is_some() {
            mux.counters.inc(MuxCounter::SbRefused);
            warn!(name = listener.name(), "Refusing second side-band connection");
            drop(sock);
            continue;
        }
        match Connection::start(mux, sock) {
            Ok(c) => conn = Some(c),
            Err(e) => error!(error = %e, "Failed to start side-band connection"),
        }
    }

    if let Some(c) = conn.take() {
        match mux.upgrade() {
            Some(mux) => c.close(&mux),
            None => {
                c.stop.store(true, Ordering::SeqCst);
                c.sock.shutdown();
            }
        }
    }
    Ok(())
}

impl Mux {
    /// Enter the connected state: fresh stats, an open queue and, if
    /// configured, a full dump.
    pub(crate) fn connect(&self) {
        {
            let mut state = self.state.lock().unwrap();
            self.counters.inc(MuxCounter::SbConnections);
            for proxy in self.registry.snapshot() {
                proxy.reset_stats();
            }
            self.sbtx.open();
            *state = ChannelState::Connected;
        }
        info!(name = %self.config.name, "Side-band connected");

        if self.config.dump_on_connect {
            self.dump();
        }
    }

    /// Fall back to listening: flush the queue, force every carrier down
    /// and stop forwarding events. Safe to call more than once.
    pub(crate) fn disconnect(&self) {
        let was = {
            let mut state = self.state.lock().unwrap();
            let flushed = self.flush_sbtx();
            if flushed > 0 {
                debug!(flushed, "Side-band queue flushed");
            }
            self.forwarding.reset();
            std::mem::replace(&mut *state, ChannelState::Listening)
        };

        for proxy in self.registry.snapshot() {
            if let Err(e) = proxy.set_carrier(false) {
                warn!(xid = proxy.xid(), error = %e, "Failed to drop carrier");
            }
        }
        if was == ChannelState::Connected {
            info!(name = %self.config.name, "Side-band disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MuxConfig;

    #[test]
    fn test_connect_resets_and_opens() {
        let mux = Mux::builder(MuxConfig::default().with_dump_on_connect(false))
            .build()
            .unwrap();
        let xid = mux.create_port("xe1", None).unwrap().xid();
        let port = mux.registry().lookup(xid).unwrap();
        port.link_stats().set(0, 42);
        port.set_carrier(true).unwrap();

        mux.connect();
        assert!(mux.is_connected());
        assert_eq!(port.link_stats().get(crate::link_stats::LinkStat::RxPackets), 0);
        assert!(mux.sbtx.is_empty());
        assert_eq!(mux.counters().get(MuxCounter::SbConnections), 1);

        mux.disconnect();
        assert_eq!(mux.state(), ChannelState::Listening);
        assert!(!port.carrier());
        assert!(!mux.sbtx.is_open());
        mux.disconnect();
        assert_eq!(mux.state(), ChannelState::Listening);
    }

    #[test]
    fn test_connect_dumps_when_configured() {
        let mux = Mux::builder(MuxConfig::default()).build().unwrap();
        mux.create_port("xe1", None).unwrap();

        mux.connect();
        // Ifinfo, settings, link modes, flags, Break.
        assert_eq!(mux.sbtx.len(), 5);
        mux.disconnect();
        assert_eq!(mux.sbtx.len(), 0);
    }
}
