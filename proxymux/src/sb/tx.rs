//! Side-band transmit: enqueueing and the sender loop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{trace, warn};

use super::msg::Message;
use super::socket::SeqPacket;
use crate::counters::MuxCounter;
use crate::mux::Mux;

/// Doorbell wait while messages keep coming.
pub const SBTX_MIN_WAIT: Duration = Duration::from_millis(10);

/// Longest doorbell wait once the queue has been idle for a while.
pub const SBTX_MAX_WAIT: Duration = Duration::from_millis(320);

impl Mux {
    /// Encode and queue a message for the daemon.
    ///
    /// Returns false if the message was dropped: not connected, out of
    /// memory, or unencodable.
    pub(crate) fn enqueue(&self, msg: &Message) -> bool {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(msg.encoded_len()).is_err() {
            self.counters.inc(MuxCounter::SbtxNoMem);
            return false;
        }
        if let Err(e) = msg.encode_into(&mut buf) {
            warn!(kind = %msg.kind(), error = %e, "Dropping unencodable message");
            return false;
        }
        self.push(buf)
    }

    /// Queue a raw exception frame for the daemon.
    pub(crate) fn enqueue_frame(&self, frame: &[u8]) -> bool {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(frame.len()).is_err() {
            self.counters.inc(MuxCounter::SbtxNoMem);
            return false;
        }
        buf.extend_from_slice(frame);
        self.push(buf)
    }

    fn push(&self, buf: Vec<u8>) -> bool {
        // Count first so a fast sender never takes the gauge below zero.
        self.counters.inc(MuxCounter::SbtxQueued);
        if self.sbtx.push_back(buf).is_err() {
            self.counters.sub(MuxCounter::SbtxQueued, 1);
            return false;
        }
        true
    }

    /// Discard everything queued, closing the queue.
    pub(crate) fn flush_sbtx(&self) -> usize {
        let n = self.sbtx.close();
        self.counters.sub(MuxCounter::SbtxQueued, n as u64);
        self.counters.add(MuxCounter::SbtxFree, n as u64);
        n
    }
}

/// Drain the queue into `sock` until `stop` is set or the connection fails.
///
/// EAGAIN puts the message back at the head; more than the configured
/// number of consecutive retries breaks the connection, as does a short
/// write or any other send error.
pub(crate) fn run_sender(mux: &Mux, sock: &SeqPacket, stop: &AtomicBool) -> io::Result<()> {
    let limit = mux.config.sbtx_retry_limit;
    let mut wait = SBTX_MIN_WAIT;
    let mut retries = 0u32;

    while !stop.load(Ordering::SeqCst) {
        let Some(buf) = mux.sbtx.pop_front() else {
            let rung = mux.sbtx.wait(wait)?;
            mux.counters.inc(MuxCounter::SbtxTicks);
            wait = if rung {
                SBTX_MIN_WAIT
            } else {
                (wait * 2).min(SBTX_MAX_WAIT)
            };
            continue;
        };
        mux.counters.sub(MuxCounter::SbtxQueued, 1);

        match sock.send(&buf) {
            Ok(n) if n == buf.len() => {
                mux.counters.inc(MuxCounter::SbtxMsgs);
                trace!(len = n, "Side-band sent");
                retries = 0;
                wait = SBTX_MIN_WAIT;
            }
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short side-band write: {n} of {}", buf.len()),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                retries += 1;
                if retries > limit {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("side-band send retried {limit} times"),
                    ));
                }
                mux.counters.inc(MuxCounter::SbtxRetries);
                mux.counters.inc(MuxCounter::SbtxQueued);
                if mux.sbtx.push_front(buf).is_err() {
                    mux.counters.sub(MuxCounter::SbtxQueued, 1);
                }
                sock.wait_writable(wait)?;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
