//! Fake control daemon
//!
//! Speaks the side-band protocol from the daemon's end of the socket.

use std::io;
use std::time::{Duration, Instant};

use proxymux::sb::msg::{self, MAX_MSG_LEN, Message};
use proxymux::sb::socket::SeqPacket;

/// What one read from the side-band produced.
#[derive(Debug)]
pub enum Received {
    Msg(Message),
    /// A raw exception frame.
    Frame(Vec<u8>),
}

pub struct TestDaemon {
    sock: SeqPacket,
}

impl TestDaemon {
    /// Connect, retrying while the listener comes up.
    pub fn connect(name: &str, timeout: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match SeqPacket::connect(name) {
                Ok(sock) => return Ok(Self { sock }),
                Err(e) if Instant::now() >= deadline => return Err(e),
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    pub fn send(&self, m: &Message) {
        let buf = m.encode().expect("Failed to encode");
        self.send_raw(&buf);
    }

    pub fn send_raw(&self, buf: &[u8]) {
        let n = self.sock.send(buf).expect("Failed to send");
        assert_eq!(n, buf.len(), "short send");
    }

    /// Next buffer, `None` on timeout, empty once the mux hung up.
    pub fn recv_raw(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_MSG_LEN];
        let n = self
            .sock
            .recv_timeout(&mut buf, timeout)
            .expect("Failed to receive")?;
        buf.truncate(n);
        Some(buf)
    }

    pub fn recv(&self, timeout: Duration) -> Option<Received> {
        let buf = self.recv_raw(timeout)?;
        if buf.is_empty() {
            return None;
        }
        if msg::has_guard(&buf) {
            Some(Received::Msg(Message::decode(&buf).expect("Failed to decode")))
        } else {
            Some(Received::Frame(buf))
        }
    }

    /// Next control message, skipping exception frames.
    pub fn recv_msg(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.recv(left)? {
                Received::Msg(m) => return Some(m),
                Received::Frame(_) => continue,
            }
        }
    }

    /// Every message up to and including the next `Break`.
    pub fn collect_until_break(&self, timeout: Duration) -> Vec<Message> {
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        while let Some(m) = self.recv_msg(deadline.saturating_duration_since(Instant::now())) {
            let done = m == Message::Break;
            out.push(m);
            if done {
                return out;
            }
        }
        panic!("no Break within {timeout:?}, got {out:?}");
    }

    /// Whether the mux closed its end within `timeout`.
    pub fn is_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut buf = vec![0u8; MAX_MSG_LEN];
            match self.sock.recv_timeout(&mut buf, Duration::from_millis(20)) {
                Ok(Some(0)) | Err(_) => return true,
                Ok(_) => {}
            }
        }
        false
    }
}
