//! Network device abstraction for proxies and lowers
//!
//! The mux never talks to the host network stack directly. Each proxy owns a
//! `NetDevice` handed out by a `DeviceFactory`; each lower wraps one too.
//!
//! - `ChannelDevice`: in-memory device backed by crossbeam channels
//! - `TapDevice`: Linux TAP interface, one per proxy
//! - `PacketLower`: AF_PACKET socket bound to a physical uplink

pub mod packet;
pub mod tap;

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};

use crate::proxy::ProxyKind;

pub use packet::PacketLower;
pub use tap::{TapDevice, TapFactory};

/// Result of a receive operation
#[derive(Debug, PartialEq, Eq)]
pub enum RecvResult {
    /// Received a frame of the given length
    Frame(usize),
    /// Nothing available right now
    WouldBlock,
    /// Device is gone
    Done,
}

/// A host-side network interface.
///
/// `send` must not block: the dataplane calls it from the receive path.
pub trait NetDevice: Send + Sync {
    fn name(&self) -> &str;

    fn ifindex(&self) -> u32;

    fn mac(&self) -> [u8; 6];

    /// Whether the interface is administratively up and running.
    fn is_up(&self) -> bool;

    /// Hand a complete Ethernet frame to the interface.
    fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// Try to read one frame (non-blocking).
    fn try_recv(&self, _buf: &mut [u8]) -> io::Result<RecvResult> {
        Ok(RecvResult::Done)
    }

    /// Propagate carrier state to the host interface.
    fn set_carrier(&self, _on: bool) -> io::Result<()> {
        Ok(())
    }

    /// File descriptor for polling, if the device has one.
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

/// What the mux asks for when it creates a proxy interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    pub name: String,
    pub kind: ProxyKind,
    pub mac: [u8; 6],
}

pub trait DeviceFactory: Send + Sync {
    fn create(&self, spec: &DeviceSpec) -> io::Result<Arc<dyn NetDevice>>;

    /// Release whatever the factory keeps for a deleted interface.
    fn destroy(&self, _name: &str) {}
}

/// In-memory device.
///
/// Frames sent to the device land on an internal channel that tests (or a
/// dry-run daemon) drain with [`ChannelDevice::recv_timeout`]. Frames pushed
/// with [`ChannelDevice::inject`] come back out of `try_recv`.
pub struct ChannelDevice {
    name: String,
    ifindex: u32,
    mac: [u8; 6],
    up: AtomicBool,
    carrier: AtomicBool,
    sent_tx: Sender<Vec<u8>>,
    sent_rx: Receiver<Vec<u8>>,
    inject_tx: Sender<Vec<u8>>,
    inject_rx: Receiver<Vec<u8>>,
}

impl ChannelDevice {
    pub fn new(name: &str, ifindex: u32, mac: [u8; 6]) -> Self {
        let (sent_tx, sent_rx) = crossbeam_channel::unbounded();
        let (inject_tx, inject_rx) = crossbeam_channel::unbounded();
        Self {
            name: name.to_string(),
            ifindex,
            mac,
            up: AtomicBool::new(true),
            carrier: AtomicBool::new(false),
            sent_tx,
            sent_rx,
            inject_tx,
            inject_rx,
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn carrier(&self) -> bool {
        self.carrier.load(Ordering::SeqCst)
    }

    /// Next frame handed to this device, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.sent_rx.recv_timeout(timeout).ok()
    }

    /// All frames handed to this device so far.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.sent_rx.try_iter().collect()
    }

    /// Queue a frame as if the host had written it to the interface.
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.inject_tx.send(frame);
    }
}

impl NetDevice for ChannelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn mac(&self) -> [u8; 6] {
        self.mac
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.sent_tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device closed"))
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        match self.inject_rx.try_recv() {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(RecvResult::Frame(n))
            }
            Err(TryRecvError::Empty) => Ok(RecvResult::WouldBlock),
            Err(TryRecvError::Disconnected) => Ok(RecvResult::Done),
        }
    }

    fn set_carrier(&self, on: bool) -> io::Result<()> {
        self.carrier.store(on, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`ChannelDevice`]s.
///
/// Keeps every device it creates so callers can look them up by name.
pub struct ChannelFactory {
    next_ifindex: AtomicU32,
    devices: Mutex<HashMap<String, Arc<ChannelDevice>>>,
}

impl ChannelFactory {
    pub fn new() -> Self {
        Self {
            next_ifindex: AtomicU32::new(100),
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self, name: &str) -> Option<Arc<ChannelDevice>> {
        self.devices.lock().unwrap().get(name).cloned()
    }

    /// Build a standalone device, e.g. to stand in for a lower.
    pub fn make(&self, name: &str, mac: [u8; 6]) -> Arc<ChannelDevice> {
        let ifindex = self.next_ifindex.fetch_add(1, Ordering::Relaxed);
        let dev = Arc::new(ChannelDevice::new(name, ifindex, mac));
        self.devices
            .lock()
            .unwrap()
            .insert(name.to_string(), dev.clone());
        dev
    }
}

impl Default for ChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceFactory for ChannelFactory {
    fn create(&self, spec: &DeviceSpec) -> io::Result<Arc<dyn NetDevice>> {
        if self.devices.lock().unwrap().contains_key(&spec.name) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("device {} exists", spec.name),
            ));
        }
        Ok(self.make(&spec.name, spec.mac))
    }

    fn destroy(&self, name: &str) {
        self.devices.lock().unwrap().remove(name);
    }
}

/// Parse a MAC address from string
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

/// Offset a MAC address by `n`, carrying across the low three octets.
pub fn mac_add(base: [u8; 6], n: u32) -> [u8; 6] {
    let mut v = u64::from_be_bytes([0, 0, base[0], base[1], base[2], base[3], base[4], base[5]]);
    v = v.wrapping_add(u64::from(n)) & 0xffff_ffff_ffff;
    let b = v.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("52:54:00:12:34:56").unwrap();
        assert_eq!(mac, [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

        assert!(parse_mac("invalid").is_none());
        assert!(parse_mac("52:54:00:12:34").is_none());
        assert!(parse_mac("GG:54:00:12:34:56").is_none());
    }

    #[test]
    fn test_mac_add_carries() {
        assert_eq!(
            mac_add([0x02, 0, 0, 0, 0, 0xff], 1),
            [0x02, 0, 0, 0, 1, 0x00]
        );
        assert_eq!(mac_add([0x02, 0, 0, 0, 0, 0], 0), [0x02, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_channel_device_send_and_inject() {
        let factory = ChannelFactory::new();
        let spec = DeviceSpec {
            name: "xe1".to_string(),
            kind: ProxyKind::Port,
            mac: [2, 0, 0, 0, 0, 1],
        };
        let dev = factory.create(&spec).unwrap();
        assert!(factory.create(&spec).is_err());

        dev.send(&[1, 2, 3]).unwrap();
        let chan = factory.device("xe1").unwrap();
        assert_eq!(chan.drain(), vec![vec![1, 2, 3]]);

        chan.inject(vec![9; 20]);
        let mut buf = [0u8; 64];
        assert_eq!(dev.try_recv(&mut buf).unwrap(), RecvResult::Frame(20));
        assert_eq!(dev.try_recv(&mut buf).unwrap(), RecvResult::WouldBlock);
    }

    #[test]
    fn test_channel_factory_destroy_frees_name() {
        let factory = ChannelFactory::new();
        let spec = DeviceSpec {
            name: "xe1".to_string(),
            kind: ProxyKind::Port,
            mac: [2, 0, 0, 0, 0, 1],
        };
        let first = factory.create(&spec).unwrap();
        factory.destroy("xe1");
        assert!(factory.device("xe1").is_none());

        let second = factory.create(&spec).unwrap();
        assert_ne!(first.ifindex(), second.ifindex());
        factory.destroy("missing");
    }
}
