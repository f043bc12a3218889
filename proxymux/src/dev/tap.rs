//! TAP interfaces standing in for proxies on the host.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use nix::libc::{self, IFF_NO_PI, IFF_TAP, IFNAMSIZ, c_char, c_short};
use tracing::{debug, info};

use super::{DeviceFactory, DeviceSpec, NetDevice, RecvResult};

const TUNSETIFF: libc::Ioctl = 0x400454ca as libc::Ioctl;
const TUNSETCARRIER: libc::Ioctl = 0x400454e2 as libc::Ioctl;

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IFNAMSIZ],
    ifr_flags: c_short,
    _padding: [u8; 22],
}

pub struct TapDevice {
    name: String,
    file: File,
    ifindex: u32,
    mac: [u8; 6],
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name` with the given MAC and bring it up.
    pub fn create(name: &str, mac: [u8; 6]) -> io::Result<Self> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad interface name {name:?}"),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open("/dev/net/tun")?;

        let mut ifr = IfReq {
            ifr_name: ifname(name),
            ifr_flags: (IFF_TAP | IFF_NO_PI) as c_short,
            _padding: [0; 22],
        };

        let result = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        let ifindex = nix::net::if_::if_nametoindex(name).map_err(io::Error::from)?;

        let ctl = CtlSocket::open()?;
        ctl.set_mac(name, mac)?;
        ctl.set_up(name)?;

        info!(name, ifindex, "TAP device created");

        Ok(Self {
            name: name.to_string(),
            file,
            ifindex,
            mac,
        })
    }
}

impl NetDevice for TapDevice {
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
        CtlSocket::open()
            .and_then(|ctl| ctl.flags(&self.name))
            .map(|flags| flags & libc::IFF_UP != 0)
            .unwrap_or(false)
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let n = (&self.file).write(frame)?;
        if n != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short TAP write: {n} of {}", frame.len()),
            ));
        }
        Ok(())
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        match (&self.file).read(buf) {
            Ok(0) => Ok(RecvResult::Done),
            Ok(n) => Ok(RecvResult::Frame(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn set_carrier(&self, on: bool) -> io::Result<()> {
        let flag: libc::c_int = on.into();
        let result = unsafe { libc::ioctl(self.file.as_raw_fd(), TUNSETCARRIER, &flag) };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(name = %self.name, on, "TAP carrier");
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

/// Creates a [`TapDevice`] per proxy.
#[derive(Debug, Default)]
pub struct TapFactory;

impl DeviceFactory for TapFactory {
    fn create(&self, spec: &DeviceSpec) -> io::Result<Arc<dyn NetDevice>> {
        Ok(Arc::new(TapDevice::create(&spec.name, spec.mac)?))
    }
}

pub(crate) fn ifname(name: &str) -> [c_char; IFNAMSIZ] {
    let mut out = [0 as c_char; IFNAMSIZ];
    for (i, byte) in name.bytes().take(IFNAMSIZ - 1).enumerate() {
        out[i] = byte as c_char;
    }
    out
}

/// Datagram socket used only as an ioctl handle for interface flags and addresses.
pub(crate) struct CtlSocket(OwnedFd);

impl CtlSocket {
    pub(crate) fn open() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn request(name: &str) -> libc::ifreq {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        ifr.ifr_name = ifname(name);
        ifr
    }

    pub(crate) fn flags(&self, name: &str) -> io::Result<libc::c_int> {
        let mut ifr = Self::request(name);
        let ret = unsafe {
            libc::ioctl(
                self.0.as_raw_fd(),
                libc::SIOCGIFFLAGS as libc::Ioctl,
                &mut ifr,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(libc::c_int::from(unsafe { ifr.ifr_ifru.ifru_flags }))
    }

    pub(crate) fn set_up(&self, name: &str) -> io::Result<()> {
        let flags = self.flags(name)?;
        let mut ifr = Self::request(name);
        ifr.ifr_ifru.ifru_flags = (flags | libc::IFF_UP) as c_short;
        let ret = unsafe {
            libc::ioctl(
                self.0.as_raw_fd(),
                libc::SIOCSIFFLAGS as libc::Ioctl,
                &ifr,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn set_mac(&self, name: &str, mac: [u8; 6]) -> io::Result<()> {
        let mut ifr = Self::request(name);
        unsafe {
            ifr.ifr_ifru.ifru_hwaddr.sa_family = libc::ARPHRD_ETHER;
            for (dst, src) in ifr.ifr_ifru.ifru_hwaddr.sa_data.iter_mut().zip(mac) {
                *dst = src as c_char;
            }
        }
        let ret = unsafe {
            libc::ioctl(
                self.0.as_raw_fd(),
                libc::SIOCSIFHWADDR as libc::Ioctl,
                &ifr,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn mac(&self, name: &str) -> io::Result<[u8; 6]> {
        let mut ifr = Self::request(name);
        let ret = unsafe {
            libc::ioctl(
                self.0.as_raw_fd(),
                libc::SIOCGIFHWADDR as libc::Ioctl,
                &mut ifr,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        let data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
        Ok(std::array::from_fn(|i| data[i] as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifname_truncates() {
        let n = ifname("a-very-long-interface-name");
        assert_eq!(n[IFNAMSIZ - 1], 0);
        assert_eq!(n[0], b'a' as c_char);
    }

    #[test]
    fn test_rejects_bad_names() {
        assert!(TapDevice::create("", [0; 6]).is_err());
        assert!(TapDevice::create("sixteen-chars-xx", [0; 6]).is_err());
    }
}
