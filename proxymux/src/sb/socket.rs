//! AF_UNIX SOCK_SEQPACKET sockets in the abstract namespace.
//!
//! Seqpacket keeps message boundaries, so one `send` is one message or one
//! exception frame on the other side.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

const LISTEN_BACKLOG: libc::c_int = 3;

/// Build `@name` as an abstract socket address.
fn abstract_addr(name: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bad socket name {name:?}"),
        ));
    }
    // sun_path[0] stays NUL for the abstract namespace.
    for (dst, src) in addr.sun_path[1..].iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + 1 + bytes.len();
    Ok((addr, len as libc::socklen_t))
}

fn seqpacket_socket(flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_UNIX,
            libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC | flags,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Poll one fd for `events`. Returns false on timeout or EINTR.
fn wait_fd(fd: RawFd, events: PollFlags, timeout: Duration) -> io::Result<bool> {
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(fd, events)];
    match poll(&mut fds, PollTimeout::from(ms)) {
        Ok(n) => Ok(n > 0),
        Err(nix::errno::Errno::EINTR) => Ok(false),
        Err(e) => Err(io::Error::from(e)),
    }
}

pub struct SeqPacketListener {
    fd: OwnedFd,
    name: String,
}

impl SeqPacketListener {
    pub fn bind(name: &str) -> io::Result<Self> {
        let (addr, len) = abstract_addr(name)?;
        let fd = seqpacket_socket(libc::SOCK_NONBLOCK)?;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accept one connection, waiting at most `timeout`.
    pub fn accept_timeout(&self, timeout: Duration) -> io::Result<Option<SeqPacket>> {
        if !wait_fd(self.fd.as_raw_fd(), PollFlags::POLLIN, timeout)? {
            return Ok(None);
        }
        let fd = unsafe {
            libc::accept4(
                self.fd.as_raw_fd(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(SeqPacket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }))
    }
}

/// One connected seqpacket endpoint.
pub struct SeqPacket {
    fd: OwnedFd,
}

impl SeqPacket {
    pub fn connect(name: &str) -> io::Result<Self> {
        let (addr, len) = abstract_addr(name)?;
        let fd = seqpacket_socket(0)?;
        let ret = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Non-blocking send of one packet.
    ///
    /// Returns `WouldBlock` when the peer's receive queue is full.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive one packet, waiting at most `timeout`.
    ///
    /// `Ok(None)` on timeout, `Ok(Some(0))` once the peer has hung up.
    pub fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !wait_fd(self.fd.as_raw_fd(), PollFlags::POLLIN, timeout)? {
            return Ok(None);
        }
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(n as usize))
    }

    /// Wait until a send would not block.
    pub fn wait_writable(&self, timeout: Duration) -> io::Result<bool> {
        wait_fd(self.fd.as_raw_fd(), PollFlags::POLLOUT, timeout)
    }

    /// Shut down both directions, waking any thread blocked on the socket.
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
    }
}

impl AsRawFd for SeqPacket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("proxymux-socket-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_abstract_addr_rejects_bad_names() {
        assert!(abstract_addr("").is_err());
        assert!(abstract_addr(&"x".repeat(200)).is_err());
        let (addr, len) = abstract_addr("mux").unwrap();
        assert_eq!(addr.sun_path[0], 0);
        assert_eq!(addr.sun_path[1], b'm' as libc::c_char);
        assert_eq!(len as usize, mem::size_of::<libc::sa_family_t>() + 4);
    }

    #[test]
    fn test_packets_keep_boundaries() {
        let name = unique_name("bounds");
        let listener = SeqPacketListener::bind(&name).unwrap();
        assert!(
            listener
                .accept_timeout(Duration::from_millis(10))
                .unwrap()
                .is_none()
        );

        let client = SeqPacket::connect(&name).unwrap();
        let server = listener
            .accept_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();

        client.send(&[1, 2, 3]).unwrap();
        client.send(&[4, 5]).unwrap();

        let mut buf = [0u8; 64];
        let n = server.recv_timeout(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(n, Some(3));
        let n = server.recv_timeout(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(n, Some(2));
        assert_eq!(&buf[..2], &[4, 5]);

        drop(client);
        let n = server.recv_timeout(&mut buf, Duration::from_secs(1)).unwrap();
        assert_eq!(n, Some(0));
    }

    #[test]
    fn test_bind_twice_fails() {
        let name = unique_name("twice");
        let _first = SeqPacketListener::bind(&name).unwrap();
        assert!(SeqPacketListener::bind(&name).is_err());
    }
}
