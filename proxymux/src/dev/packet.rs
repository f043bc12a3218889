//! Physical uplinks opened as AF_PACKET sockets.
//!
//! Most NICs strip the outer VLAN tag on receive and report it out of band,
//! so the socket asks for `PACKET_AUXDATA` and splices the tag back in
//! before the frame reaches the demultiplexer.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::libc;
use tracing::info;

use super::tap::CtlSocket;
use super::{NetDevice, RecvResult};
use crate::dataplane::encap::{ETH_P_8021Q, VLAN_HLEN};

const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;

/// MAC destination and source precede the tag.
const TAG_OFFSET: usize = 12;

pub struct PacketLower {
    name: String,
    ifindex: u32,
    mac: [u8; 6],
    fd: OwnedFd,
    /// Kept open for flag and address reads on the transmit path.
    ctl: CtlSocket,
}

impl PacketLower {
    pub fn open(name: &str) -> io::Result<Self> {
        let ifindex = nix::net::if_::if_nametoindex(name).map_err(io::Error::from)?;
        let proto = (libc::ETH_P_ALL as u16).to_be();

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::c_int::from(proto),
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = proto;
        sll.sll_ifindex = ifindex as i32;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let on: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_AUXDATA,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let ctl = CtlSocket::open()?;
        let mac = ctl.mac(name)?;
        info!(name, ifindex, "Lower attached");

        Ok(Self {
            name: name.to_string(),
            ifindex,
            mac,
            fd,
            ctl,
        })
    }
}

impl NetDevice for PacketLower {
    fn name(&self) -> &str {
        &self.name
    }

    fn ifindex(&self) -> u32 {
        self.ifindex
    }

    fn mac(&self) -> [u8; 6] {
        self.ctl.mac(&self.name).unwrap_or(self.mac)
    }

    fn is_up(&self) -> bool {
        self.ctl
            .flags(&self.name)
            .map(|f| f & libc::IFF_UP != 0 && f & libc::IFF_RUNNING != 0)
            .unwrap_or(false)
    }

    fn send(&self, frame: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<RecvResult> {
        if buf.len() <= VLAN_HLEN + TAG_OFFSET {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "buffer too small"));
        }
        let room = buf.len() - VLAN_HLEN;

        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: room,
        };
        let mut control = [0u64; 8];
        let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };

        // Our own transmits loop back on the socket; skip them.
        let mut len = loop {
            msg.msg_name = &mut from as *mut libc::sockaddr_ll as *mut libc::c_void;
            msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = mem::size_of_val(&control) as _;

            let n = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    return Ok(RecvResult::WouldBlock);
                }
                return Err(err);
            }
            if !is_outgoing(&from) {
                break n as usize;
            }
        };

        let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        while !cmsg.is_null() {
            let hdr = unsafe { &*cmsg };
            if hdr.cmsg_level == libc::SOL_PACKET && hdr.cmsg_type == libc::PACKET_AUXDATA {
                let aux: libc::tpacket_auxdata = unsafe {
                    std::ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const libc::tpacket_auxdata)
                };
                if aux.tp_status & TP_STATUS_VLAN_VALID != 0 && len >= TAG_OFFSET {
                    let tpid = if aux.tp_status & TP_STATUS_VLAN_TPID_VALID != 0 {
                        aux.tp_vlan_tpid
                    } else {
                        ETH_P_8021Q
                    };
                    len = splice_tag(buf, len, tpid, aux.tp_vlan_tci);
                }
            }
            cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
        }

        Ok(RecvResult::Frame(len))
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.fd.as_raw_fd())
    }
}

fn is_outgoing(from: &libc::sockaddr_ll) -> bool {
    from.sll_pkttype == libc::PACKET_OUTGOING
}

/// Re-insert a stripped tag after the MAC addresses. `buf` must have
/// `VLAN_HLEN` spare bytes past `len`.
fn splice_tag(buf: &mut [u8], len: usize, tpid: u16, tci: u16) -> usize {
    buf.copy_within(TAG_OFFSET..len, TAG_OFFSET + VLAN_HLEN);
    buf[TAG_OFFSET..TAG_OFFSET + 2].copy_from_slice(&tpid.to_be_bytes());
    buf[TAG_OFFSET + 2..TAG_OFFSET + 4].copy_from_slice(&tci.to_be_bytes());
    len + VLAN_HLEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splice_tag() {
        let mut buf = vec![0u8; 64];
        buf[..12].copy_from_slice(&[1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 2]);
        buf[12..14].copy_from_slice(&[0x08, 0x00]);
        buf[14..18].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let len = splice_tag(&mut buf, 18, ETH_P_8021Q, 0x0f9f);
        assert_eq!(len, 22);
        assert_eq!(&buf[12..16], &[0x81, 0x00, 0x0f, 0x9f]);
        assert_eq!(&buf[16..22], &[0x08, 0x00, 0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_outgoing_frames_are_skipped() {
        let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
        from.sll_pkttype = libc::PACKET_HOST;
        assert!(!is_outgoing(&from));
        from.sll_pkttype = libc::PACKET_MULTICAST;
        assert!(!is_outgoing(&from));
        from.sll_pkttype = libc::PACKET_OUTGOING;
        assert!(is_outgoing(&from));
    }
}
