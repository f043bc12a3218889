//! Outbound side-band queue with eventfd wakeup.
//!
//! Producers (link events, the dump walker, the dataplane exception path)
//! append encoded buffers; the single `sb-tx` thread drains them. The open
//! flag lives under the same lock as the entries, so a close flushes
//! atomically and nothing queued for a dead connection leaks into the next.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

struct Inner {
    open: bool,
    entries: VecDeque<Vec<u8>>,
}

pub struct SbQueue {
    inner: Mutex<Inner>,
    eventfd: OwnedFd,
}

impl SbQueue {
    /// Create a closed queue.
    pub fn new() -> io::Result<Self> {
        let eventfd = unsafe {
            let fd = libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(fd)
        };
        Ok(Self {
            inner: Mutex::new(Inner {
                open: false,
                entries: VecDeque::new(),
            }),
            eventfd,
        })
    }

    /// Accept entries from now on.
    pub fn open(&self) {
        self.inner.lock().unwrap().open = true;
    }

    /// Stop accepting entries and discard what is queued.
    ///
    /// Returns the number of entries discarded.
    pub fn close(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
        let n = inner.entries.len();
        inner.entries.clear();
        n
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().unwrap().open
    }

    /// Append an entry and ring the doorbell.
    ///
    /// Hands the buffer back if the queue is closed.
    pub fn push_back(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.open {
                return Err(buf);
            }
            inner.entries.push_back(buf);
        }
        self.signal();
        Ok(())
    }

    /// Put back an entry the sender could not write.
    pub fn push_front(&self, buf: Vec<u8>) -> Result<(), Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.open {
            return Err(buf);
        }
        inner.entries.push_front(buf);
        Ok(())
    }

    pub fn pop_front(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake the sender without queueing anything.
    pub fn signal(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    /// Block until the doorbell rings or `timeout` passes.
    ///
    /// Returns true if woken by the doorbell. The eventfd is drained either way.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let fd = unsafe { BorrowedFd::borrow_raw(self.eventfd.as_raw_fd()) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        let ready = match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(n) => n > 0,
            Err(nix::errno::Errno::EINTR) => false,
            Err(e) => return Err(io::Error::from(e)),
        };
        self.drain_eventfd();
        Ok(ready)
    }

    fn drain_eventfd(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.eventfd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_closed_queue_rejects() {
        let q = SbQueue::new().unwrap();
        assert_eq!(q.push_back(vec![1]), Err(vec![1]));
        assert!(q.is_empty());

        q.open();
        q.push_back(vec![1]).unwrap();
        q.push_back(vec![2]).unwrap();
        q.push_front(vec![0]).unwrap();
        assert_eq!(q.pop_front(), Some(vec![0]));
        assert_eq!(q.pop_front(), Some(vec![1]));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_close_discards() {
        let q = SbQueue::new().unwrap();
        q.open();
        for i in 0..5u8 {
            q.push_back(vec![i]).unwrap();
        }
        assert_eq!(q.close(), 5);
        assert!(q.is_empty());
        assert!(!q.is_open());
        assert_eq!(q.close(), 0);
        assert!(q.push_front(vec![9]).is_err());
    }

    #[test]
    fn test_wait_times_out_then_wakes() {
        let q = Arc::new(SbQueue::new().unwrap());
        assert!(!q.wait(Duration::from_millis(10)).unwrap());

        q.open();
        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                q.push_back(vec![42]).unwrap();
            })
        };
        assert!(q.wait(Duration::from_secs(2)).unwrap());
        producer.join().unwrap();
        assert_eq!(q.pop_front(), Some(vec![42]));

        // The doorbell was drained by the previous wait.
        assert!(!q.wait(Duration::from_millis(10)).unwrap());
    }
}
