//! Reader threads for devices backed by a file descriptor.
//!
//! Each TAP proxy and each AF_PACKET lower gets one thread that polls the
//! fd and hands every frame to a callback. In-memory devices have no fd and
//! are driven by direct calls instead.

use std::io;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, trace};

use crate::dev::{NetDevice, RecvResult};
use crate::sb::msg::MAX_MSG_LEN;

/// Poll timeout, so the thread notices `stop` promptly.
const POLL_TIMEOUT_MS: u16 = 100;

/// Frames drained per wakeup before polling again.
const BATCH_LIMIT: usize = 64;

pub struct WorkerHandle {
    name: String,
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> Result<(), String> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("{} thread panicked", self.name)),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a reader for `device`, or return `None` if it has nothing to poll.
pub fn spawn_reader<F>(
    name: String,
    device: Arc<dyn NetDevice>,
    on_frame: F,
) -> io::Result<Option<WorkerHandle>>
where
    F: FnMut(&[u8]) + Send + 'static,
{
    if device.poll_fd().is_none() {
        return Ok(None);
    }
    let shutdown = Arc::new(AtomicBool::new(false));
    let stop = shutdown.clone();
    let thread_name = name.clone();

    let thread = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            if let Err(e) = run_reader(&*device, &stop, on_frame) {
                error!(worker = %thread_name, error = %e, "Reader failed");
            }
            debug!(worker = %thread_name, "Reader exited");
        })?;

    Ok(Some(WorkerHandle {
        name,
        thread: Some(thread),
        shutdown,
    }))
}

fn run_reader<F>(device: &dyn NetDevice, stop: &AtomicBool, mut on_frame: F) -> io::Result<()>
where
    F: FnMut(&[u8]),
{
    let Some(fd) = device.poll_fd() else {
        return Ok(());
    };
    let mut buf = vec![0u8; MAX_MSG_LEN];

    while !stop.load(Ordering::SeqCst) {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) | Err(nix::errno::Errno::EINTR) => continue,
            Ok(_) => {}
            Err(e) => return Err(io::Error::from(e)),
        }

        for _ in 0..BATCH_LIMIT {
            match device.try_recv(&mut buf)? {
                RecvResult::Frame(n) => {
                    trace!(device = device.name(), len = n, "Frame read");
                    on_frame(&buf[..n]);
                }
                RecvResult::WouldBlock => break,
                RecvResult::Done => return Ok(()),
            }
        }
    }
    Ok(())
}
