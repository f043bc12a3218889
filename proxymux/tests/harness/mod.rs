//! Test harness for side-band integration tests
//!
//! Stands in for the control daemon and builds muxes on in-memory devices.

#![allow(dead_code)]

pub mod daemon;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use proxymux::dev::{ChannelDevice, ChannelFactory};
use proxymux::{Mux, MuxConfig};

pub use daemon::{Received, TestDaemon};

/// How long helpers wait for the mux threads to catch up.
pub const WAIT: Duration = Duration::from_secs(3);

static NEXT: AtomicU32 = AtomicU32::new(0);

/// Socket name nobody else in this run (or a parallel run) is using.
pub fn unique_name(tag: &str) -> String {
    let n = NEXT.fetch_add(1, Ordering::Relaxed);
    format!("proxymux-it-{tag}-{}-{n}", std::process::id())
}

/// A mux on in-memory devices with one lower attached.
pub struct TestMux {
    pub mux: Arc<Mux>,
    pub factory: Arc<ChannelFactory>,
    pub lower: Arc<ChannelDevice>,
    pub name: String,
}

impl TestMux {
    pub fn new(tag: &str) -> Self {
        Self::with_config(MuxConfig::default().with_name(unique_name(tag)))
    }

    pub fn with_config(config: MuxConfig) -> Self {
        let name = config.name.clone();
        let factory = Arc::new(ChannelFactory::new());
        let mux = Mux::builder(config)
            .devices(factory.clone())
            .build()
            .expect("Failed to build mux");
        let lower = factory.make("eth1", [2, 0, 0, 0, 0xff, 1]);
        mux.attach_lower(lower.clone()).expect("Failed to attach lower");
        Self {
            mux,
            factory,
            lower,
            name,
        }
    }

    /// Start the side-band and connect a fake daemon to it.
    pub fn start_and_connect(&self) -> TestDaemon {
        self.mux.start().expect("Failed to start mux");
        let daemon = TestDaemon::connect(&self.name, WAIT).expect("Failed to connect");
        assert!(
            wait_for(WAIT, || self.mux.is_connected()),
            "mux never saw the connection"
        );
        daemon
    }
}

impl Drop for TestMux {
    fn drop(&mut self) {
        self.mux.stop();
    }
}

/// Poll `cond` until it holds or `timeout` runs out.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
