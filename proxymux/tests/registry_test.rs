//! Registry concurrency tests
//!
//! Lookups run on dataplane threads while the control path registers and
//! unregisters proxies.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use proxymux::dev::ChannelDevice;
use proxymux::error::RegistryError;
use proxymux::proxy::{Proxy, ProxyVariant};
use proxymux::registry::ProxyRegistry;
use proxymux::xid::{Direction, XidRange};
use proxymux::{ProxyKind, ProxyOps};

fn loopback(xid: u32) -> Proxy {
    let dev = Arc::new(ChannelDevice::new(&format!("lo{xid}"), xid, [2, 0, 0, 0, 0, 1]));
    Proxy::new(xid, dev, ProxyVariant::Loopback)
}

#[test]
fn test_lookups_during_churn() {
    let reg = Arc::new(ProxyRegistry::new());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let reg = reg.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut hits = 0u64;
                while !done.load(Ordering::Relaxed) {
                    for xid in 3000..3100 {
                        if let Some(p) = reg.get(xid) {
                            assert_eq!(p.xid(), xid);
                            hits += 1;
                        }
                        if let Some(p) = reg.lookup_by_ifindex(xid) {
                            assert_eq!(p.xid(), xid);
                            hits += 1;
                        }
                    }
                }
                hits
            })
        })
        .collect();

    for round in 0..20 {
        for xid in 3000..3100 {
            reg.register(Arc::new(loopback(xid))).unwrap();
        }
        assert_eq!(reg.len(), 100);
        if round < 19 {
            for xid in 3000..3100 {
                reg.unregister(xid).unwrap();
            }
            assert!(reg.is_empty());
        }
    }
    done.store(true, Ordering::Relaxed);

    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(reg.snapshot_kind(ProxyKind::Loopback).len(), 100);
}

#[test]
fn test_parallel_allocation_is_unique() {
    let reg = Arc::new(ProxyRegistry::new());
    let range = XidRange::new(3000, 3063);

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let reg = reg.clone();
            thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    let made = reg.register_next(ProxyKind::Loopback, range, Direction::Up, |xid| {
                        Ok::<_, RegistryError>(loopback(xid))
                    });
                    match made {
                        Ok(p) => got.push(p.xid()),
                        Err(RegistryError::ExhaustedRange { .. }) => return got,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            })
        })
        .collect();

    let mut all = HashSet::new();
    for w in workers {
        for xid in w.join().unwrap() {
            assert!(all.insert(xid), "xid {xid} handed out twice");
        }
    }
    assert_eq!(all.len(), 64);
    assert!(all.iter().all(|x| range.contains(*x)));
}
