//! Interface ids carried in VLAN tags.
//!
//! A single tag carries a 12-bit xid. VLAN proxies stack a second tag, so
//! their xid is `vid << 12 | lower_xid` where `lower_xid` names the port or
//! lag the VLAN rides on.

use serde::{Deserialize, Serialize};

pub const VID_BITS: u32 = 12;
pub const VID_MASK: u32 = (1 << VID_BITS) - 1;

/// Highest usable VLAN id. 0 and 4095 are reserved by 802.1Q.
pub const MAX_VID: u16 = 4094;

/// Build the xid of a VLAN proxy stacked on `lower`.
pub fn vlan_xid(lower: u32, vid: u16) -> u32 {
    (u32::from(vid) << VID_BITS) | (lower & VID_MASK)
}

/// Low (outer tag) half of an xid.
pub fn low(xid: u32) -> u16 {
    (xid & VID_MASK) as u16
}

/// High (inner tag) half of an xid.
pub fn high(xid: u32) -> u16 {
    ((xid >> VID_BITS) & VID_MASK) as u16
}

/// Inclusive range of xids, scanned in one direction by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidRange {
    pub first: u32,
    pub last: u32,
}

impl XidRange {
    pub const fn new(first: u32, last: u32) -> Self {
        Self { first, last }
    }

    pub fn contains(&self, xid: u32) -> bool {
        (self.first..=self.last).contains(&xid)
    }

    pub fn is_valid(&self) -> bool {
        self.first != 0 && self.first <= self.last && self.last <= VID_MASK
    }
}

/// Scan order used when allocating from an [`XidRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Highest free id first (ports).
    Down,
    /// Lowest free id first (lags, bridges, loopbacks).
    Up,
}

impl Direction {
    pub fn scan(self, range: XidRange) -> Box<dyn Iterator<Item = u32>> {
        let ids = range.first..=range.last;
        match self {
            Direction::Down => Box::new(ids.rev()),
            Direction::Up => Box::new(ids),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_xid_split() {
        let xid = vlan_xid(3999, 100);
        assert_eq!(xid, 100 * 4096 + 3999);
        assert_eq!(low(xid), 3999);
        assert_eq!(high(xid), 100);
    }

    #[test]
    fn test_range_validity() {
        assert!(XidRange::new(3000, 3999).is_valid());
        assert!(!XidRange::new(0, 10).is_valid());
        assert!(!XidRange::new(10, 9).is_valid());
        assert!(!XidRange::new(1, 4096).is_valid());
    }

    #[test]
    fn test_scan_order() {
        let r = XidRange::new(5, 7);
        assert_eq!(Direction::Down.scan(r).collect::<Vec<_>>(), vec![7, 6, 5]);
        assert_eq!(Direction::Up.scan(r).collect::<Vec<_>>(), vec![5, 6, 7]);
    }
}
