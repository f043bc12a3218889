//! Frame path between proxies and lowers.

pub mod encap;
pub mod engine;
pub mod worker;

pub use engine::{RxVerdict, TxDrop, TxVerdict};
