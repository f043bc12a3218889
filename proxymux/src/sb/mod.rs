//! Side-band channel to the control daemon.
//!
//! A single AF_UNIX seqpacket connection carries both control messages
//! (guard-prefixed, see `msg`) and raw exception frames.

pub mod channel;
pub mod msg;
pub mod queue;
pub mod rx;
pub mod socket;
pub mod tx;

pub use channel::ChannelState;
pub use msg::{Message, MsgKind};
