pub mod config;
pub mod counters;
pub mod dataplane;
pub mod dev;
pub mod dump;
pub mod error;
pub mod link_stats;
pub mod lower;
pub mod mux;
pub mod notify;
pub mod proxy;
pub mod registry;
pub mod sb;
pub mod xid;

pub use config::MuxConfig;
pub use error::{MuxError, Result};
pub use mux::{Mux, MuxBuilder};
pub use notify::{NoRoutes, RouteSource, StaticRoutes};
pub use proxy::{Proxy, ProxyKind, ProxyOps};
