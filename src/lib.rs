//! latency-clients library crate: the shared pieces behind the `replier` and
//! `requestor` binaries.

pub mod cli;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod payload;
pub mod roles;
pub mod shutdown;
pub mod transport;

pub use config::{ClientConfig, ClientOption, Role};
pub use metrics::stats::Stats;
pub use shutdown::{ShutdownCoordinator, ShutdownStrategy};
pub use transport::{Transport, TransportError};
