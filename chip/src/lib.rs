mod bus;
mod channel;
mod config;
mod controller;
mod driver;
mod error;
mod host;
pub mod icmp;
pub mod layout;
mod ping;
pub mod regs;
mod shared;
mod types;

pub use bus::{Bus, IndirectBus, port};
pub use config::{NetworkConfig, NetworkConfigProvider, StaticConfig, format_mac, parse_mac};
pub use controller::{Controller, HostParts};
pub use driver::Driver;
pub use error::ChipError;
pub use host::{DiagnosticSink, HostSockets, SocketFactory, TracingDiagnostics};
pub use ping::{HostProber, Ping, PingOutcome, PingSimulator, Prober};
pub use types::*;
