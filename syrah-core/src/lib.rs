pub mod copy;
pub mod drain;
pub mod signal;
pub mod version;

pub mod prelude {
	pub use std::fmt::{Debug, Display};
	pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
	pub use std::sync::{Arc, Mutex};
	pub use std::time::{Duration, Instant};

	pub use anyhow::Context as _;
	pub use bytes::Bytes;
	pub use tracing::{Instrument, debug, error, info, trace, warn};
}
