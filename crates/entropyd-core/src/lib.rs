//! # entropyd-core
//!
//! Concurrent entropy aggregation and quality-assurance pipeline.
//!
//! Hardware RNGs hand raw octets to per-source workers, which XOR-fold
//! them, run them through online health tests (FIPS 140-2 continuous tests
//! plus 8- and 16-bit ENT-style suites), and commit surviving bytes —
//! optionally XOR-combined across a group of independent devices — into a
//! bounded mixing pool. Consumers drain the pool: a kernel feeder that
//! revalidates and folds before crediting the OS, FD writers for arbitrary
//! byte sinks, and QA sinks that watch a device without contributing.
//!
//! ## Quick start
//!
//! ```no_run
//! use entropyd_core::{Daemon, SourceConfig};
//!
//! # fn open_device() -> Box<dyn entropyd_core::ByteSource> { unimplemented!() }
//! let mut daemon = Daemon::new(1 << 16).unwrap();
//! daemon.add_source(open_device(), SourceConfig::default()).unwrap();
//!
//! // Read health-checked entropy out of the pool.
//! let pool = daemon.pool();
//! let mut buf = [0u8; 256];
//! let got = pool.read(&mut buf);
//! assert_eq!(got, 256);
//! ```
//!
//! Health verdicts are hysteretic: a channel opens only after sustained
//! passing blocks and closes on a single detected anomaly. While a channel
//! is closed its bytes are dropped, readers simply block, and the control
//! registry keeps serving statistics so operators can see why.

pub mod daemon;
pub mod error;
pub mod fold;
pub mod group;
pub mod health;
pub mod hex;
pub mod kernel;
pub mod pool;
pub mod registry;
pub mod source;
pub mod stats;

mod feeder;
mod worker;

pub use daemon::Daemon;
pub use error::{DeviceError, DeviceErrorKind, Error, Result};
pub use health::HealthMonitor;
pub use pool::Pool;
pub use source::{ByteSource, SourceConfig};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
