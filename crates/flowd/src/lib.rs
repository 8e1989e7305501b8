//! # flowd
//!
//! Flow lifecycle tracking and marking daemon. Connections are observed,
//! tagged with an experiment and activity, and reported to backends as
//! `start`/`end` events.
//!
//! ## Key Components
//!
//! ### Producers
//! - [`ConnectionTracker`] - Diff successive connection snapshots
//! - [`ProcNetSource`] / [`SsSource`] - Connection snapshots
//! - [`FireflyListener`] / `NpApiPipe` - Externally supplied records
//!
//! ### Distribution
//! - [`EventBus`] - Fan-out of every record to every backend
//!
//! ### Backends
//! - [`FlowLabelEncoder`] - IPv6 flow labels through a tc classifier
//! - [`FireflyEncoder`] - UDP fireflies
//! - [`PrometheusBackend`] - Per-flow gauges at `/metrics`
//!
//! ## Example
//!
//! ```rust,ignore
//! use flowd::{Config, service};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = Config::load("/etc/flowd/flowd.toml")?;
//! service::run(config, CancellationToken::new()).await?;
//! ```

pub mod backends;
pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod http;
pub mod metrics;
pub mod net;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod socket;
pub mod sources;
pub mod tracker;

// ============================================================================
// Configuration
// ============================================================================

pub use config::Config;

// ============================================================================
// Errors
// ============================================================================

pub use error::{FlowError, FlowResult};

// ============================================================================
// Flow Records
// ============================================================================

pub use flow::{FlowKey, FlowRecord, FlowState, Identifier, TcpStats, TcpStatus};

// ============================================================================
// Event Bus
// ============================================================================

pub use bus::{EventBus, Recv, Subscription};

// ============================================================================
// Producers
// ============================================================================

pub use snapshot::{ConnectionEntry, ProcNetSource, SnapshotSource, SsSource};
pub use sources::{FireflyListener, SourceKind};
pub use tracker::{ConnectionTracker, IdentifierPolicy, IdentifierPool, TrackerMode};

// ============================================================================
// Backends
// ============================================================================

pub use backends::{
    BackendKind, FireflyBackend, FireflyEncoder, FlowLabelEncoder, MarkingTable,
    MemoryMarkingTable, PrometheusBackend,
};

// ============================================================================
// Registry & Discovery
// ============================================================================

pub use discovery::{Discovery, IpConfig};
pub use registry::Registry;

// ============================================================================
// Metrics
// ============================================================================

pub use metrics::Metrics;

// ============================================================================
// Socket Utilities
// ============================================================================

pub use socket::DualStackSocket;
