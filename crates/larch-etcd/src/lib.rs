//! Key-value persistence and fair distributed locking over an etcd-style
//! coordination service.
//!
//! This crate provides the two services of the larch backend:
//!
//! - [`EtcdBackend`] - durable storage of opaque byte values under string
//!   keys, with single-level listings
//! - [`EtcdLock`] - fair FIFO mutual exclusion with asynchronous loss
//!   notification, built on the service's atomic in-order key creation,
//!   TTLs, and long-poll watches
//!
//! Both run against any [`larch_core::CoordClient`]; constructing the real
//! client from [`EtcdConfig::endpoints`] is the embedder's concern.
//!
//! ## Layout on the coordination service
//!
//! For a root prefix `/vault` and user key `a/b`:
//!
//! ```text
//! /vault/a/.b      value node: base64 of the entry bytes
//! /vault/a/_b/     lock queue, hidden from listings of /vault/a
//!     00000000000000000001      TTL 15 s, value = holder identifier
//!     00000000000000000002
//! ```
//!
//! ## Lock example
//!
//! ```ignore
//! let backend = EtcdBackend::new(&conf, client).await?;
//! let handle = backend.lock_with("core/leader", "node-1");
//!
//! let lost = handle.lock(CancellationToken::new()).await?;
//! // Critical section; `lost` fires if the hold is ever broken.
//! handle.unlock().await?;
//! ```

mod backend;
mod config;
mod lock;
mod metrics;
pub mod paths;

pub use backend::EtcdBackend;
pub use config::EtcdConfig;
pub use lock::EtcdLock;
pub use metrics::MetricsSnapshot;
pub use metrics::OpMeasurement;
pub use metrics::BACKEND_NAME;
