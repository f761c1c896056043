//! Core contracts for the larch coordination backend.
//!
//! This crate defines the seams between the three parties involved in the
//! backend:
//!
//! - [`Backend`] / [`Lock`] - the surface consumed by the host system:
//!   durable key-value persistence plus fair, preemption-safe mutual
//!   exclusion with asynchronous loss notification
//! - [`CoordClient`] - the narrow contract the backend requires from the
//!   coordination-service client library (atomic in-order creation, TTLs,
//!   long-poll watches)
//! - [`Entry`] and the error taxonomy exchanged across both seams
//!
//! Implementations live elsewhere: `larch-etcd` provides the backend over
//! any [`CoordClient`], and `larch-testing` provides a deterministic
//! in-memory client for tests.

mod backend;
mod client;
pub mod constants;
mod entry;
mod error;

pub use backend::Backend;
pub use backend::Lock;
pub use backend::LockValue;
pub use client::ClientResponse;
pub use client::CoordClient;
pub use client::EtcdAction;
pub use client::EtcdNode;
pub use entry::Entry;
pub use error::BackendError;
pub use error::ClientError;
