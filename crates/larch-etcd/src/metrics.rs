//! Wall-clock measurements for KV operations.
//!
//! Each `put`/`get`/`delete`/`list` call records one measurement named
//! `etcd.{operation}`. Lock operations record nothing. Counters are
//! lock-free so recording never contends with the operations it measures.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tracing::trace;

/// Namespace prefix of every measurement emitted by this backend.
pub const BACKEND_NAME: &str = "etcd";

/// The four measured KV operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Put,
    Get,
    Delete,
    List,
}

impl Operation {
    fn name(self) -> &'static str {
        match self {
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::List => "list",
        }
    }
}

#[derive(Debug, Default)]
struct OpCell {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl OpCell {
    fn measure(&self, name: String) -> OpMeasurement {
        OpMeasurement {
            name,
            count: self.count.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
        }
    }
}

/// Per-operation call counts and cumulative durations.
#[derive(Debug, Default)]
pub struct BackendMetrics {
    put: OpCell,
    get: OpCell,
    delete: OpCell,
    list: OpCell,
}

impl BackendMetrics {
    fn cell(&self, op: Operation) -> &OpCell {
        match op {
            Operation::Put => &self.put,
            Operation::Get => &self.get,
            Operation::Delete => &self.delete,
            Operation::List => &self.list,
        }
    }

    /// Record one completed operation. Failed operations are measured too;
    /// the measurement covers the full call, not just the happy path.
    pub(crate) fn record(&self, op: Operation, elapsed: Duration) {
        let cell = self.cell(op);
        cell.count.fetch_add(1, Ordering::Relaxed);
        cell.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        trace!(
            measurement = %format!("{BACKEND_NAME}.{}", op.name()),
            duration_us = elapsed.as_micros() as u64,
            "kv operation measured"
        );
    }

    /// Snapshot all measurements.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let measure = |op: Operation| {
            self.cell(op)
                .measure(format!("{BACKEND_NAME}.{}", op.name()))
        };
        MetricsSnapshot {
            operations: vec![
                measure(Operation::Put),
                measure(Operation::Get),
                measure(Operation::Delete),
                measure(Operation::List),
            ],
        }
    }
}

/// Point-in-time view of all measurement series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub operations: Vec<OpMeasurement>,
}

/// One named measurement series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMeasurement {
    /// Measurement name, e.g. `etcd.put`.
    pub name: String,
    /// Number of recorded calls.
    pub count: u64,
    /// Cumulative wall-clock duration in microseconds.
    pub total_micros: u64,
}
