//! Swappable diagnostics sink.
//!
//! The builder's structural state is single-writer and externally
//! serialized. The one concurrency-safe exception is the diagnostics sink,
//! which sits behind its own lock so a sink swap never contends with a
//! structural operation and never touches the version counter.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::DeviceId;

/// A diagnostic event emitted by the builder.
#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    /// A device was installed in the registry.
    DeviceAdded {
        /// The assigned device id.
        id: DeviceId,
    },
    /// A device was queued for removal.
    DeviceRemoved {
        /// The removed device id.
        id: DeviceId,
    },
    /// A device weight changed.
    WeightChanged {
        /// The device id.
        id: DeviceId,
        /// The new weight.
        weight: f64,
    },
    /// A rebalance invocation started.
    RebalanceStarted {
        /// Builder version at the start of the run.
        version: u64,
    },
    /// One gather/reassign pass completed.
    RebalancePass {
        /// Pass number within the invocation, starting at 1.
        pass: usize,
        /// Residual balance after the pass.
        balance: f64,
        /// Partition replicas relocated during the pass.
        parts_moved: usize,
    },
    /// A rebalance invocation finished.
    RebalanceFinished {
        /// Total partition replicas relocated.
        parts_moved: usize,
        /// Final residual balance.
        balance: f64,
    },
}

/// Receives diagnostic events from a [`crate::RingBuilder`].
///
/// Implementations must be cheap and non-blocking; they run on the caller's
/// thread in the middle of builder operations.
pub trait DiagnosticSink: Send + Sync {
    /// Handle one event.
    fn record(&self, event: &DiagnosticEvent);
}

/// Shared handle to the optional sink.
#[derive(Clone, Default)]
pub(crate) struct DiagHandle {
    sink: Arc<RwLock<Option<Arc<dyn DiagnosticSink>>>>,
}

impl DiagHandle {
    pub(crate) fn set(&self, sink: Arc<dyn DiagnosticSink>) {
        *self.sink.write() = Some(sink);
    }

    pub(crate) fn clear(&self) {
        *self.sink.write() = None;
    }

    pub(crate) fn emit(&self, event: DiagnosticEvent) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink.record(&event);
        }
    }
}

impl fmt::Debug for DiagHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed = self.sink.read().is_some();
        f.debug_struct("DiagHandle").field("installed", &installed).finish()
    }
}
