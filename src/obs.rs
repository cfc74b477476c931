//! Observability helpers for broker operations.
//!
//! # Feature Flags
//!
//! - Spans named `keypool_broker.op` carry the `op` and `provider` fields and are always
//!   emitted through `tracing`; install a subscriber to see them.
//! - Enable `metrics` to export the `keypool_broker_op_total` counter (labeled by `op` and
//!   `outcome`), the `keypool_broker_queue_depth` gauge, and the
//!   `keypool_broker_reclaimed_total` counter (both labeled by `provider`).

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::_prelude::*;

/// Caller-facing broker operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BrokerOp {
	/// Waiting acquire.
	Acquire,
	/// Non-waiting acquire.
	TryAcquire,
	/// Lease heartbeat.
	Heartbeat,
	/// Lease release.
	Release,
	/// Queued request cancellation.
	Cancel,
	/// Extra rate usage on a held lease.
	Consume,
	/// Pool definition reconciliation.
	Reconcile,
	/// Reaper sweep.
	Sweep,
	/// Admin force-reclaim.
	ForceReclaim,
}
impl BrokerOp {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			BrokerOp::Acquire => "acquire",
			BrokerOp::TryAcquire => "try_acquire",
			BrokerOp::Heartbeat => "heartbeat",
			BrokerOp::Release => "release",
			BrokerOp::Cancel => "cancel",
			BrokerOp::Consume => "consume",
			BrokerOp::Reconcile => "reconcile",
			BrokerOp::Sweep => "sweep",
			BrokerOp::ForceReclaim => "force_reclaim",
		}
	}
}
impl Display for BrokerOp {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpOutcome {
	/// Entry to a broker operation.
	Attempt,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl OpOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			OpOutcome::Attempt => "attempt",
			OpOutcome::Success => "success",
			OpOutcome::Failure => "failure",
		}
	}
}
impl Display for OpOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}
