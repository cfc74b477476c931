// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	id::ProviderId,
	obs::{BrokerOp, OpOutcome},
};

/// Records an operation outcome via the global metrics recorder (when enabled).
pub fn record_op_outcome(op: BrokerOp, outcome: OpOutcome) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!(
			"keypool_broker_op_total",
			"op" => op.as_str(),
			"outcome" => outcome.as_str()
		)
		.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (op, outcome);
	}
}

/// Publishes the number of waiters queued for `provider`.
pub fn record_queue_depth(provider: &ProviderId, depth: usize) {
	#[cfg(feature = "metrics")]
	{
		metrics::gauge!("keypool_broker_queue_depth", "provider" => provider.to_string())
			.set(depth as f64);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = (provider, depth);
	}
}

/// Counts a lease reclaimed from an unresponsive holder.
pub fn record_reclaimed(provider: &ProviderId) {
	#[cfg(feature = "metrics")]
	{
		metrics::counter!("keypool_broker_reclaimed_total", "provider" => provider.to_string())
			.increment(1);
	}

	#[cfg(not(feature = "metrics"))]
	{
		let _ = provider;
	}
}

/// Thread-safe in-process counters, readable without a metrics recorder.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
	grants: AtomicU64,
	queued: AtomicU64,
	timeouts: AtomicU64,
	cancellations: AtomicU64,
	releases: AtomicU64,
	reclamations: AtomicU64,
}
impl BrokerMetrics {
	/// Returns the number of leases granted (immediately or from the queue).
	pub fn grants(&self) -> u64 {
		self.grants.load(Ordering::Relaxed)
	}

	/// Returns the number of requests that had to wait.
	pub fn queued(&self) -> u64 {
		self.queued.load(Ordering::Relaxed)
	}

	/// Returns the number of acquires that gave up at their deadline.
	pub fn timeouts(&self) -> u64 {
		self.timeouts.load(Ordering::Relaxed)
	}

	/// Returns the number of queued requests cancelled.
	pub fn cancellations(&self) -> u64 {
		self.cancellations.load(Ordering::Relaxed)
	}

	/// Returns the number of holder-initiated releases.
	pub fn releases(&self) -> u64 {
		self.releases.load(Ordering::Relaxed)
	}

	/// Returns the number of leases reclaimed by the reaper or an admin.
	pub fn reclamations(&self) -> u64 {
		self.reclamations.load(Ordering::Relaxed)
	}

	pub(crate) fn record_grant(&self) {
		self.grants.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_queued(&self) {
		self.queued.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_timeout(&self) {
		self.timeouts.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_cancellation(&self) {
		self.cancellations.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_release(&self) {
		self.releases.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_reclamation(&self) {
		self.reclamations.fetch_add(1, Ordering::Relaxed);
	}
}
