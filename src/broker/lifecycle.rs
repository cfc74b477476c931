//! Holder-side lease lifecycle: heartbeat, extra usage, release, and scoped use.

// self
use crate::{
	_prelude::*,
	broker::{AcquireRequest, Broker},
	id::LeaseId,
	lease::{Lease, LeaseEnd, ReleaseOutcome},
	obs::{self, BrokerOp, OpOutcome, OpSpan},
};

impl Broker {
	/// Re-arms the lease deadline.
	///
	/// [`Error::LeaseNotFound`] means the lease already ended (released or reclaimed) and the
	/// holder should stop using the credential.
	pub fn heartbeat(&self, lease_id: &LeaseId) -> Result<Lease> {
		const OP: BrokerOp = BrokerOp::Heartbeat;

		let result = self.leases.heartbeat(lease_id, self.now());

		match &result {
			Ok(lease) => {
				obs::record_op_outcome(OP, OpOutcome::Success);
				tracing::debug!(lease = %lease_id, deadline = %lease.ttl_deadline, "Lease heartbeat.");
			},
			Err(_) => {
				obs::record_op_outcome(OP, OpOutcome::Failure);
				tracing::debug!(lease = %lease_id, "Heartbeat for an ended lease.");
			},
		}

		result
	}

	/// Ends a lease after a successful call. Idempotent.
	pub fn release(&self, lease_id: &LeaseId) -> ReleaseOutcome {
		self.release_as(lease_id, LeaseEnd::Released)
	}

	/// Ends a lease with an explicit end state and re-offers its capacity. Idempotent.
	pub fn release_as(&self, lease_id: &LeaseId, end: LeaseEnd) -> ReleaseOutcome {
		let Some(lease) = self.leases.release(lease_id) else {
			tracing::debug!(lease = %lease_id, "Release of an ended lease ignored.");

			return ReleaseOutcome::AlreadyEnded;
		};
		let _span = OpSpan::new(BrokerOp::Release, Some(&lease.provider)).entered();

		self.metrics.record_release();
		self.record_end(&lease, end, self.now());
		obs::record_op_outcome(BrokerOp::Release, OpOutcome::Success);
		tracing::info!(lease = %lease.id, key = %lease.key_id, end = %end, "Lease released.");
		self.pump(&lease.provider);

		ReleaseOutcome::Released
	}

	/// Charges `units` of extra rate budget to the lease's key; false when the minute is spent.
	pub fn consume(&self, lease_id: &LeaseId, units: u32) -> Result<bool> {
		let lease = self
			.leases
			.get(lease_id)
			.ok_or_else(|| Error::LeaseNotFound { lease: lease_id.clone() })?;
		let record =
			self.registry.get(lease.key_id).ok_or(Error::UnknownKey { key: lease.key_id })?;
		let consumed = self.rate.try_consume_units(&record, units, self.now());

		obs::record_op_outcome(
			BrokerOp::Consume,
			if consumed { OpOutcome::Success } else { OpOutcome::Failure },
		);

		Ok(consumed)
	}

	/// Acquires a lease, runs `f` with it, and releases it as `Released` or `Failed` depending
	/// on the outcome.
	pub async fn with_lease<F, Fut, T, E>(&self, request: AcquireRequest, f: F) -> Result<T, E>
	where
		F: FnOnce(Lease) -> Fut,
		Fut: Future<Output = Result<T, E>>,
		E: From<Error>,
	{
		let lease = self.acquire(request).await?;
		let lease_id = lease.id.clone();
		let result = f(lease).await;
		let end = if result.is_ok() { LeaseEnd::Released } else { LeaseEnd::Failed };

		self.release_as(&lease_id, end);

		result
	}

	/// Admin force-reclaim of a specific lease.
	pub fn force_reclaim(&self, lease_id: &LeaseId) -> Result<Lease> {
		let lease = self
			.leases
			.release(lease_id)
			.ok_or_else(|| Error::LeaseNotFound { lease: lease_id.clone() })?;
		let _span = OpSpan::new(BrokerOp::ForceReclaim, Some(&lease.provider)).entered();

		self.metrics.record_reclamation();
		self.record_end(&lease, LeaseEnd::Revoked, self.now());
		obs::record_op_outcome(BrokerOp::ForceReclaim, OpOutcome::Success);
		obs::record_reclaimed(&lease.provider);
		tracing::warn!(lease = %lease.id, holder = %lease.holder, "Lease revoked by an admin.");
		self.pump(&lease.provider);

		Ok(lease)
	}
}
