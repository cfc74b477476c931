//! Admission: waiting and non-waiting acquire, cancellation, and diagnosis.
//!
//! A waiting acquire first checks that some key could ever serve the request, then either
//! takes capacity immediately or joins the provider queue. Once queued, the caller parks on a
//! oneshot channel until a release, reclamation, or sweep hands it a lease, or until its own
//! deadline passes. A drop guard withdraws the waiter if the future is dropped and rolls
//! back a lease that raced with the drop.

// crates.io
use tokio::sync::oneshot;
// self
use crate::{
	_prelude::*,
	broker::{AcquireRequest, Broker},
	clock,
	id::{ProviderId, RequestId, TenantId},
	lease::{Exhaustion, Lease, LeaseTerms},
	obs::{self, BrokerOp, OpOutcome, OpSpan},
	queue::{Admission, AdmissionStatus, BlockReason, Resolution},
};

/// Upper bound on waiting for a resolution that was dequeued just as the deadline passed.
const RESOLUTION_GRACE: std::time::Duration = std::time::Duration::from_millis(250);

impl Broker {
	/// Leases a credential for `request`, queueing until capacity frees or the timeout elapses.
	///
	/// Fails fast with [`Error::NoEligibleKey`] when no active key matches the provider and
	/// tenant; capacity and rate exhaustion only ever show up as waiting (then
	/// [`Error::Timeout`]).
	pub async fn acquire(&self, request: AcquireRequest) -> Result<Lease> {
		const OP: BrokerOp = BrokerOp::Acquire;

		let span = OpSpan::new(OP, Some(&request.provider));

		obs::record_op_outcome(OP, OpOutcome::Attempt);

		let result = span.instrument(self.acquire_inner(request)).await;

		match &result {
			Ok(_) => obs::record_op_outcome(OP, OpOutcome::Success),
			Err(_) => obs::record_op_outcome(OP, OpOutcome::Failure),
		}

		result
	}

	/// Grants immediately or fails with [`Error::Unavailable`]; never queues.
	///
	/// While other requests wait for the provider the answer is [`BlockReason::Queued`], so a
	/// non-waiting caller cannot overtake them.
	pub fn try_acquire(&self, request: AcquireRequest) -> Result<Lease> {
		const OP: BrokerOp = BrokerOp::TryAcquire;

		let _span = OpSpan::new(OP, Some(&request.provider)).entered();

		obs::record_op_outcome(OP, OpOutcome::Attempt);

		let result = self.try_acquire_inner(&request);

		match &result {
			Ok(lease) => {
				self.metrics.record_grant();
				obs::record_op_outcome(OP, OpOutcome::Success);
				tracing::info!(
					lease = %lease.id,
					key = %lease.key_id,
					holder = %lease.holder,
					"Lease granted."
				);
			},
			Err(e) => {
				obs::record_op_outcome(OP, OpOutcome::Failure);
				tracing::debug!(error = %e, "Immediate acquire refused.");
			},
		}

		result
	}

	/// Removes a queued request; its acquire resolves with [`Error::Cancelled`].
	///
	/// Returns false when the request is not queued (already granted, expired, or unknown).
	pub fn cancel(&self, request_id: &RequestId) -> bool {
		let cancelled = self.queue.cancel(request_id);

		if cancelled {
			self.metrics.record_cancellation();
			obs::record_op_outcome(BrokerOp::Cancel, OpOutcome::Success);
			tracing::debug!(request = %request_id, "Queued request cancelled.");
		}

		cancelled
	}

	/// 1-based service position of a queued request.
	pub fn queue_position(&self, request_id: &RequestId) -> Option<usize> {
		self.queue.position(request_id, self.now())
	}

	/// Reports whether a one-unit request for `provider` and `tenant` would be granted right
	/// now, without consuming anything.
	pub fn diagnose(&self, provider: &ProviderId, tenant: &TenantId) -> AdmissionStatus {
		self.diagnose_units(provider, tenant, 1)
	}

	/// Like [`diagnose`](Self::diagnose) for a request charging `units` of rate budget.
	pub fn diagnose_units(
		&self,
		provider: &ProviderId,
		tenant: &TenantId,
		units: u32,
	) -> AdmissionStatus {
		let now = self.now();
		let units = units.max(1);
		let candidates = self.registry.list_eligible(provider, tenant, now);

		if candidates.is_empty() {
			return AdmissionStatus::NoEligibleKey;
		}
		if !self.queue.is_empty(provider) {
			return AdmissionStatus::Blocked { reason: BlockReason::Queued, retry_after: None };
		}

		let mut refusals = Vec::new();

		for record in &candidates {
			if self.leases.active_count(record.id) >= record.concurrency_limit.max(1) as usize {
				refusals.push(Exhaustion::Concurrency);
			} else if self.rate.remaining(record, now).is_some_and(|remaining| remaining < units) {
				refusals.push(Exhaustion::Rate);
			} else {
				return AdmissionStatus::Available;
			}
		}

		let reason = BlockReason::from_exhaustions(refusals).unwrap_or(BlockReason::Concurrency);

		AdmissionStatus::Blocked { reason, retry_after: retry_after(reason, now) }
	}

	async fn acquire_inner(&self, request: AcquireRequest) -> Result<Lease> {
		let now = self.now();
		let provider = request.provider.clone();
		let tenant = request.tenant.clone();

		if self.registry.list_eligible(&provider, &tenant, now).is_empty() {
			return Err(Error::NoEligibleKey { provider, tenant });
		}

		let admission = self.queue.admit(request.waiter(&self.config, now), |waiter| {
			self.attempt(&waiter.provider, &LeaseTerms::from(waiter), now, &BTreeSet::new())
		});
		let (receiver, behind_others) = match admission {
			Admission::Granted(lease) => return Ok(self.delivered(lease)),
			Admission::Ineligible => return Err(Error::NoEligibleKey { provider, tenant }),
			Admission::Duplicate =>
				return Err(Error::DuplicateRequest { request: request.request_id }),
			Admission::Queued { receiver, behind_others } => (receiver, behind_others),
		};

		self.metrics.record_queued();
		tracing::debug!(request = %request.request_id, priority = request.priority, "Request queued.");

		let mut guard = WaitGuard::new(self, request.request_id.clone(), receiver);

		if behind_others {
			self.pump(&provider);
		}

		let timeout = request.timeout.unwrap_or(self.config.default_timeout);
		let waited = tokio::time::timeout(clock::to_std(timeout), guard.receiver()).await;
		let resolution = match waited {
			Ok(resolution) => resolution,
			Err(_) => {
				if self.queue.withdraw(&request.request_id) {
					guard.disarm();
					self.metrics.record_timeout();

					return Err(Error::Timeout { provider, waited: self.now() - now });
				}

				// Already dequeued by a grant or sweep; its resolution is in flight.
				match tokio::time::timeout(RESOLUTION_GRACE, guard.receiver()).await {
					Ok(resolution) => resolution,
					Err(_) => {
						self.metrics.record_timeout();

						return Err(Error::Timeout { provider, waited: self.now() - now });
					},
				}
			},
		};

		guard.disarm();

		match resolution {
			Ok(Resolution::Granted(lease)) => Ok(self.delivered(lease)),
			Ok(Resolution::Ineligible) => Err(Error::NoEligibleKey { provider, tenant }),
			Ok(Resolution::Expired) => {
				self.metrics.record_timeout();

				Err(Error::Timeout { provider, waited: self.now() - now })
			},
			Ok(Resolution::Cancelled) | Err(_) =>
				Err(Error::Cancelled { request: request.request_id }),
		}
	}

	fn try_acquire_inner(&self, request: &AcquireRequest) -> Result<Lease> {
		let now = self.now();
		let provider = &request.provider;
		let candidates = self.registry.list_eligible(provider, &request.tenant, now);

		if candidates.is_empty() {
			return Err(Error::NoEligibleKey {
				provider: provider.clone(),
				tenant: request.tenant.clone(),
			});
		}

		let terms = request.terms(&self.config);
		let outcome = self
			.queue
			.when_idle(provider, || self.grant_ranked(candidates, &terms, now))
			.ok_or(BlockReason::Queued)
			.and_then(|granted| {
				granted.map_err(|refusals| {
					BlockReason::from_exhaustions(refusals).unwrap_or(BlockReason::Concurrency)
				})
			});

		outcome.map_err(|reason| Error::Unavailable {
			provider: provider.clone(),
			reason,
			retry_after: retry_after(reason, now),
		})
	}

	fn delivered(&self, lease: Lease) -> Lease {
		self.metrics.record_grant();
		tracing::info!(
			lease = %lease.id,
			key = %lease.key_id,
			holder = %lease.holder,
			tenant = %lease.tenant,
			"Lease granted."
		);

		lease
	}
}

/// Withdraws a queued request when its acquire future is dropped before resolution.
struct WaitGuard<'a> {
	broker: &'a Broker,
	request_id: RequestId,
	receiver: oneshot::Receiver<Resolution>,
	armed: bool,
}
impl<'a> WaitGuard<'a> {
	fn new(
		broker: &'a Broker,
		request_id: RequestId,
		receiver: oneshot::Receiver<Resolution>,
	) -> Self {
		Self { broker, request_id, receiver, armed: true }
	}

	fn receiver(&mut self) -> &mut oneshot::Receiver<Resolution> {
		&mut self.receiver
	}

	fn disarm(&mut self) {
		self.armed = false;
	}
}
impl Drop for WaitGuard<'_> {
	fn drop(&mut self) {
		if !self.armed || self.broker.queue.withdraw(&self.request_id) {
			return;
		}

		self.receiver.close();

		if let Ok(Resolution::Granted(lease)) = self.receiver.try_recv() {
			if self.broker.leases.revert(&lease) {
				tracing::debug!(lease = %lease.id, "Rolled back a lease granted to an abandoned request.");
			}

			self.broker.pump(&lease.provider);
		}
	}
}

fn retry_after(reason: BlockReason, now: OffsetDateTime) -> Option<Duration> {
	match reason {
		BlockReason::Rate | BlockReason::ConcurrencyAndRate => Some(clock::until_next_bucket(now)),
		BlockReason::Concurrency | BlockReason::Queued => None,
	}
}
