//! Per-provider admission queues ordered by priority, then arrival.
//!
//! Waiters live in a `BTreeMap` keyed by `(Reverse(priority), sequence)`, giving O(log n)
//! insertion and mid-queue removal by request id. When priority aging is enabled the head
//! is recomputed at evaluation time from each waiter's effective priority
//! (`priority + waited / aging_step`), which keeps arrival order inside a tier while letting
//! long-waiting low-priority requests climb past a sustained high-priority stream.
//!
//! Re-evaluation is head-of-line per key: once a waiter is refused, every key it could use is
//! reserved for it, and later waiters may only be granted on keys outside that reservation.

// std
use std::{
	cmp::Reverse,
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use tokio::sync::oneshot;
// self
use crate::{
	_prelude::*,
	id::{HolderId, KeyId, ProviderId, RequestId, TenantId},
	lease::{Exhaustion, Lease},
	obs,
};

/// Why an immediate grant is impossible right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
	/// Every eligible key is at its concurrency ceiling.
	Concurrency,
	/// Every eligible key spent its budget for the current minute.
	Rate,
	/// Keys are blocked by a mix of concurrency and rate ceilings.
	ConcurrencyAndRate,
	/// Capacity may exist but earlier waiters hold the turn.
	Queued,
}
impl BlockReason {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			BlockReason::Concurrency => "concurrency",
			BlockReason::Rate => "rate",
			BlockReason::ConcurrencyAndRate => "concurrency_and_rate",
			BlockReason::Queued => "queued",
		}
	}

	/// Folds per-key refusals into one reason.
	pub fn from_exhaustions<I>(refusals: I) -> Option<Self>
	where
		I: IntoIterator<Item = Exhaustion>,
	{
		let (mut concurrency, mut rate) = (false, false);

		for refusal in refusals {
			match refusal {
				Exhaustion::Concurrency => concurrency = true,
				Exhaustion::Rate => rate = true,
			}
		}

		match (concurrency, rate) {
			(true, true) => Some(Self::ConcurrencyAndRate),
			(true, false) => Some(Self::Concurrency),
			(false, true) => Some(Self::Rate),
			(false, false) => None,
		}
	}
}
impl Display for BlockReason {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Admission outlook for a provider/tenant pair, as reported to dashboards and callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmissionStatus {
	/// A grant would succeed immediately.
	Available,
	/// Eligible keys exist but none can take the request now.
	Blocked {
		/// Dominant cause.
		reason: BlockReason,
		/// Earliest instant worth retrying, when known.
		retry_after: Option<Duration>,
	},
	/// No active key matches the provider and tenant.
	NoEligibleKey,
}

/// Final answer delivered to a queued request.
#[derive(Debug)]
pub enum Resolution {
	/// Capacity freed and the waiter received this lease.
	Granted(Lease),
	/// Every key the waiter could use was deactivated or expired.
	Ineligible,
	/// The waiter exceeded the queue's maximum age.
	Expired,
	/// The waiter was cancelled by request id.
	Cancelled,
}

/// Outcome of trying to grant a waiter (or a fresh request) against the current keys.
#[derive(Debug)]
pub enum Attempt {
	/// A lease was granted.
	Granted(Lease),
	/// Eligible keys exist but none granted; carries every key the request could use.
	Blocked(BTreeSet<KeyId>),
	/// No eligible key exists.
	Ineligible,
}

/// Result of [`AdmissionQueue::admit`].
#[derive(Debug)]
pub enum Admission {
	/// Granted without queueing.
	Granted(Lease),
	/// No eligible key exists; nothing was queued.
	Ineligible,
	/// A request with the same identifier is already queued; nothing was queued.
	Duplicate,
	/// The request was queued.
	Queued {
		/// Receives the waiter's resolution.
		receiver: oneshot::Receiver<Resolution>,
		/// True when earlier waiters were present, so the caller should re-evaluate the queue.
		behind_others: bool,
	},
}

/// A request waiting for capacity.
#[derive(Debug)]
pub struct Waiter {
	/// Caller-visible request identifier, used for cancellation.
	pub request_id: RequestId,
	/// Provider the request targets.
	pub provider: ProviderId,
	/// Tenant the request acts for.
	pub tenant: TenantId,
	/// Caller that will hold the lease.
	pub holder: HolderId,
	/// Static priority; higher is served first.
	pub priority: i32,
	/// Rate units the grant will charge.
	pub units: u32,
	/// Lifetime of the lease once granted.
	pub ttl: Duration,
	/// Arrival instant.
	pub enqueued_at: OffsetDateTime,
	seq: u64,
	sender: Option<oneshot::Sender<Resolution>>,
}
impl Waiter {
	/// Describes a request; the queue assigns its sequence and channel on enqueue.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		request_id: RequestId,
		provider: ProviderId,
		tenant: TenantId,
		holder: HolderId,
		priority: i32,
		units: u32,
		ttl: Duration,
		enqueued_at: OffsetDateTime,
	) -> Self {
		Self {
			request_id,
			provider,
			tenant,
			holder,
			priority,
			units: units.max(1),
			ttl,
			enqueued_at,
			seq: 0,
			sender: None,
		}
	}

	/// Priority after aging: one level per full `aging_step` waited.
	pub fn effective_priority(&self, now: OffsetDateTime, aging_step: Option<Duration>) -> i32 {
		let Some(step) = aging_step.filter(|step| step.is_positive()) else {
			return self.priority;
		};
		let waited = (now - self.enqueued_at).max(Duration::ZERO);
		let levels = waited.whole_milliseconds() / step.whole_milliseconds().max(1);

		self.priority.saturating_add(i32::try_from(levels).unwrap_or(i32::MAX))
	}

	fn resolve(mut self, resolution: Resolution) -> std::result::Result<(), Resolution> {
		match self.sender.take() {
			Some(sender) => sender.send(resolution),
			None => Err(resolution),
		}
	}
}

/// Read-only view of a queued request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WaiterSummary {
	/// 1-based position in service order.
	pub position: usize,
	/// Request identifier.
	pub request_id: RequestId,
	/// Tenant.
	pub tenant: TenantId,
	/// Caller.
	pub holder: HolderId,
	/// Static priority.
	pub priority: i32,
	/// Priority after aging.
	pub effective_priority: i32,
	/// Arrival instant.
	#[serde(with = "time::serde::rfc3339")]
	pub enqueued_at: OffsetDateTime,
	/// Time spent queued so far.
	pub waited: Duration,
}

type QueueKey = (Reverse<i32>, u64);

#[derive(Debug, Default)]
struct ProviderQueue {
	waiters: BTreeMap<QueueKey, Waiter>,
	by_request: HashMap<RequestId, QueueKey>,
}
impl ProviderQueue {
	fn insert(&mut self, waiter: Waiter) {
		let key = (Reverse(waiter.priority), waiter.seq);

		self.by_request.insert(waiter.request_id.clone(), key);
		self.waiters.insert(key, waiter);
	}

	fn remove(&mut self, request_id: &RequestId) -> Option<Waiter> {
		let key = self.by_request.remove(request_id)?;

		self.waiters.remove(&key)
	}

	fn ordered(&self, now: OffsetDateTime, aging_step: Option<Duration>) -> Vec<&Waiter> {
		let mut ordered: Vec<&Waiter> = self.waiters.values().collect();

		if aging_step.is_some() {
			ordered.sort_by_key(|waiter| {
				(Reverse(waiter.effective_priority(now, aging_step)), waiter.seq)
			});
		}

		ordered
	}
}

/// FIFO-with-priority wait structure, one logical queue per provider.
#[derive(Debug)]
pub struct AdmissionQueue {
	queues: RwLock<HashMap<ProviderId, Arc<Mutex<ProviderQueue>>>>,
	locator: Mutex<HashMap<RequestId, ProviderId>>,
	seq: AtomicU64,
	aging_step: Option<Duration>,
}
impl AdmissionQueue {
	/// Creates an empty queue set; `aging_step` enables anti-starvation aging.
	pub fn new(aging_step: Option<Duration>) -> Self {
		Self {
			queues: Default::default(),
			locator: Default::default(),
			seq: AtomicU64::new(0),
			aging_step: aging_step.filter(|step| step.is_positive()),
		}
	}

	/// Appends a waiter in (priority desc, arrival asc) order and returns its resolution channel.
	///
	/// Fails with [`Error::DuplicateRequest`] while another waiter holds the same request id.
	pub fn enqueue(&self, waiter: Waiter) -> Result<oneshot::Receiver<Resolution>> {
		let queue = self.queue(&waiter.provider);
		let mut queue = queue.lock();

		self.insert_locked(&mut queue, waiter)
			.map_err(|waiter| Error::DuplicateRequest { request: waiter.request_id })
	}

	/// Atomically tries an immediate grant when nobody is waiting, otherwise queues.
	///
	/// `attempt` only runs when the provider queue is empty, and the queue stays locked until
	/// the request is either granted or enqueued, so a concurrent release cannot slip between
	/// a failed attempt and the enqueue.
	pub fn admit<F>(&self, waiter: Waiter, attempt: F) -> Admission
	where
		F: FnOnce(&Waiter) -> Attempt,
	{
		let queue = self.queue(&waiter.provider);
		let mut queue = queue.lock();

		if self.locator.lock().contains_key(&waiter.request_id) {
			return Admission::Duplicate;
		}

		let behind_others = !queue.waiters.is_empty();

		if !behind_others {
			match attempt(&waiter) {
				Attempt::Granted(lease) => return Admission::Granted(lease),
				Attempt::Ineligible => return Admission::Ineligible,
				Attempt::Blocked(_) => (),
			}
		}

		match self.insert_locked(&mut queue, waiter) {
			Ok(receiver) => Admission::Queued { receiver, behind_others },
			Err(_) => Admission::Duplicate,
		}
	}

	/// Runs `f` under `provider`'s queue lock, but only when nobody is waiting.
	pub fn when_idle<T, F>(&self, provider: &ProviderId, f: F) -> Option<T>
	where
		F: FnOnce() -> T,
	{
		let queue = self.queue(provider);
		let queue = queue.lock();

		if queue.waiters.is_empty() { Some(f()) } else { None }
	}

	/// Removes a queued waiter and tells it it was cancelled; false if it is not queued.
	pub fn cancel(&self, request_id: &RequestId) -> bool {
		match self.take(request_id) {
			Some(waiter) => {
				let _ = waiter.resolve(Resolution::Cancelled);

				true
			},
			None => false,
		}
	}

	/// Removes a queued waiter silently (its own future gave up).
	pub fn withdraw(&self, request_id: &RequestId) -> bool {
		self.take(request_id).is_some()
	}

	/// Re-evaluates `provider`'s waiters from the head.
	///
	/// Each waiter is offered to `attempt` in service order together with the keys reserved by
	/// earlier blocked waiters, which it must not be granted on. A granted waiter is dequeued and
	/// handed its lease, an ineligible one is dequeued and told so, a blocked one stays and
	/// reserves the keys it reported. A lease whose waiter vanished before delivery is passed
	/// to `undelivered` for rollback. Returns the number of leases delivered.
	pub fn reevaluate<F, U>(
		&self,
		provider: &ProviderId,
		now: OffsetDateTime,
		mut attempt: F,
		mut undelivered: U,
	) -> usize
	where
		F: FnMut(&Waiter, &BTreeSet<KeyId>) -> Attempt,
		U: FnMut(Lease),
	{
		let Some(queue) = self.queues.read().get(provider).cloned() else {
			return 0;
		};
		let mut queue = queue.lock();
		let mut settled = Vec::new();
		let mut reserved = BTreeSet::new();

		for waiter in queue.ordered(now, self.aging_step) {
			match attempt(waiter, &reserved) {
				Attempt::Granted(lease) => settled.push((waiter.request_id.clone(), Some(lease))),
				Attempt::Ineligible => settled.push((waiter.request_id.clone(), None)),
				Attempt::Blocked(keys) => reserved.extend(keys),
			}
		}

		let mut delivered = 0;

		for (request_id, lease) in settled {
			let Some(waiter) = queue.remove(&request_id) else {
				if let Some(lease) = lease {
					undelivered(lease);
				}

				continue;
			};

			self.locator.lock().remove(&request_id);

			match (lease, waiter) {
				(Some(lease), waiter) => match waiter.resolve(Resolution::Granted(lease)) {
					Ok(()) => delivered += 1,
					Err(Resolution::Granted(lease)) => undelivered(lease),
					Err(_) => (),
				},
				(None, waiter) => {
					let _ = waiter.resolve(Resolution::Ineligible);
				},
			}
		}

		obs::record_queue_depth(provider, queue.waiters.len());

		delivered
	}

	/// Expires every waiter that arrived before `cutoff`; returns how many were expired.
	pub fn expire_older_than(&self, cutoff: OffsetDateTime) -> usize {
		let queues: Vec<_> =
			self.queues.read().iter().map(|(provider, queue)| (provider.clone(), queue.clone())).collect();
		let mut expired = 0;

		for (provider, queue) in queues {
			let mut queue = queue.lock();
			let stale: Vec<_> = queue
				.waiters
				.values()
				.filter(|waiter| waiter.enqueued_at < cutoff)
				.map(|waiter| waiter.request_id.clone())
				.collect();

			for request_id in stale {
				if let Some(waiter) = queue.remove(&request_id) {
					self.locator.lock().remove(&request_id);

					let _ = waiter.resolve(Resolution::Expired);

					expired += 1;
				}
			}

			obs::record_queue_depth(&provider, queue.waiters.len());
		}

		expired
	}

	/// 1-based service position of a queued request.
	pub fn position(&self, request_id: &RequestId, now: OffsetDateTime) -> Option<usize> {
		let provider = self.locator.lock().get(request_id).cloned()?;
		let queue = self.queues.read().get(&provider).cloned()?;
		let queue = queue.lock();

		queue
			.ordered(now, self.aging_step)
			.iter()
			.position(|waiter| &waiter.request_id == request_id)
			.map(|idx| idx + 1)
	}

	/// Waiters of `provider` in service order.
	pub fn ordered(&self, provider: &ProviderId, now: OffsetDateTime) -> Vec<WaiterSummary> {
		let Some(queue) = self.queues.read().get(provider).cloned() else {
			return Vec::new();
		};
		let queue = queue.lock();

		queue
			.ordered(now, self.aging_step)
			.into_iter()
			.enumerate()
			.map(|(idx, waiter)| WaiterSummary {
				position: idx + 1,
				request_id: waiter.request_id.clone(),
				tenant: waiter.tenant.clone(),
				holder: waiter.holder.clone(),
				priority: waiter.priority,
				effective_priority: waiter.effective_priority(now, self.aging_step),
				enqueued_at: waiter.enqueued_at,
				waited: now - waiter.enqueued_at,
			})
			.collect()
	}

	/// Number of waiters queued for `provider`.
	pub fn len(&self, provider: &ProviderId) -> usize {
		self.queues.read().get(provider).map(|queue| queue.lock().waiters.len()).unwrap_or(0)
	}

	/// Returns true when nobody waits for `provider`.
	pub fn is_empty(&self, provider: &ProviderId) -> bool {
		self.len(provider) == 0
	}

	/// Providers that currently have waiters.
	pub fn providers_with_waiters(&self) -> Vec<ProviderId> {
		let mut providers: Vec<_> = self
			.queues
			.read()
			.iter()
			.filter(|(_, queue)| !queue.lock().waiters.is_empty())
			.map(|(provider, _)| provider.clone())
			.collect();

		providers.sort();

		providers
	}

	/// Queues `waiter` unless its request id is already queued, in which case it is handed back.
	fn insert_locked(
		&self,
		queue: &mut ProviderQueue,
		mut waiter: Waiter,
	) -> std::result::Result<oneshot::Receiver<Resolution>, Waiter> {
		let mut locator = self.locator.lock();

		if locator.contains_key(&waiter.request_id) {
			return Err(waiter);
		}

		let (sender, receiver) = oneshot::channel();

		waiter.seq = self.seq.fetch_add(1, Ordering::Relaxed);
		waiter.sender = Some(sender);

		locator.insert(waiter.request_id.clone(), waiter.provider.clone());
		drop(locator);
		obs::record_queue_depth(&waiter.provider, queue.waiters.len() + 1);
		queue.insert(waiter);

		Ok(receiver)
	}

	fn take(&self, request_id: &RequestId) -> Option<Waiter> {
		let provider = self.locator.lock().remove(request_id)?;
		let queue = self.queues.read().get(&provider).cloned()?;
		let mut queue = queue.lock();
		let waiter = queue.remove(request_id);

		obs::record_queue_depth(&provider, queue.waiters.len());

		waiter
	}

	fn queue(&self, provider: &ProviderId) -> Arc<Mutex<ProviderQueue>> {
		if let Some(queue) = self.queues.read().get(provider) {
			return queue.clone();
		}

		self.queues.write().entry(provider.clone()).or_default().clone()
	}
}
