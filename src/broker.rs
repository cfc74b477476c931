//! Caller-facing broker composed of the registry, rate limiter, lease manager, and queues.

pub mod snapshot;

mod acquire;
mod admin;
mod lifecycle;

pub use snapshot::*;

// std
use std::cmp::Reverse;
// self
use crate::{
	_prelude::*,
	clock::{Clock, SystemClock},
	config::{BrokerConfig, ProviderCatalog},
	id::{HolderId, KeyId, LeaseId, ProviderId, RequestId, TenantId},
	key::ApiKeyRecord,
	lease::{Exhaustion, Lease, LeaseEnd, LeaseManager, LeaseTerms},
	obs::BrokerMetrics,
	queue::{AdmissionQueue, Attempt, Waiter},
	rate::RateLimiter,
	registry::KeyRegistry,
	store::StateStore,
};

/// Leases pooled provider credentials to concurrent callers.
///
/// The broker is cheap to clone; clones share every component. Admission for one provider is
/// serialized through that provider's queue lock, while heartbeats and releases only touch
/// the slot of the key they concern.
#[derive(Clone)]
pub struct Broker {
	/// Credential records.
	pub registry: Arc<KeyRegistry>,
	/// Per-key minute usage.
	pub rate: Arc<RateLimiter>,
	/// Outstanding leases.
	pub leases: Arc<LeaseManager>,
	/// Waiting requests.
	pub queue: Arc<AdmissionQueue>,
	/// In-process counters.
	pub metrics: Arc<BrokerMetrics>,
	config: Arc<BrokerConfig>,
	clock: Arc<dyn Clock>,
	catalog: Arc<ProviderCatalog>,
	store: Option<Arc<dyn StateStore>>,
	history: Arc<Mutex<VecDeque<EndedLease>>>,
	reconcile_guard: Arc<AsyncMutex<()>>,
}
impl Broker {
	/// Creates an empty broker driven by the system clock.
	pub fn new(config: BrokerConfig) -> Self {
		let rate = Arc::new(RateLimiter::default());

		Self {
			registry: Default::default(),
			leases: Arc::new(LeaseManager::new(rate.clone())),
			rate,
			queue: Arc::new(AdmissionQueue::new(config.aging_step)),
			metrics: Default::default(),
			history: Default::default(),
			config: Arc::new(config),
			clock: Arc::new(SystemClock),
			catalog: Default::default(),
			store: None,
			reconcile_guard: Default::default(),
		}
	}

	/// Replaces the time source.
	pub fn with_clock<C>(mut self, clock: C) -> Self
	where
		C: 'static + Clock,
	{
		self.clock = Arc::new(clock);

		self
	}

	/// Restricts reconciliation to the providers of `catalog`.
	pub fn with_catalog(mut self, catalog: ProviderCatalog) -> Self {
		self.catalog = Arc::new(catalog);

		self
	}

	/// Attaches a checkpoint store used by [`restore`](Self::restore) and
	/// [`checkpoint`](Self::checkpoint).
	pub fn with_store<S>(mut self, store: S) -> Self
	where
		S: 'static + StateStore,
	{
		self.store = Some(Arc::new(store));

		self
	}

	/// Active configuration.
	pub fn config(&self) -> &BrokerConfig {
		&self.config
	}

	/// Current server time.
	pub fn now(&self) -> OffsetDateTime {
		self.clock.now()
	}

	/// Most recent ended leases, newest last.
	pub fn history(&self) -> Vec<EndedLease> {
		self.history.lock().iter().cloned().collect()
	}

	/// Re-offers freed capacity to `provider`'s waiters; returns how many were granted.
	pub fn pump(&self, provider: &ProviderId) -> usize {
		let now = self.now();

		self.queue.reevaluate(
			provider,
			now,
			|waiter, reserved| self.attempt(provider, &LeaseTerms::from(waiter), now, reserved),
			|lease| {
				self.leases.revert(&lease);
			},
		)
	}

	/// Tries the eligible keys not in `reserved`; reserved keys are held for earlier waiters.
	fn attempt(
		&self,
		provider: &ProviderId,
		terms: &LeaseTerms,
		now: OffsetDateTime,
		reserved: &BTreeSet<KeyId>,
	) -> Attempt {
		let candidates = self.registry.list_eligible(provider, &terms.tenant, now);

		if candidates.is_empty() {
			return Attempt::Ineligible;
		}

		let keys = candidates.iter().map(|record| record.id).collect();
		let open: Vec<_> =
			candidates.into_iter().filter(|record| !reserved.contains(&record.id)).collect();

		if open.is_empty() {
			return Attempt::Blocked(keys);
		}

		match self.grant_ranked(open, terms, now) {
			Ok(lease) => Attempt::Granted(lease),
			Err(_) => Attempt::Blocked(keys),
		}
	}

	/// Tries candidates by (priority desc, active leases asc, id asc) and returns the first
	/// grant, or every refusal when none succeeded.
	fn grant_ranked(
		&self,
		candidates: Vec<Arc<ApiKeyRecord>>,
		terms: &LeaseTerms,
		now: OffsetDateTime,
	) -> Result<Lease, Vec<Exhaustion>> {
		let mut ranked: Vec<_> = candidates
			.into_iter()
			.map(|record| {
				let rank = (Reverse(record.priority), self.leases.active_count(record.id), record.id);

				(rank, record)
			})
			.collect();

		ranked.sort_by_key(|(rank, _)| *rank);

		let mut refusals = Vec::with_capacity(ranked.len());

		for (_, record) in ranked {
			match self.leases.try_grant(&record, terms, now) {
				Ok(lease) => return Ok(lease),
				Err(refusal) => refusals.push(refusal),
			}
		}

		Err(refusals)
	}

	pub(crate) fn pump_all(&self) -> usize {
		self.queue.providers_with_waiters().iter().map(|provider| self.pump(provider)).sum()
	}

	pub(crate) fn record_end(&self, lease: &Lease, end: LeaseEnd, now: OffsetDateTime) {
		let capacity = self.config.history_capacity;

		if capacity == 0 {
			return;
		}

		let mut history = self.history.lock();

		while history.len() >= capacity {
			history.pop_front();
		}

		history.push_back(EndedLease::new(lease, end, now));
	}
}
impl Debug for Broker {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Broker")
			.field("config", &self.config)
			.field("clock", &self.clock)
			.field("catalog", &self.catalog)
			.field("store_attached", &self.store.is_some())
			.field("outstanding_leases", &self.leases.len())
			.finish()
	}
}

/// Parameters of an acquire request.
#[derive(Clone, Debug)]
pub struct AcquireRequest {
	/// Caller-visible identifier; used by [`Broker::cancel`].
	pub request_id: RequestId,
	/// Target provider.
	pub provider: ProviderId,
	/// Tenant the caller acts for.
	pub tenant: TenantId,
	/// Caller that will hold the lease.
	pub holder: HolderId,
	/// Queue priority; higher is served first.
	pub priority: i32,
	/// Maximum queueing time; the broker default applies when unset.
	pub timeout: Option<Duration>,
	/// Rate units to charge.
	pub units: u32,
	/// Lease lifetime; the broker default applies when unset.
	pub ttl: Option<Duration>,
}
impl AcquireRequest {
	/// Creates a request with a fresh identifier, priority zero, and one unit.
	pub fn new(provider: ProviderId, tenant: TenantId, holder: HolderId) -> Self {
		Self {
			request_id: RequestId::generate(),
			provider,
			tenant,
			holder,
			priority: 0,
			timeout: None,
			units: 1,
			ttl: None,
		}
	}

	/// Overrides the request identifier.
	pub fn with_request_id(mut self, request_id: RequestId) -> Self {
		self.request_id = request_id;

		self
	}

	/// Sets the queue priority.
	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = priority;

		self
	}

	/// Sets the queueing deadline.
	///
	/// The deadline runs on the Tokio timer, not on the broker [`Clock`]: advancing a
	/// [`ManualClock`](crate::clock::ManualClock) never times a request out. Clock-driven
	/// expiry comes from [`BrokerConfig::waiter_max_age`], enforced by the reaper sweep.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout.max(Duration::ZERO));

		self
	}

	/// Sets the number of rate units charged on grant.
	pub fn with_units(mut self, units: u32) -> Self {
		self.units = units.max(1);

		self
	}

	/// Sets the lease lifetime.
	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = Some(ttl.max(Duration::SECOND));

		self
	}

	fn terms(&self, config: &BrokerConfig) -> LeaseTerms {
		LeaseTerms {
			holder: self.holder.clone(),
			tenant: self.tenant.clone(),
			units: self.units,
			ttl: self.ttl.unwrap_or(config.default_ttl),
		}
	}

	fn waiter(&self, config: &BrokerConfig, now: OffsetDateTime) -> Waiter {
		Waiter::new(
			self.request_id.clone(),
			self.provider.clone(),
			self.tenant.clone(),
			self.holder.clone(),
			self.priority,
			self.units,
			self.ttl.unwrap_or(config.default_ttl),
			now,
		)
	}
}

impl From<&Waiter> for LeaseTerms {
	fn from(waiter: &Waiter) -> Self {
		Self {
			holder: waiter.holder.clone(),
			tenant: waiter.tenant.clone(),
			units: waiter.units,
			ttl: waiter.ttl,
		}
	}
}

/// An ended lease, kept for admin views.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EndedLease {
	/// Lease identifier.
	pub lease_id: LeaseId,
	/// Key the lease drew on.
	pub key_id: KeyId,
	/// Provider of the key.
	pub provider: ProviderId,
	/// Former holder.
	pub holder: HolderId,
	/// Tenant.
	pub tenant: TenantId,
	/// How the lease ended.
	pub end: LeaseEnd,
	/// Grant instant.
	#[serde(with = "time::serde::rfc3339")]
	pub granted_at: OffsetDateTime,
	/// End instant.
	#[serde(with = "time::serde::rfc3339")]
	pub ended_at: OffsetDateTime,
}
impl EndedLease {
	fn new(lease: &Lease, end: LeaseEnd, ended_at: OffsetDateTime) -> Self {
		Self {
			lease_id: lease.id.clone(),
			key_id: lease.key_id,
			provider: lease.provider.clone(),
			holder: lease.holder.clone(),
			tenant: lease.tenant.clone(),
			end,
			granted_at: lease.granted_at,
			ended_at,
		}
	}
}
