//! Lease bookkeeping: atomic check-and-grant per key, heartbeats, and versioned teardown.
//!
//! Each key owns a slot (a mutex over its outstanding leases). Granting, heartbeating,
//! releasing, and reclaiming a lease all happen inside that slot's critical section, so the
//! concurrency ceiling holds under any interleaving while different keys never contend.
//!
//! Every grant and heartbeat stamps the lease with a fresh generation. The reaper reclaims
//! only the generation it observed as expired; a heartbeat or release that lands in between
//! makes the reclaim a no-op, so a lease is destroyed at most once.

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	clock,
	id::{HolderId, KeyId, KeyName, LeaseId, ProviderId, TenantId},
	key::{ApiKeyRecord, KeySecret},
	rate::RateLimiter,
};

/// A time-bounded, renewable grant of one credential to one holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
	/// Lease identifier used for heartbeat and release.
	pub id: LeaseId,
	/// Key the lease draws on.
	pub key_id: KeyId,
	/// Provider of the key.
	pub provider: ProviderId,
	/// Name of the key.
	pub key_name: KeyName,
	/// Secret material for the external call.
	pub secret: KeySecret,
	/// Caller holding the lease.
	pub holder: HolderId,
	/// Tenant the lease was granted for.
	pub tenant: TenantId,
	/// Grant instant.
	#[serde(with = "time::serde::rfc3339")]
	pub granted_at: OffsetDateTime,
	/// Lifetime re-armed by each heartbeat.
	pub ttl: Duration,
	/// Instant after which the reaper may reclaim the lease.
	#[serde(with = "time::serde::rfc3339")]
	pub ttl_deadline: OffsetDateTime,
	/// Last heartbeat (the grant counts as the first).
	#[serde(with = "time::serde::rfc3339")]
	pub last_heartbeat_at: OffsetDateTime,
	/// Version token; changes on every heartbeat.
	pub generation: u64,
	/// Rate units charged at grant time.
	pub units: u32,
	/// Minute bucket the grant was charged to.
	pub minute_bucket: i64,
}
impl Lease {
	/// Returns true once the deadline has passed.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		self.ttl_deadline <= now
	}

	/// Time since the grant.
	pub fn age_at(&self, now: OffsetDateTime) -> Duration {
		now - self.granted_at
	}
}

/// Per-grant parameters supplied by the caller.
#[derive(Clone, Debug)]
pub struct LeaseTerms {
	/// Caller that will hold the lease.
	pub holder: HolderId,
	/// Tenant the caller acts for.
	pub tenant: TenantId,
	/// Rate units to charge.
	pub units: u32,
	/// Lease lifetime.
	pub ttl: Duration,
}

/// Why a key refused a grant. Transient; never surfaced by a waiting acquire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exhaustion {
	/// The key already carries `concurrency_limit` leases.
	Concurrency,
	/// The key's live minute bucket cannot absorb the units.
	Rate,
}

/// How a lease ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseEnd {
	/// Holder released it after a successful call.
	Released,
	/// Holder released it after a failed call.
	Failed,
	/// The reaper reclaimed it after a missed heartbeat; the holder abandoned it.
	Reclaimed,
	/// An admin force-reclaimed it.
	Revoked,
}
impl LeaseEnd {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			LeaseEnd::Released => "released",
			LeaseEnd::Failed => "failed",
			LeaseEnd::Reclaimed => "reclaimed",
			LeaseEnd::Revoked => "revoked",
		}
	}
}
impl Display for LeaseEnd {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Result of an idempotent release.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
	/// This call ended the lease.
	Released,
	/// The lease had already ended; nothing changed.
	AlreadyEnded,
}

type Slot = Arc<Mutex<BTreeMap<LeaseId, Lease>>>;

/// Owns the active-lease set and enforces per-key concurrency.
#[derive(Debug)]
pub struct LeaseManager {
	rate: Arc<RateLimiter>,
	slots: RwLock<HashMap<KeyId, Slot>>,
	index: RwLock<HashMap<LeaseId, KeyId>>,
	generation: AtomicU64,
}
impl LeaseManager {
	/// Creates a manager charging grants against `rate`.
	pub fn new(rate: Arc<RateLimiter>) -> Self {
		Self {
			rate,
			slots: Default::default(),
			index: Default::default(),
			generation: AtomicU64::new(1),
		}
	}

	/// Atomically checks the concurrency ceiling and rate budget of `record`, then registers a
	/// lease. Nothing is consumed when the grant is refused.
	pub fn try_grant(
		&self,
		record: &ApiKeyRecord,
		terms: &LeaseTerms,
		now: OffsetDateTime,
	) -> Result<Lease, Exhaustion> {
		let slot = self.slot(record.id);
		let mut leases = slot.lock();

		if leases.len() >= record.concurrency_limit.max(1) as usize {
			return Err(Exhaustion::Concurrency);
		}

		let units = terms.units.max(1);

		if !self.rate.try_consume_units(record, units, now) {
			return Err(Exhaustion::Rate);
		}

		let lease = Lease {
			id: LeaseId::generate(),
			key_id: record.id,
			provider: record.provider.clone(),
			key_name: record.name.clone(),
			secret: record.secret.clone(),
			holder: terms.holder.clone(),
			tenant: terms.tenant.clone(),
			granted_at: now,
			ttl: terms.ttl,
			ttl_deadline: now + terms.ttl,
			last_heartbeat_at: now,
			generation: self.next_generation(),
			units,
			minute_bucket: clock::minute_bucket(now),
		};

		leases.insert(lease.id.clone(), lease.clone());
		self.index.write().insert(lease.id.clone(), record.id);

		Ok(lease)
	}

	/// Extends the lease deadline by its TTL and bumps its generation.
	pub fn heartbeat(&self, lease_id: &LeaseId, now: OffsetDateTime) -> Result<Lease> {
		let not_found = || Error::LeaseNotFound { lease: lease_id.clone() };
		let slot = self.slot_of(lease_id).ok_or_else(not_found)?;
		let mut leases = slot.lock();
		let lease = leases.get_mut(lease_id).ok_or_else(not_found)?;

		lease.ttl_deadline = now + lease.ttl;
		lease.last_heartbeat_at = now;
		lease.generation = self.next_generation();

		Ok(lease.clone())
	}

	/// Removes the lease if it is still outstanding; `None` when it already ended.
	pub fn release(&self, lease_id: &LeaseId) -> Option<Lease> {
		self.remove_if(lease_id, |_| true)
	}

	/// Removes the lease only if it still carries `generation` and is expired at `now`.
	pub fn reclaim(
		&self,
		lease_id: &LeaseId,
		generation: u64,
		now: OffsetDateTime,
	) -> Option<Lease> {
		self.remove_if(lease_id, |lease| lease.generation == generation && lease.is_expired_at(now))
	}

	/// Expired leases as `(id, generation)` pairs, the tokens [`reclaim`](Self::reclaim) expects.
	pub fn expired(&self, now: OffsetDateTime) -> Vec<(LeaseId, u64)> {
		let slots: Vec<_> = self.slots.read().values().cloned().collect();
		let mut expired = Vec::new();

		for slot in slots {
			expired.extend(
				slot.lock()
					.values()
					.filter(|lease| lease.is_expired_at(now))
					.map(|lease| (lease.id.clone(), lease.generation)),
			);
		}

		expired
	}

	/// Undoes a grant that could not be delivered: drops the lease and refunds its units.
	pub fn revert(&self, lease: &Lease) -> bool {
		match self.release(&lease.id) {
			Some(removed) => {
				self.rate.refund(removed.key_id, removed.minute_bucket, removed.units);

				true
			},
			None => false,
		}
	}

	/// Outstanding leases on `key_id`.
	pub fn active_count(&self, key_id: KeyId) -> usize {
		self.slots.read().get(&key_id).map(|slot| slot.lock().len()).unwrap_or(0)
	}

	/// Current state of an outstanding lease.
	pub fn get(&self, lease_id: &LeaseId) -> Option<Lease> {
		self.slot_of(lease_id)?.lock().get(lease_id).cloned()
	}

	/// Every outstanding lease, oldest grant first.
	pub fn leases(&self) -> Vec<Lease> {
		let slots: Vec<_> = self.slots.read().values().cloned().collect();
		let mut leases: Vec<_> =
			slots.iter().flat_map(|slot| slot.lock().values().cloned().collect::<Vec<_>>()).collect();

		leases.sort_by(|a, b| a.granted_at.cmp(&b.granted_at).then_with(|| a.id.cmp(&b.id)));

		leases
	}

	/// Total outstanding leases.
	pub fn len(&self) -> usize {
		self.index.read().len()
	}

	/// Returns true when no lease is outstanding.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Reinstalls persisted leases without re-charging their rate units.
	pub(crate) fn restore<I>(&self, leases: I)
	where
		I: IntoIterator<Item = Lease>,
	{
		for lease in leases {
			let slot = self.slot(lease.key_id);

			self.generation.fetch_max(lease.generation + 1, Ordering::Relaxed);
			self.index.write().insert(lease.id.clone(), lease.key_id);
			slot.lock().insert(lease.id.clone(), lease);
		}
	}

	fn remove_if<F>(&self, lease_id: &LeaseId, predicate: F) -> Option<Lease>
	where
		F: FnOnce(&Lease) -> bool,
	{
		let slot = self.slot_of(lease_id)?;
		let mut leases = slot.lock();

		if !predicate(leases.get(lease_id)?) {
			return None;
		}

		let removed = leases.remove(lease_id)?;

		self.index.write().remove(lease_id);

		Some(removed)
	}

	fn slot_of(&self, lease_id: &LeaseId) -> Option<Slot> {
		let key_id = *self.index.read().get(lease_id)?;

		self.slots.read().get(&key_id).cloned()
	}

	fn slot(&self, key_id: KeyId) -> Slot {
		if let Some(slot) = self.slots.read().get(&key_id) {
			return slot.clone();
		}

		self.slots.write().entry(key_id).or_default().clone()
	}

	fn next_generation(&self) -> u64 {
		self.generation.fetch_add(1, Ordering::Relaxed)
	}
}

#[cfg(test)]
mod tests {
	// std
	use std::{sync::Barrier, thread};
	// crates.io
	use time::macros;
	// self
	use super::*;
	use crate::key::TenantScope;

	fn record(concurrency_limit: u32, rpm_limit: u32) -> ApiKeyRecord {
		let now = macros::datetime!(2025-11-10 12:00 UTC);

		ApiKeyRecord {
			id: KeyId(1),
			provider: ProviderId::new("openai").expect("Provider fixture should be valid."),
			name: KeyName::new("k1").expect("Key name fixture should be valid."),
			secret: KeySecret::api_key("sk"),
			concurrency_limit,
			rpm_limit,
			priority: 0,
			tenant_scope: TenantScope::Any,
			active: true,
			expires_at: None,
			created_at: now,
			updated_at: now,
		}
	}

	fn terms() -> LeaseTerms {
		LeaseTerms {
			holder: HolderId::new("user-1").expect("Holder fixture should be valid."),
			tenant: TenantId::new("school-a").expect("Tenant fixture should be valid."),
			units: 1,
			ttl: Duration::seconds(30),
		}
	}

	#[test]
	fn concurrency_ceiling_refuses_without_consuming_rate() {
		let rate = Arc::new(RateLimiter::default());
		let manager = LeaseManager::new(rate.clone());
		let key = record(1, 10);
		let now = macros::datetime!(2025-11-10 12:00 UTC);

		manager.try_grant(&key, &terms(), now).expect("First grant should succeed.");

		assert_eq!(manager.try_grant(&key, &terms(), now), Err(Exhaustion::Concurrency));
		assert_eq!(rate.usage(key.id, now), 1);
	}

	#[test]
	fn rate_ceiling_refuses_grants() {
		let manager = LeaseManager::new(Arc::new(RateLimiter::default()));
		let key = record(5, 1);
		let now = macros::datetime!(2025-11-10 12:00 UTC);

		manager.try_grant(&key, &terms(), now).expect("First grant should succeed.");

		assert_eq!(manager.try_grant(&key, &terms(), now), Err(Exhaustion::Rate));
		assert_eq!(manager.active_count(key.id), 1);
	}

	#[test]
	fn concurrent_grants_never_exceed_the_ceiling() {
		let manager = Arc::new(LeaseManager::new(Arc::new(RateLimiter::default())));
		let key = Arc::new(record(3, 0));
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let barrier = Arc::new(Barrier::new(16));
		let handles: Vec<_> = (0..16)
			.map(|_| {
				let manager = manager.clone();
				let key = key.clone();
				let barrier = barrier.clone();

				thread::spawn(move || {
					barrier.wait();

					manager.try_grant(&key, &terms(), now).is_ok()
				})
			})
			.collect();
		let granted = handles
			.into_iter()
			.map(|handle| handle.join().expect("Grant thread should not panic."))
			.filter(|granted| *granted)
			.count();

		assert_eq!(granted, 3);
		assert_eq!(manager.active_count(key.id), 3);
	}

	#[test]
	fn release_is_idempotent() {
		let manager = LeaseManager::new(Arc::new(RateLimiter::default()));
		let key = record(1, 0);
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let lease = manager.try_grant(&key, &terms(), now).expect("Grant should succeed.");

		assert!(manager.release(&lease.id).is_some());
		assert!(manager.release(&lease.id).is_none());
		assert_eq!(manager.active_count(key.id), 0);
		assert!(manager.is_empty());
		assert!(matches!(
			manager.heartbeat(&lease.id, now),
			Err(Error::LeaseNotFound { .. })
		));
	}

	#[test]
	fn heartbeat_invalidates_the_reclaim_token() {
		let manager = LeaseManager::new(Arc::new(RateLimiter::default()));
		let key = record(1, 0);
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let lease = manager.try_grant(&key, &terms(), now).expect("Grant should succeed.");
		let late = now + Duration::seconds(31);
		let expired = manager.expired(late);

		assert_eq!(expired, vec![(lease.id.clone(), lease.generation)]);

		let renewed = manager.heartbeat(&lease.id, late).expect("Heartbeat should succeed.");

		assert_eq!(renewed.ttl_deadline, late + Duration::seconds(30));
		assert!(manager.reclaim(&lease.id, lease.generation, late).is_none());
		assert!(manager.get(&lease.id).is_some());
		assert!(manager.reclaim(&lease.id, renewed.generation, late).is_none());

		let reclaimed = manager
			.reclaim(&lease.id, renewed.generation, late + Duration::seconds(30))
			.expect("Expired lease with a current token should be reclaimed.");

		assert_eq!(reclaimed.id, lease.id);
		assert!(manager.release(&lease.id).is_none());
	}

	#[test]
	fn revert_refunds_rate_units() {
		let rate = Arc::new(RateLimiter::default());
		let manager = LeaseManager::new(rate.clone());
		let key = record(1, 1);
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let lease = manager.try_grant(&key, &terms(), now).expect("Grant should succeed.");

		assert!(manager.revert(&lease));
		assert_eq!(rate.usage(key.id, now), 0);
		assert!(manager.try_grant(&key, &terms(), now).is_ok());
	}
}
