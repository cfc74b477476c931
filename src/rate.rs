//! Per-key, per-minute usage accounting.
//!
//! Every key owns a small map of minute buckets guarded by its own mutex, so consumption on
//! one key never contends with another. Only the live bucket carries an invariant
//! (`granted_count <= rpm_limit` whenever the limit is non-zero); older buckets are kept for
//! admin views until [`RateLimiter::gc`] drops them.

// self
use crate::{
	_prelude::*,
	clock,
	id::KeyId,
	key::ApiKeyRecord,
};

/// Usage recorded for one key during one wall-clock minute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
	/// Key the usage is charged to.
	pub key_id: KeyId,
	/// `floor(unix_seconds / 60)` of the minute.
	pub minute_bucket: i64,
	/// Units granted in the minute.
	pub granted_count: u32,
}

type Buckets = Arc<Mutex<BTreeMap<i64, u32>>>;

/// Minute-bucket rate limiter keyed by credential.
#[derive(Debug, Default)]
pub struct RateLimiter(RwLock<HashMap<KeyId, Buckets>>);
impl RateLimiter {
	/// Consumes one unit of `record`'s budget for the minute containing `now`.
	pub fn try_consume(&self, record: &ApiKeyRecord, now: OffsetDateTime) -> bool {
		self.try_consume_units(record, 1, now)
	}

	/// Consumes `units` of `record`'s budget; returns false without side effects if the live
	/// bucket cannot absorb them. Unlimited keys (`rpm_limit == 0`) are still counted.
	pub fn try_consume_units(&self, record: &ApiKeyRecord, units: u32, now: OffsetDateTime) -> bool {
		let units = units.max(1);
		let buckets = self.buckets(record.id);
		let mut buckets = buckets.lock();
		let bucket = clock::minute_bucket(now);
		let used = buckets.get(&bucket).copied().unwrap_or(0);

		if !record.is_rate_unlimited() && used.saturating_add(units) > record.rpm_limit {
			return false;
		}

		buckets.insert(bucket, used.saturating_add(units));

		true
	}

	/// Returns units previously consumed in `minute_bucket`, e.g. for a grant that was never
	/// delivered.
	pub fn refund(&self, key_id: KeyId, minute_bucket: i64, units: u32) {
		let Some(buckets) = self.0.read().get(&key_id).cloned() else {
			return;
		};
		let mut buckets = buckets.lock();

		if let Some(count) = buckets.get_mut(&minute_bucket) {
			*count = count.saturating_sub(units);
		}
	}

	/// Units consumed by `key_id` in the live bucket.
	pub fn usage(&self, key_id: KeyId, now: OffsetDateTime) -> u32 {
		self.0
			.read()
			.get(&key_id)
			.and_then(|buckets| buckets.lock().get(&clock::minute_bucket(now)).copied())
			.unwrap_or(0)
	}

	/// Units still available to `record` in the live bucket; `None` when unlimited.
	pub fn remaining(&self, record: &ApiKeyRecord, now: OffsetDateTime) -> Option<u32> {
		if record.is_rate_unlimited() {
			return None;
		}

		Some(record.rpm_limit.saturating_sub(self.usage(record.id, now)))
	}

	/// Drops buckets that ended before `cutoff`; returns how many were removed.
	pub fn gc(&self, cutoff: OffsetDateTime) -> usize {
		let oldest_kept = clock::minute_bucket(cutoff);
		let mut removed = 0;

		for buckets in self.0.read().values() {
			let mut buckets = buckets.lock();
			let before = buckets.len();

			buckets.retain(|bucket, _| *bucket >= oldest_kept);
			removed += before - buckets.len();
		}

		removed
	}

	/// Every retained bucket, for persistence and admin views.
	pub fn windows(&self) -> Vec<UsageWindow> {
		let map = self.0.read();
		let mut windows = Vec::new();

		for (key_id, buckets) in map.iter() {
			for (minute_bucket, granted_count) in buckets.lock().iter() {
				windows.push(UsageWindow {
					key_id: *key_id,
					minute_bucket: *minute_bucket,
					granted_count: *granted_count,
				});
			}
		}

		windows.sort_by_key(|window| (window.key_id, window.minute_bucket));

		windows
	}

	/// Reinstalls persisted usage windows.
	pub(crate) fn restore<I>(&self, windows: I)
	where
		I: IntoIterator<Item = UsageWindow>,
	{
		for window in windows {
			let buckets = self.buckets(window.key_id);
			let mut buckets = buckets.lock();
			let count = buckets.entry(window.minute_bucket).or_insert(0);

			*count = (*count).max(window.granted_count);
		}
	}

	fn buckets(&self, key_id: KeyId) -> Buckets {
		if let Some(buckets) = self.0.read().get(&key_id) {
			return buckets.clone();
		}

		self.0.write().entry(key_id).or_default().clone()
	}
}
