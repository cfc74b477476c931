//! Server-side time source for lease deadlines, minute buckets, and waiter aging.
//!
//! Callers never supply timestamps; every instant the broker reasons about comes from its
//! [`Clock`]. Tests swap in a [`ManualClock`] to cross minute boundaries or TTL deadlines
//! without sleeping.

// self
use crate::_prelude::*;

/// Seconds per rate-limit bucket.
pub const BUCKET_SECONDS: i64 = 60;

/// Abstraction over the wall clock used by the broker.
pub trait Clock
where
	Self: Debug + Send + Sync,
{
	/// Returns the current instant.
	fn now(&self) -> OffsetDateTime;
}

/// Live clock reading the system time in UTC.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;
impl Clock for SystemClock {
	fn now(&self) -> OffsetDateTime {
		OffsetDateTime::now_utc()
	}
}

/// Controllable clock that only moves when told to.
#[derive(Clone, Debug)]
pub struct ManualClock(Arc<Mutex<OffsetDateTime>>);
impl ManualClock {
	/// Creates a clock frozen at `start`.
	pub fn new(start: OffsetDateTime) -> Self {
		Self(Arc::new(Mutex::new(start)))
	}

	/// Moves the clock forward (or backward for negative durations).
	pub fn advance(&self, by: Duration) {
		*self.0.lock() += by;
	}

	/// Jumps to an absolute instant.
	pub fn set(&self, instant: OffsetDateTime) {
		*self.0.lock() = instant;
	}
}
impl Clock for ManualClock {
	fn now(&self) -> OffsetDateTime {
		*self.0.lock()
	}
}

/// Minute bucket index for an instant: `floor(unix_seconds / 60)`.
pub fn minute_bucket(instant: OffsetDateTime) -> i64 {
	instant.unix_timestamp().div_euclid(BUCKET_SECONDS)
}

/// Time left until the next bucket boundary, never less than one second.
pub fn until_next_bucket(instant: OffsetDateTime) -> Duration {
	let next = (minute_bucket(instant) + 1) * BUCKET_SECONDS;
	let remaining = Duration::seconds(next) - Duration::seconds(instant.unix_timestamp())
		- Duration::nanoseconds(i64::from(instant.nanosecond()));

	remaining.max(Duration::SECOND)
}

/// Converts a broker duration into the std form used by tokio timers, clamping negatives to zero.
pub(crate) fn to_std(duration: Duration) -> std::time::Duration {
	std::time::Duration::try_from(duration).unwrap_or_default()
}
