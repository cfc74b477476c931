//! Broker tunables and the provider catalog.

// self
use crate::{_prelude::*, error::ConfigError, id::ProviderId};

/// Runtime tunables for a [`Broker`](crate::Broker).
///
/// Every field has a default matching the production deployment; JSON documents may set any
/// subset. Durations are expressed in whole seconds on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
	/// Lease lifetime granted on acquire and re-armed by every heartbeat.
	#[serde(with = "seconds")]
	pub default_ttl: Duration,
	/// Interval between reaper sweeps.
	#[serde(with = "seconds")]
	pub sweep_interval: Duration,
	/// How long past minute buckets are kept before garbage collection.
	#[serde(with = "seconds")]
	pub usage_retention: Duration,
	/// Waiters older than this are expired by the sweep regardless of their own timeout.
	#[serde(with = "seconds")]
	pub waiter_max_age: Duration,
	/// Wait time that raises a waiter's effective priority by one; `None` disables aging.
	#[serde(with = "seconds_opt")]
	pub aging_step: Option<Duration>,
	/// Number of ended leases kept for admin views.
	pub history_capacity: usize,
	/// Queue timeout applied when a request does not specify one.
	#[serde(with = "seconds")]
	pub default_timeout: Duration,
}
impl BrokerConfig {
	const DEFAULT_TTL: Duration = Duration::seconds(120);
	const DEFAULT_SWEEP_INTERVAL: Duration = Duration::seconds(5);
	const DEFAULT_USAGE_RETENTION: Duration = Duration::minutes(30);
	const DEFAULT_WAITER_MAX_AGE: Duration = Duration::hours(6);
	const DEFAULT_AGING_STEP: Duration = Duration::seconds(30);
	const DEFAULT_HISTORY_CAPACITY: usize = 500;
	const DEFAULT_TIMEOUT: Duration = Duration::seconds(60);

	/// Parses a configuration document, reporting the failing path on error.
	pub fn from_json(payload: &str) -> Result<Self, ConfigError> {
		let de = &mut serde_json::Deserializer::from_str(payload);

		Ok(serde_path_to_error::deserialize(de)?)
	}

	/// Overrides the lease TTL.
	pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
		self.default_ttl = ttl.max(Duration::SECOND);

		self
	}

	/// Overrides the sweep interval.
	pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
		self.sweep_interval = interval.max(Duration::MILLISECOND);

		self
	}

	/// Overrides the usage bucket retention.
	pub fn with_usage_retention(mut self, retention: Duration) -> Self {
		self.usage_retention = retention.max(Duration::ZERO);

		self
	}

	/// Overrides the maximum waiter age.
	pub fn with_waiter_max_age(mut self, age: Duration) -> Self {
		self.waiter_max_age = age.max(Duration::ZERO);

		self
	}

	/// Overrides (or disables) priority aging.
	pub fn with_aging_step(mut self, step: Option<Duration>) -> Self {
		self.aging_step = step.filter(|step| step.is_positive());

		self
	}

	/// Overrides the ended-lease history capacity.
	pub fn with_history_capacity(mut self, capacity: usize) -> Self {
		self.history_capacity = capacity;

		self
	}

	/// Overrides the default queue timeout.
	pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
		self.default_timeout = timeout.max(Duration::ZERO);

		self
	}
}
impl Default for BrokerConfig {
	fn default() -> Self {
		Self {
			default_ttl: Self::DEFAULT_TTL,
			sweep_interval: Self::DEFAULT_SWEEP_INTERVAL,
			usage_retention: Self::DEFAULT_USAGE_RETENTION,
			waiter_max_age: Self::DEFAULT_WAITER_MAX_AGE,
			aging_step: Some(Self::DEFAULT_AGING_STEP),
			history_capacity: Self::DEFAULT_HISTORY_CAPACITY,
			default_timeout: Self::DEFAULT_TIMEOUT,
		}
	}
}

/// Set of providers the broker accepts credentials for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderCatalog(Option<BTreeSet<ProviderId>>);
impl ProviderCatalog {
	/// Accepts every syntactically valid provider.
	pub fn open() -> Self {
		Self(None)
	}

	/// Restricts the broker to the listed providers.
	pub fn only<I>(providers: I) -> Self
	where
		I: IntoIterator<Item = ProviderId>,
	{
		Self(Some(providers.into_iter().collect()))
	}

	/// Validates a provider string against the catalog.
	pub fn resolve(&self, provider: &str) -> Result<ProviderId, ConfigError> {
		let id = ProviderId::new(provider)?;

		match &self.0 {
			Some(known) if !known.contains(&id) =>
				Err(ConfigError::UnknownProvider { provider: provider.to_owned() }),
			_ => Ok(id),
		}
	}
}

mod seconds {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_i64(value.whole_seconds())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Duration::seconds(i64::deserialize(deserializer)?))
	}
}

mod seconds_opt {
	// crates.io
	use serde::{Deserializer, Serializer};
	// self
	use crate::_prelude::*;

	pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match value {
			Some(value) => serializer.serialize_some(&value.whole_seconds()),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Option::<i64>::deserialize(deserializer)?
			.filter(|secs| *secs > 0)
			.map(Duration::seconds))
	}
}
