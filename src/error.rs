//! Broker-level error types shared across admission, leasing, reconciliation, and stores.

// self
use crate::{
	_prelude::*,
	id::{IdentifierError, KeyId, LeaseId, ProviderId, RequestId, TenantId},
	queue::BlockReason,
};

/// Broker-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Canonical broker error exposed by public APIs.
#[derive(Debug, ThisError)]
pub enum Error {
	/// Storage-layer failure.
	#[error("{0}")]
	Storage(
		#[from]
		#[source]
		crate::store::StoreError,
	),
	/// Local configuration problem.
	#[error(transparent)]
	Config(#[from] ConfigError),

	/// No active key matches the provider and tenant; the request is never queued.
	#[error("No eligible key for provider `{provider}` and tenant `{tenant}`.")]
	NoEligibleKey {
		/// Requested provider.
		provider: ProviderId,
		/// Requesting tenant.
		tenant: TenantId,
	},
	/// The request stayed queued past its deadline; callers may retry with a fresh acquire.
	#[error("Timed out after {waited} waiting for a `{provider}` key.")]
	Timeout {
		/// Requested provider.
		provider: ProviderId,
		/// Time spent waiting before giving up.
		waited: Duration,
	},
	/// The queued request was cancelled through [`Broker::cancel`](crate::Broker::cancel).
	#[error("Request `{request}` was cancelled while queued.")]
	Cancelled {
		/// Identifier of the cancelled request.
		request: RequestId,
	},
	/// Another queued request already uses this identifier; nothing was queued.
	#[error("Request `{request}` is already queued.")]
	DuplicateRequest {
		/// The conflicting request identifier.
		request: RequestId,
	},
	/// The lease already ended (released or reclaimed); the holder should stop work.
	#[error("Lease `{lease}` is no longer active.")]
	LeaseNotFound {
		/// Identifier of the missing lease.
		lease: LeaseId,
	},
	/// Admin mutation referenced a key the registry has never seen.
	#[error("Key {key} is not registered.")]
	UnknownKey {
		/// Missing key identifier.
		key: KeyId,
	},
	/// Immediate admission was refused; only produced by the non-waiting acquire.
	#[error("No `{provider}` key is available right now ({reason}).")]
	Unavailable {
		/// Requested provider.
		provider: ProviderId,
		/// Why every eligible key refused the grant.
		reason: BlockReason,
		/// Earliest instant worth retrying, when known.
		retry_after: Option<Duration>,
	},
}

/// Configuration and validation failures raised while loading or reconciling key pools.
#[derive(Debug, ThisError)]
pub enum ConfigError {
	/// The pool definition could not be parsed.
	#[error("Key pool definition is malformed at `{path}`.")]
	Parse {
		/// JSON path of the offending value.
		path: String,
		/// Structured parsing failure.
		#[source]
		source: serde_path_to_error::Error<serde_json::Error>,
	},
	/// The environment variable holding the pool definition is unset or empty.
	#[error("Environment variable `{var}` is not set.")]
	MissingEnv {
		/// Variable name.
		var: String,
	},
	/// A definition references a provider outside the catalog.
	#[error("Provider `{provider}` is not known to this broker.")]
	UnknownProvider {
		/// Provider string as written in the definition.
		provider: String,
	},
	/// A definition carries no usable secret material.
	#[error("Key `{name}` for provider `{provider}` has no secret material.")]
	MissingSecret {
		/// Provider string.
		provider: String,
		/// Key name.
		name: String,
	},
	/// The same key name appears twice for one provider.
	#[error("Key `{name}` is defined more than once for provider `{provider}`.")]
	DuplicateKey {
		/// Provider string.
		provider: String,
		/// Key name.
		name: String,
	},
	/// A provider, tenant, or key name failed identifier validation.
	#[error(transparent)]
	InvalidIdentifier(#[from] IdentifierError),
}
impl From<serde_path_to_error::Error<serde_json::Error>> for ConfigError {
	fn from(e: serde_path_to_error::Error<serde_json::Error>) -> Self {
		Self::Parse { path: e.path().to_string(), source: e }
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn parse_errors_report_the_json_path() {
		let payload = "{\"openai\":[{\"name\":\"k\",\"concurrency_limit\":\"many\"}]}";
		let de = &mut serde_json::Deserializer::from_str(payload);
		let err = serde_path_to_error::deserialize::<_, crate::sync::PoolSpec>(de)
			.expect_err("A string concurrency limit should be rejected.");
		let config_error = ConfigError::from(err);

		assert!(config_error.to_string().contains("openai[0].concurrency_limit"));
		assert!(StdError::source(&config_error).is_some());
	}

	#[test]
	fn config_error_converts_into_broker_error() {
		let err: Error = ConfigError::UnknownProvider { provider: "nope".into() }.into();

		assert!(matches!(err, Error::Config(ConfigError::UnknownProvider { .. })));
		assert_eq!(err.to_string(), "Provider `nope` is not known to this broker.");
	}
}
