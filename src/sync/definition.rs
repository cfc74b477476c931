//! Declarative key pool definitions as supplied by operators.

// crates.io
use serde_json::{Map, Value};
// self
use crate::{
	_prelude::*,
	error::ConfigError,
	key::{ACCESS_KEY_FIELD, API_KEY_FIELD, KeySecret, KeySettings, SECRET_KEY_FIELD, TenantScope},
};

/// Environment variable holding the pool definition as JSON.
pub const KEY_POOL_ENV: &str = "KEY_POOL_JSON";

/// Provider name to ordered credential definitions.
///
/// ```json
/// { "openai": [{ "name": "primary", "api_key": "sk-...", "concurrency_limit": 4, "rpm_limit": 60 }] }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolSpec(BTreeMap<String, Vec<KeyDefinition>>);
impl PoolSpec {
	/// Parses a JSON document, reporting the failing path on error.
	pub fn from_json(payload: &str) -> Result<Self, ConfigError> {
		let de = &mut serde_json::Deserializer::from_str(payload);

		Ok(serde_path_to_error::deserialize(de)?)
	}

	/// Reads the definition from [`KEY_POOL_ENV`].
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_env_var(KEY_POOL_ENV)
	}

	/// Reads the definition from the named environment variable.
	pub fn from_env_var(var: &str) -> Result<Self, ConfigError> {
		match std::env::var(var) {
			Ok(payload) if !payload.trim().is_empty() => Self::from_json(&payload),
			_ => Err(ConfigError::MissingEnv { var: var.to_owned() }),
		}
	}

	/// Appends a definition under `provider`.
	pub fn with_key(mut self, provider: impl Into<String>, definition: KeyDefinition) -> Self {
		self.0.entry(provider.into()).or_default().push(definition);

		self
	}

	/// Provider strings with their definitions, in provider order.
	pub fn providers(&self) -> impl Iterator<Item = (&str, &[KeyDefinition])> {
		self.0.iter().map(|(provider, definitions)| (provider.as_str(), definitions.as_slice()))
	}

	/// Total number of definitions.
	pub fn len(&self) -> usize {
		self.0.values().map(Vec::len).sum()
	}

	/// Returns true when no definition is present.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

/// One credential as written by an operator.
///
/// Secret material may be given as `api_key`, as an `access_key`/`secret_key` pair, or as a
/// free-form `key_payload` object; explicit fields win over payload entries of the same name.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyDefinition {
	/// Key name, unique within the provider.
	pub name: String,
	/// Single bearer key.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub api_key: Option<String>,
	/// Access half of a key pair.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_key: Option<String>,
	/// Secret half of a key pair.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub secret_key: Option<String>,
	/// Arbitrary provider-specific secret fields.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key_payload: Option<Map<String, Value>>,
	/// Concurrency ceiling; absent or below one means one.
	#[serde(default)]
	pub concurrency_limit: Option<i64>,
	/// Per-minute ceiling; absent or non-positive means unlimited.
	#[serde(default)]
	pub rpm_limit: Option<i64>,
	/// Ranking priority.
	#[serde(default)]
	pub priority: Option<i32>,
	/// Tenants allowed to use the key; absent means every tenant.
	#[serde(default)]
	pub tenant_scope: Option<TenantScope>,
	/// Whether the key may be leased.
	#[serde(default = "default_active", alias = "is_active")]
	pub active: bool,
	/// Hard expiry.
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub expires_at: Option<OffsetDateTime>,
}
impl KeyDefinition {
	/// Starts an active definition with no secret and default limits.
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			api_key: None,
			access_key: None,
			secret_key: None,
			key_payload: None,
			concurrency_limit: None,
			rpm_limit: None,
			priority: None,
			tenant_scope: None,
			active: true,
			expires_at: None,
		}
	}

	/// Sets a single bearer key.
	pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
		self.api_key = Some(key.into());

		self
	}

	/// Sets an access/secret key pair.
	pub fn with_key_pair(mut self, access: impl Into<String>, secret: impl Into<String>) -> Self {
		self.access_key = Some(access.into());
		self.secret_key = Some(secret.into());

		self
	}

	/// Sets the concurrency ceiling.
	pub fn with_concurrency_limit(mut self, limit: i64) -> Self {
		self.concurrency_limit = Some(limit);

		self
	}

	/// Sets the per-minute ceiling.
	pub fn with_rpm_limit(mut self, limit: i64) -> Self {
		self.rpm_limit = Some(limit);

		self
	}

	/// Sets the ranking priority.
	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = Some(priority);

		self
	}

	/// Sets the tenant scope.
	pub fn with_tenant_scope(mut self, scope: TenantScope) -> Self {
		self.tenant_scope = Some(scope);

		self
	}

	/// Sets the active flag.
	pub fn with_active(mut self, active: bool) -> Self {
		self.active = active;

		self
	}

	/// Sets the hard expiry.
	pub fn with_expires_at(mut self, expires_at: OffsetDateTime) -> Self {
		self.expires_at = Some(expires_at);

		self
	}

	/// Collects the secret material; fails when nothing usable was supplied.
	pub fn secret(&self, provider: &str) -> Result<KeySecret, ConfigError> {
		let mut fields = BTreeMap::new();

		for (field, value) in self.key_payload.iter().flatten() {
			let value = match value {
				Value::Null => continue,
				Value::String(text) => text.clone(),
				other => other.to_string(),
			};

			fields.insert(field.clone(), value);
		}
		for (field, value) in [
			(API_KEY_FIELD, &self.api_key),
			(ACCESS_KEY_FIELD, &self.access_key),
			(SECRET_KEY_FIELD, &self.secret_key),
		] {
			if let Some(value) = value {
				fields.insert(field.to_owned(), value.clone());
			}
		}

		let secret = KeySecret::from_fields(fields);

		if secret.is_empty() {
			return Err(ConfigError::MissingSecret {
				provider: provider.to_owned(),
				name: self.name.clone(),
			});
		}

		Ok(secret)
	}

	/// Normalizes the definition into registry settings.
	pub fn settings(&self, provider: &str) -> Result<KeySettings, ConfigError> {
		let concurrency_limit = self.concurrency_limit.unwrap_or(1).clamp(1, u32::MAX.into());
		let rpm_limit = self.rpm_limit.unwrap_or(0).clamp(0, u32::MAX.into());

		Ok(KeySettings::new(self.secret(provider)?)
			.with_concurrency_limit(concurrency_limit as u32)
			.with_rpm_limit(rpm_limit as u32)
			.with_priority(self.priority.unwrap_or(0))
			.with_tenant_scope(self.tenant_scope.clone().unwrap_or_default())
			.with_active(self.active)
			.with_expires_at(self.expires_at))
	}
}
impl Debug for KeyDefinition {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("KeyDefinition")
			.field("name", &self.name)
			.field("secret", &"<redacted>")
			.field("concurrency_limit", &self.concurrency_limit)
			.field("rpm_limit", &self.rpm_limit)
			.field("priority", &self.priority)
			.field("tenant_scope", &self.tenant_scope)
			.field("active", &self.active)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

fn default_active() -> bool {
	true
}
