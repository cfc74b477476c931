//! Credential records held by the registry.

// self
use crate::{
	_prelude::*,
	id::{KeyId, KeyName, ProviderId, TenantId},
	key::{KeySecret, TenantScope},
};

/// One pooled provider credential and its static admission limits.
///
/// Records are never deleted: removal from the upstream definition only clears `active`, so
/// leases and usage history keep a valid reference.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
	/// Registry-assigned identifier.
	pub id: KeyId,
	/// Provider the credential belongs to.
	pub provider: ProviderId,
	/// Name unique within the provider.
	pub name: KeyName,
	/// Secret material handed to lease holders.
	pub secret: KeySecret,
	/// Maximum simultaneous leases; always at least one.
	pub concurrency_limit: u32,
	/// Grants allowed per wall-clock minute; zero means unlimited.
	pub rpm_limit: u32,
	/// Higher values are preferred when ranking candidates.
	pub priority: i32,
	/// Tenants allowed to lease the key.
	pub tenant_scope: TenantScope,
	/// Inactive keys are never selected.
	pub active: bool,
	/// Optional hard expiry after which the key is ineligible.
	#[serde(with = "time::serde::rfc3339::option", default)]
	pub expires_at: Option<OffsetDateTime>,
	/// When the record was first registered.
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	/// When the record last changed.
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
}
impl ApiKeyRecord {
	/// Returns true when the key may be offered to `tenant` at `now`.
	pub fn is_eligible(&self, tenant: &TenantId, now: OffsetDateTime) -> bool {
		self.active && !self.is_expired_at(now) && self.tenant_scope.permits(tenant)
	}

	/// Returns true when `expires_at` has passed.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at <= now)
	}

	/// Returns true when the key has no per-minute ceiling.
	pub fn is_rate_unlimited(&self) -> bool {
		self.rpm_limit == 0
	}
}
impl Debug for ApiKeyRecord {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ApiKeyRecord")
			.field("id", &self.id)
			.field("provider", &self.provider)
			.field("name", &self.name)
			.field("secret_fingerprint", &self.secret.fingerprint())
			.field("concurrency_limit", &self.concurrency_limit)
			.field("rpm_limit", &self.rpm_limit)
			.field("priority", &self.priority)
			.field("tenant_scope", &self.tenant_scope)
			.field("active", &self.active)
			.field("expires_at", &self.expires_at)
			.finish()
	}
}

/// Limits and eligibility rules for a key, separate from its identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySettings {
	/// Secret material.
	pub secret: KeySecret,
	/// Maximum simultaneous leases (clamped to at least one).
	pub concurrency_limit: u32,
	/// Grants per minute (zero means unlimited).
	pub rpm_limit: u32,
	/// Ranking priority.
	pub priority: i32,
	/// Tenant scope.
	pub tenant_scope: TenantScope,
	/// Whether the key may be selected.
	pub active: bool,
	/// Optional expiry.
	pub expires_at: Option<OffsetDateTime>,
}
impl KeySettings {
	/// Creates settings with one concurrent lease, no rate ceiling, and a wildcard scope.
	pub fn new(secret: KeySecret) -> Self {
		Self {
			secret,
			concurrency_limit: 1,
			rpm_limit: 0,
			priority: 0,
			tenant_scope: TenantScope::Any,
			active: true,
			expires_at: None,
		}
	}

	/// Sets the concurrency ceiling.
	pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
		self.concurrency_limit = limit.max(1);

		self
	}

	/// Sets the per-minute ceiling (zero for unlimited).
	pub fn with_rpm_limit(mut self, limit: u32) -> Self {
		self.rpm_limit = limit;

		self
	}

	/// Sets the ranking priority.
	pub fn with_priority(mut self, priority: i32) -> Self {
		self.priority = priority;

		self
	}

	/// Sets the tenant scope.
	pub fn with_tenant_scope(mut self, scope: TenantScope) -> Self {
		self.tenant_scope = scope;

		self
	}

	/// Sets the active flag.
	pub fn with_active(mut self, active: bool) -> Self {
		self.active = active;

		self
	}

	/// Sets the hard expiry.
	pub fn with_expires_at(mut self, expires_at: Option<OffsetDateTime>) -> Self {
		self.expires_at = expires_at;

		self
	}

	pub(crate) fn differs_from(&self, record: &ApiKeyRecord) -> bool {
		self.secret != record.secret
			|| self.concurrency_limit != record.concurrency_limit
			|| self.rpm_limit != record.rpm_limit
			|| self.priority != record.priority
			|| self.tenant_scope != record.tenant_scope
			|| self.active != record.active
			|| self.expires_at != record.expires_at
	}

	pub(crate) fn apply_to(self, record: &mut ApiKeyRecord, now: OffsetDateTime) {
		record.secret = self.secret;
		record.concurrency_limit = self.concurrency_limit.max(1);
		record.rpm_limit = self.rpm_limit;
		record.priority = self.priority;
		record.tenant_scope = self.tenant_scope;
		record.active = self.active;
		record.expires_at = self.expires_at;
		record.updated_at = now;
	}
}
