//! Read-only per-provider views for dashboards and admin tooling.

// self
use crate::{
	_prelude::*,
	broker::{Broker, EndedLease},
	id::{HolderId, KeyId, KeyName, LeaseId, ProviderId, TenantId},
	key::TenantScope,
	queue::WaiterSummary,
};

/// Point-in-time view of one provider's pool. Building it mutates nothing.
#[derive(Clone, Debug, Serialize)]
pub struct ProviderSnapshot {
	/// Provider described.
	pub provider: ProviderId,
	/// Capture instant.
	#[serde(with = "time::serde::rfc3339")]
	pub captured_at: OffsetDateTime,
	/// Number of queued requests.
	pub queue_depth: usize,
	/// Queued requests in service order.
	pub waiters: Vec<WaiterSummary>,
	/// Outstanding leases, oldest first.
	pub leases: Vec<LeaseSummary>,
	/// Every key of the provider with its live usage.
	pub keys: Vec<KeyUsage>,
	/// Recently ended leases of the provider, newest last.
	pub recent: Vec<EndedLease>,
}

/// Outstanding lease without its secret.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LeaseSummary {
	/// Lease identifier.
	pub lease_id: LeaseId,
	/// Key the lease draws on.
	pub key_id: KeyId,
	/// Holder.
	pub holder: HolderId,
	/// Tenant.
	pub tenant: TenantId,
	/// Time since the grant.
	pub age: Duration,
	/// Reclaim deadline.
	#[serde(with = "time::serde::rfc3339")]
	pub ttl_deadline: OffsetDateTime,
}

/// Live usage of one key against its ceilings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
	/// Key identifier.
	pub key_id: KeyId,
	/// Key name.
	pub name: KeyName,
	/// Whether the key may be leased.
	pub active: bool,
	/// Whether the key passed its hard expiry.
	pub expired: bool,
	/// Ranking priority.
	pub priority: i32,
	/// Tenants allowed to use the key.
	pub tenant_scope: TenantScope,
	/// Outstanding leases.
	pub active_leases: usize,
	/// Concurrency ceiling.
	pub concurrency_limit: u32,
	/// Units consumed in the current minute.
	pub used_this_minute: u32,
	/// Per-minute ceiling; zero means unlimited.
	pub rpm_limit: u32,
}

impl Broker {
	/// Builds the admin view of `provider`.
	pub fn snapshot(&self, provider: &ProviderId) -> ProviderSnapshot {
		let now = self.now();
		let waiters = self.queue.ordered(provider, now);
		let leases = self
			.leases
			.leases()
			.into_iter()
			.filter(|lease| &lease.provider == provider)
			.map(|lease| LeaseSummary {
				age: lease.age_at(now),
				lease_id: lease.id,
				key_id: lease.key_id,
				holder: lease.holder,
				tenant: lease.tenant,
				ttl_deadline: lease.ttl_deadline,
			})
			.collect();
		let keys = self
			.registry
			.records(provider)
			.into_iter()
			.map(|record| KeyUsage {
				key_id: record.id,
				name: record.name.clone(),
				active: record.active,
				expired: record.is_expired_at(now),
				priority: record.priority,
				tenant_scope: record.tenant_scope.clone(),
				active_leases: self.leases.active_count(record.id),
				concurrency_limit: record.concurrency_limit,
				used_this_minute: self.rate.usage(record.id, now),
				rpm_limit: record.rpm_limit,
			})
			.collect();
		let recent =
			self.history.lock().iter().filter(|ended| &ended.provider == provider).cloned().collect();

		ProviderSnapshot {
			provider: provider.clone(),
			captured_at: now,
			queue_depth: waiters.len(),
			waiters,
			leases,
			keys,
			recent,
		}
	}
}
