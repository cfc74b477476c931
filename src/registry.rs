//! Authoritative, read-mostly store of pooled credentials.

// self
use crate::{
	_prelude::*,
	id::{KeyId, KeyName, ProviderId, TenantId},
	key::{ApiKeyRecord, KeySettings},
};

/// Read-mostly credential store; no operation blocks beyond a short read/write lock.
///
/// Records are shared as `Arc<ApiKeyRecord>` and replaced copy-on-write, so callers that
/// already hold a record (e.g. a granted lease) keep a consistent view.
#[derive(Debug, Default)]
pub struct KeyRegistry(RwLock<RegistryInner>);
#[derive(Debug, Default)]
struct RegistryInner {
	records: BTreeMap<KeyId, Arc<ApiKeyRecord>>,
	by_name: HashMap<(ProviderId, KeyName), KeyId>,
	by_provider: HashMap<ProviderId, Vec<KeyId>>,
	next_id: u64,
}
impl RegistryInner {
	fn put(&mut self, record: ApiKeyRecord) {
		let id = record.id;
		let name_key = (record.provider.clone(), record.name.clone());

		if !self.records.contains_key(&id) {
			self.by_provider.entry(record.provider.clone()).or_default().push(id);
		}

		self.by_name.insert(name_key, id);
		self.next_id = self.next_id.max(id.0 + 1);
		self.records.insert(id, Arc::new(record));
	}
}
impl KeyRegistry {
	/// Registers a new key and returns its identifier.
	///
	/// Registering a `(provider, name)` pair that already exists updates that record instead.
	pub fn insert(
		&self,
		provider: ProviderId,
		name: KeyName,
		settings: KeySettings,
		now: OffsetDateTime,
	) -> KeyId {
		let mut inner = self.0.write();

		if let Some(id) = inner.by_name.get(&(provider.clone(), name.clone())).copied() {
			if let Some(existing) = inner.records.get(&id) {
				let mut record = ApiKeyRecord::clone(existing);

				settings.apply_to(&mut record, now);
				inner.put(record);
			}

			return id;
		}

		let id = KeyId(inner.next_id.max(1));
		let mut record = ApiKeyRecord {
			id,
			provider,
			name,
			secret: Default::default(),
			concurrency_limit: 1,
			rpm_limit: 0,
			priority: 0,
			tenant_scope: Default::default(),
			active: true,
			expires_at: None,
			created_at: now,
			updated_at: now,
		};

		settings.apply_to(&mut record, now);
		inner.put(record);

		id
	}

	/// Returns the record for `id`, active or not.
	pub fn get(&self, id: KeyId) -> Option<Arc<ApiKeyRecord>> {
		self.0.read().records.get(&id).cloned()
	}

	/// Looks a record up by its provider-scoped name.
	pub fn lookup(&self, provider: &ProviderId, name: &KeyName) -> Option<Arc<ApiKeyRecord>> {
		let inner = self.0.read();

		inner
			.by_name
			.get(&(provider.clone(), name.clone()))
			.and_then(|id| inner.records.get(id))
			.cloned()
	}

	/// Keys of `provider` that are active, unexpired, and scoped to `tenant`.
	pub fn list_eligible(
		&self,
		provider: &ProviderId,
		tenant: &TenantId,
		now: OffsetDateTime,
	) -> Vec<Arc<ApiKeyRecord>> {
		let inner = self.0.read();
		let Some(ids) = inner.by_provider.get(provider) else {
			return Vec::new();
		};

		ids.iter()
			.filter_map(|id| inner.records.get(id))
			.filter(|record| record.is_eligible(tenant, now))
			.cloned()
			.collect()
	}

	/// Flips the active flag; returns whether the flag changed.
	pub fn set_active(&self, id: KeyId, active: bool, now: OffsetDateTime) -> Result<bool> {
		let mut inner = self.0.write();
		let Some(existing) = inner.records.get(&id) else {
			return Err(Error::UnknownKey { key: id });
		};

		if existing.active == active {
			return Ok(false);
		}

		let mut record = ApiKeyRecord::clone(existing);

		record.active = active;
		record.updated_at = now;
		inner.put(record);

		Ok(true)
	}

	/// Applies new settings to an existing record in place.
	pub fn update(&self, id: KeyId, settings: KeySettings, now: OffsetDateTime) -> Result<()> {
		let mut inner = self.0.write();
		let Some(existing) = inner.records.get(&id) else {
			return Err(Error::UnknownKey { key: id });
		};
		let mut record = ApiKeyRecord::clone(existing);

		settings.apply_to(&mut record, now);
		inner.put(record);

		Ok(())
	}

	/// Every record of `provider`, in registration order.
	pub fn records(&self, provider: &ProviderId) -> Vec<Arc<ApiKeyRecord>> {
		let inner = self.0.read();

		inner
			.by_provider
			.get(provider)
			.map(|ids| ids.iter().filter_map(|id| inner.records.get(id)).cloned().collect())
			.unwrap_or_default()
	}

	/// Every record, in registration order.
	pub fn all(&self) -> Vec<Arc<ApiKeyRecord>> {
		self.0.read().records.values().cloned().collect()
	}

	/// Providers with at least one registered record.
	pub fn providers(&self) -> Vec<ProviderId> {
		let mut providers: Vec<_> = self.0.read().by_provider.keys().cloned().collect();

		providers.sort();

		providers
	}

	/// Reinstalls persisted records, keeping their identifiers.
	pub(crate) fn restore<I>(&self, records: I)
	where
		I: IntoIterator<Item = ApiKeyRecord>,
	{
		let mut inner = self.0.write();

		for record in records {
			inner.put(record);
		}
	}
}
