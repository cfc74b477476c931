//! Reconciliation of declarative pool definitions into the key registry.

pub mod definition;
pub mod source;

pub use definition::*;
pub use source::*;

// std
use std::collections::HashSet;
// self
use crate::{
	_prelude::*,
	config::ProviderCatalog,
	error::ConfigError,
	id::{KeyId, KeyName},
	registry::KeyRegistry,
};

/// Summary of one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
	/// Newly registered keys.
	pub inserted: Vec<KeyId>,
	/// Keys whose limits, scope, or secret changed.
	pub updated: Vec<KeyId>,
	/// Previously inactive keys made active again.
	pub reactivated: Vec<KeyId>,
	/// Keys deactivated because their definition vanished or says `active: false`.
	pub deactivated: Vec<KeyId>,
	/// Keys whose definition matched the registry.
	pub unchanged: usize,
	/// Definitions that could not be applied.
	pub skipped: Vec<SkippedDefinition>,
}
impl ReconcileReport {
	/// Returns true when the registry was not modified.
	pub fn is_noop(&self) -> bool {
		self.inserted.is_empty()
			&& self.updated.is_empty()
			&& self.reactivated.is_empty()
			&& self.deactivated.is_empty()
	}
}

/// A definition the synchronizer refused, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedDefinition {
	/// Provider string as written.
	pub provider: String,
	/// Key name as written.
	pub name: String,
	/// Human-readable rejection.
	pub reason: String,
}

/// Diffs a [`PoolSpec`] against a [`KeyRegistry`]. Never touches leases.
#[derive(Debug)]
pub struct Synchronizer<'a> {
	registry: &'a KeyRegistry,
	catalog: &'a ProviderCatalog,
}
impl<'a> Synchronizer<'a> {
	/// Binds the synchronizer to a registry and the providers it accepts.
	pub fn new(registry: &'a KeyRegistry, catalog: &'a ProviderCatalog) -> Self {
		Self { registry, catalog }
	}

	/// Applies `spec`: inserts new keys, updates changed ones in place, and deactivates keys
	/// the definition no longer mentions. Bad definitions are skipped individually.
	pub fn reconcile(&self, spec: &PoolSpec, now: OffsetDateTime) -> ReconcileReport {
		let mut report = ReconcileReport::default();
		let mut seen = HashSet::new();

		for (provider_raw, definitions) in spec.providers() {
			let provider = match self.catalog.resolve(provider_raw) {
				Ok(provider) => provider,
				Err(e) => {
					for definition in definitions {
						skip(&mut report, provider_raw, &definition.name, &e);
					}

					continue;
				},
			};
			let mut names = HashSet::new();

			for definition in definitions {
				let name = match KeyName::new(&definition.name) {
					Ok(name) => name,
					Err(e) => {
						skip(&mut report, provider_raw, &definition.name, &e.into());

						continue;
					},
				};

				if !names.insert(name.clone()) {
					let e = ConfigError::DuplicateKey {
						provider: provider_raw.to_owned(),
						name: definition.name.clone(),
					};

					skip(&mut report, provider_raw, &definition.name, &e);

					continue;
				}

				let settings = match definition.settings(provider_raw) {
					Ok(settings) => settings,
					Err(e) => {
						// Keep the previous record alive rather than deactivating it below.
						if let Some(existing) = self.registry.lookup(&provider, &name) {
							seen.insert(existing.id);
						}

						skip(&mut report, provider_raw, &definition.name, &e);

						continue;
					},
				};

				match self.registry.lookup(&provider, &name) {
					None => {
						let id = self.registry.insert(provider.clone(), name, settings, now);

						seen.insert(id);
						report.inserted.push(id);
					},
					Some(existing) => {
						seen.insert(existing.id);

						if !settings.differs_from(&existing) {
							report.unchanged += 1;

							continue;
						}

						let bucket = match (existing.active, settings.active) {
							(false, true) => &mut report.reactivated,
							(true, false) => &mut report.deactivated,
							_ => &mut report.updated,
						};

						bucket.push(existing.id);

						if let Err(e) = self.registry.update(existing.id, settings, now) {
							tracing::warn!(key = %existing.id, error = %e, "Key update failed.");
						}
					},
				}
			}
		}

		for record in self.registry.all() {
			if seen.contains(&record.id) || !record.active {
				continue;
			}
			if matches!(self.registry.set_active(record.id, false, now), Ok(true)) {
				report.deactivated.push(record.id);
			}
		}

		report
	}
}

fn skip(report: &mut ReconcileReport, provider: &str, name: &str, reason: &ConfigError) {
	tracing::warn!(provider, key = name, reason = %reason, "Skipping key definition.");

	report.skipped.push(SkippedDefinition {
		provider: provider.to_owned(),
		name: name.to_owned(),
		reason: reason.to_string(),
	});
}

#[cfg(test)]
mod tests {
	// crates.io
	use time::macros;
	// self
	use super::*;
	use crate::id::ProviderId;

	fn provider(value: &str) -> ProviderId {
		ProviderId::new(value).expect("Provider fixture should be valid.")
	}

	fn name(value: &str) -> KeyName {
		KeyName::new(value).expect("Key name fixture should be valid.")
	}

	#[test]
	fn reconcile_inserts_updates_and_deactivates() {
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let registry = KeyRegistry::default();
		let catalog = ProviderCatalog::open();
		let sync = Synchronizer::new(&registry, &catalog);
		let first = PoolSpec::default()
			.with_key("openai", KeyDefinition::new("a").with_api_key("sk-a"))
			.with_key("openai", KeyDefinition::new("b").with_api_key("sk-b"));
		let report = sync.reconcile(&first, now);

		assert_eq!(report.inserted.len(), 2);
		assert!(report.skipped.is_empty());

		let second = PoolSpec::default().with_key(
			"openai",
			KeyDefinition::new("a").with_api_key("sk-a2").with_concurrency_limit(4),
		);
		let report = sync.reconcile(&second, now + Duration::minutes(1));
		let a = registry.lookup(&provider("openai"), &name("a")).expect("Key a should exist.");
		let b = registry.lookup(&provider("openai"), &name("b")).expect("Key b should survive.");

		assert_eq!(report.updated, vec![a.id]);
		assert_eq!(report.deactivated, vec![b.id]);
		assert_eq!(a.concurrency_limit, 4);
		assert_eq!(a.secret.expose("api_key"), Some("sk-a2"));
		assert!(!b.active);

		let report = sync.reconcile(&first, now + Duration::minutes(2));

		assert_eq!(report.reactivated, vec![b.id]);
		assert_eq!(report.updated, vec![a.id]);

		let report = sync.reconcile(&first, now + Duration::minutes(3));

		assert!(report.is_noop());
		assert_eq!(report.unchanged, 2);
	}

	#[test]
	fn bad_definitions_are_skipped_without_blocking_others() {
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let registry = KeyRegistry::default();
		let catalog = ProviderCatalog::only([provider("openai")]);
		let spec = PoolSpec::default()
			.with_key("openai", KeyDefinition::new("good").with_api_key("sk"))
			.with_key("openai", KeyDefinition::new("good").with_api_key("sk-dup"))
			.with_key("openai", KeyDefinition::new("empty"))
			.with_key("openai", KeyDefinition::new("bad name").with_api_key("sk"))
			.with_key("mystery", KeyDefinition::new("x").with_api_key("sk"));
		let report = Synchronizer::new(&registry, &catalog).reconcile(&spec, now);
		let reasons: Vec<_> =
			report.skipped.iter().map(|s| (s.provider.as_str(), s.name.as_str())).collect();

		assert_eq!(report.inserted.len(), 1);
		assert_eq!(reasons, [
			("mystery", "x"),
			("openai", "good"),
			("openai", "empty"),
			("openai", "bad name"),
		]);
		assert_eq!(registry.providers(), vec![provider("openai")]);
	}

	#[test]
	fn invalid_update_keeps_the_existing_key_active() {
		let now = macros::datetime!(2025-11-10 12:00 UTC);
		let registry = KeyRegistry::default();
		let catalog = ProviderCatalog::open();
		let sync = Synchronizer::new(&registry, &catalog);

		let valid = PoolSpec::default().with_key("openai", KeyDefinition::new("a").with_api_key("sk"));
		let invalid = PoolSpec::default().with_key("openai", KeyDefinition::new("a"));

		sync.reconcile(&valid, now);

		let report = sync.reconcile(&invalid, now);
		let a = registry.lookup(&provider("openai"), &name("a")).expect("Key a should exist.");

		assert_eq!(report.skipped.len(), 1);
		assert!(report.deactivated.is_empty());
		assert!(a.active);
	}
}
