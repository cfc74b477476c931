// crates.io
use time::{Duration, OffsetDateTime, macros};
// self
use keypool_broker::{
	AcquireRequest, Broker, ReleaseOutcome,
	clock::ManualClock,
	config::{BrokerConfig, ProviderCatalog},
	error::{ConfigError, Error},
	id::{HolderId, KeyName, ProviderId, TenantId},
	key::API_KEY_FIELD,
	sync::{EnvSource, KeyDefinition, PoolSpec, StaticSource},
};

const START: OffsetDateTime = macros::datetime!(2025-11-10 12:00:05 UTC);

fn provider() -> ProviderId {
	ProviderId::new("openai").expect("Provider fixture should be valid.")
}

fn request(holder: &str) -> AcquireRequest {
	AcquireRequest::new(
		provider(),
		TenantId::new("school-a").expect("Tenant fixture should be valid."),
		HolderId::new(holder).expect("Holder fixture should be valid."),
	)
	.with_timeout(Duration::seconds(5))
}

fn broker() -> (Broker, ManualClock) {
	let clock = ManualClock::new(START);

	(Broker::new(BrokerConfig::default()).with_clock(clock.clone()), clock)
}

fn pool(names: &[&str]) -> PoolSpec {
	names.iter().fold(PoolSpec::default(), |spec, name| {
		spec.with_key("openai", KeyDefinition::new(*name).with_api_key(format!("sk-{name}")))
	})
}

#[tokio::test]
async fn removed_key_finishes_its_lease_but_is_not_leased_again() {
	let (broker, _clock) = broker();

	broker.reconcile(&pool(&["k3"])).await;

	let lease = broker.acquire(request("user-1")).await.expect("Acquire should succeed.");

	assert_eq!(lease.secret.expose(API_KEY_FIELD), Some("sk-k3"));

	let report = broker.reconcile(&PoolSpec::default()).await;

	assert_eq!(report.deactivated, vec![lease.key_id]);
	assert!(broker.heartbeat(&lease.id).is_ok());
	assert!(matches!(broker.acquire(request("user-2")).await, Err(Error::NoEligibleKey { .. })));
	assert_eq!(broker.release(&lease.id), ReleaseOutcome::Released);
}

#[tokio::test]
async fn waiter_on_a_deactivated_pool_resolves_as_ineligible() {
	let (broker, _clock) = broker();

	broker.reconcile(&pool(&["only"])).await;

	let held = broker.acquire(request("holder")).await.expect("Acquire should succeed.");
	let waiting = {
		let broker = broker.clone();

		tokio::spawn(async move { broker.acquire(request("waiter")).await })
	};

	for _ in 0..400 {
		if broker.queue.len(&provider()) == 1 {
			break;
		}

		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
	}

	assert!(broker.set_key_active(held.key_id, false).expect("Key should exist."));
	assert!(matches!(
		waiting.await.expect("Acquire task should not panic."),
		Err(Error::NoEligibleKey { .. })
	));
	assert!(!broker.set_key_active(held.key_id, false).expect("Key should exist."));
}

#[tokio::test]
async fn reactivated_key_serves_new_requests() {
	let (broker, _clock) = broker();

	broker.reconcile(&pool(&["a", "b"])).await;
	broker.reconcile(&pool(&["a"])).await;

	let report = broker.reconcile(&pool(&["a", "b"])).await;
	let b = broker
		.registry
		.lookup(&provider(), &KeyName::new("b").expect("Key name fixture should be valid."))
		.expect("Key b should be registered.");

	assert_eq!(report.reactivated, vec![b.id]);
	assert!(b.active);
	assert_eq!(broker.registry.records(&provider()).len(), 2);
}

#[tokio::test]
async fn updated_limits_apply_to_the_next_grant() {
	let (broker, _clock) = broker();

	broker.reconcile(&pool(&["k"])).await;

	let first = broker.acquire(request("user-1")).await.expect("Acquire should succeed.");

	assert!(broker.try_acquire(request("user-2")).is_err());

	let wider = PoolSpec::default()
		.with_key("openai", KeyDefinition::new("k").with_api_key("sk-k").with_concurrency_limit(2));
	let report = broker.reconcile(&wider).await;
	let second = broker.try_acquire(request("user-2")).expect("Raised ceiling should admit.");

	assert_eq!(report.updated, vec![first.key_id]);
	assert_eq!(second.key_id, first.key_id);
}

#[tokio::test]
async fn catalog_limits_which_providers_reconcile() {
	let (broker, _clock) = broker();
	let broker = broker.with_catalog(ProviderCatalog::only([provider()]));
	let spec = pool(&["k"]).with_key("runway", KeyDefinition::new("r").with_api_key("sk-r"));
	let report = broker.reconcile(&spec).await;

	assert_eq!(report.inserted.len(), 1);
	assert_eq!(report.skipped.len(), 1);
	assert_eq!(report.skipped[0].provider, "runway");
	assert_eq!(broker.registry.providers(), vec![provider()]);
}

#[tokio::test]
async fn sources_feed_reconciliation() {
	let (broker, _clock) = broker();
	let source = StaticSource::new(pool(&["a"]));

	assert_eq!(broker.reconcile_from(&source).await.expect("Static source should load.").inserted.len(), 1);

	source.replace(pool(&["b"]));

	let report = broker.reconcile_from(&source).await.expect("Static source should load.");

	assert_eq!(report.inserted.len(), 1);
	assert_eq!(report.deactivated.len(), 1);

	let missing = EnvSource::new("KEYPOOL_BROKER_IT_UNSET_VARIABLE");

	assert!(matches!(
		broker.reconcile_from(&missing).await,
		Err(Error::Config(ConfigError::MissingEnv { .. }))
	));
}

#[tokio::test]
async fn pool_json_round_trips_through_reconcile() {
	let (broker, _clock) = broker();
	let spec = PoolSpec::from_json(
		r#"{ "openai": [
			{ "name": "main", "api_key": "sk-main", "concurrency_limit": 2, "rpm_limit": 30, "priority": 5 },
			{ "name": "backup", "api_key": "sk-backup", "is_active": false }
		] }"#,
	)
	.expect("Pool definition should parse.");
	let report = broker.reconcile(&spec).await;
	let records = broker.registry.records(&provider());
	let main = records
		.iter()
		.find(|record| record.name.as_ref() == "main")
		.expect("Main key should be registered.");

	assert_eq!(report.inserted.len(), 2);
	assert_eq!((main.concurrency_limit, main.rpm_limit, main.priority), (2, 30, 5));
	assert_eq!(records.iter().filter(|record| record.active).count(), 1);
}
