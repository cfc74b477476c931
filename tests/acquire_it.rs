// std
use std::sync::atomic::{AtomicUsize, Ordering};
// crates.io
use time::{Duration, OffsetDateTime, macros};
// self
use keypool_broker::{
	AcquireRequest, Broker, Lease,
	clock::{self, ManualClock},
	config::BrokerConfig,
	error::Error,
	id::{HolderId, KeyName, ProviderId, RequestId, TenantId},
	key::{API_KEY_FIELD, KeySecret, KeySettings, TenantScope},
	queue::{AdmissionStatus, BlockReason},
};

const START: OffsetDateTime = macros::datetime!(2025-11-10 12:00:05 UTC);

fn provider() -> ProviderId {
	ProviderId::new("openai").expect("Provider fixture should be valid.")
}

fn tenant(value: &str) -> TenantId {
	TenantId::new(value).expect("Tenant fixture should be valid.")
}

fn request(holder: &str) -> AcquireRequest {
	AcquireRequest::new(
		provider(),
		tenant("school-a"),
		HolderId::new(holder).expect("Holder fixture should be valid."),
	)
	.with_timeout(Duration::seconds(5))
}

fn key(concurrency_limit: u32, rpm_limit: u32) -> KeySettings {
	KeySettings::new(KeySecret::api_key("sk-test"))
		.with_concurrency_limit(concurrency_limit)
		.with_rpm_limit(rpm_limit)
}

fn broker_with(config: BrokerConfig, keys: Vec<(&str, KeySettings)>) -> (Broker, ManualClock) {
	let clock = ManualClock::new(START);
	let broker = Broker::new(config).with_clock(clock.clone());

	for (name, settings) in keys {
		broker.registry.insert(
			provider(),
			KeyName::new(name).expect("Key name fixture should be valid."),
			settings,
			START,
		);
	}

	(broker, clock)
}

async fn wait_for_queue(broker: &Broker, depth: usize) {
	for _ in 0..400 {
		if broker.queue.len(&provider()) == depth {
			return;
		}

		tokio::time::sleep(std::time::Duration::from_millis(5)).await;
	}

	panic!("Queue never reached depth {depth}.");
}

fn spawn_acquire(
	broker: &Broker,
	request: AcquireRequest,
) -> tokio::task::JoinHandle<Result<Lease, Error>> {
	let broker = broker.clone();

	tokio::spawn(async move { broker.acquire(request).await })
}

#[tokio::test]
async fn second_caller_waits_until_the_first_releases() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let held = broker.acquire(request("user-1")).await.expect("First acquire should succeed.");
	let waiting = spawn_acquire(&broker, request("user-2"));

	wait_for_queue(&broker, 1).await;

	assert!(!waiting.is_finished());
	assert_eq!(broker.leases.active_count(held.key_id), 1);
	assert_eq!(held.secret.expose(API_KEY_FIELD), Some("sk-test"));

	broker.release(&held.id);

	let handed_over = waiting
		.await
		.expect("Acquire task should not panic.")
		.expect("The queued acquire should be granted after the release.");

	assert_ne!(handed_over.id, held.id);
	assert_eq!(handed_over.key_id, held.key_id);
	assert_eq!(broker.leases.active_count(handed_over.key_id), 1);
	assert_eq!(broker.queue.len(&provider()), 0);
	assert_eq!(broker.metrics.queued(), 1);
}

#[tokio::test]
async fn rate_blocked_request_is_granted_after_the_minute_rolls_over() {
	let (broker, clock) = broker_with(BrokerConfig::default(), vec![("k2", key(10, 2))]);

	broker.acquire(request("user-1")).await.expect("First grant should succeed.");
	broker.acquire(request("user-2")).await.expect("Second grant should succeed.");

	let third = spawn_acquire(&broker, request("user-3"));

	wait_for_queue(&broker, 1).await;

	assert_eq!(broker.reaper().sweep().granted, 0);
	assert!(matches!(
		broker.diagnose(&provider(), &tenant("school-a")),
		AdmissionStatus::Blocked { reason: BlockReason::Queued, .. }
	));

	clock.advance(Duration::seconds(60));

	let report = broker.reaper().sweep();
	let lease = third
		.await
		.expect("Acquire task should not panic.")
		.expect("The third acquire should be granted in the next minute.");

	assert_eq!(report.granted, 1);
	assert_eq!(lease.minute_bucket, clock::minute_bucket(START) + 1);
}

#[tokio::test]
async fn higher_priority_waiter_overtakes_while_tiers_stay_fifo() {
	let config = BrokerConfig::default().with_aging_step(None);
	let (broker, _clock) = broker_with(config, vec![("k1", key(1, 0))]);
	let mut current = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let mut pending = Vec::new();

	for (holder, priority) in [("low-1", 0), ("low-2", 0), ("high-1", 5), ("high-2", 5)] {
		let handle = spawn_acquire(&broker, request(holder).with_priority(priority));

		wait_for_queue(&broker, pending.len() + 1).await;
		pending.push(handle);
	}

	let mut order = Vec::new();

	while !pending.is_empty() {
		broker.release(&current.id);

		let idx = loop {
			if let Some(idx) = pending.iter().position(|handle| handle.is_finished()) {
				break idx;
			}

			tokio::time::sleep(std::time::Duration::from_millis(5)).await;
		};

		current = pending
			.remove(idx)
			.await
			.expect("Acquire task should not panic.")
			.expect("Queued acquire should be granted.");
		order.push(current.holder.to_string());
	}

	assert_eq!(order, ["high-1", "high-2", "low-1", "low-2"]);
}

#[tokio::test]
async fn preferred_key_is_used_before_falling_back() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![
		("spare", key(1, 0)),
		("preferred", key(1, 0).with_priority(10)),
	]);
	let first = broker.acquire(request("user-1")).await.expect("First grant should succeed.");
	let second = broker.acquire(request("user-2")).await.expect("Second grant should succeed.");

	assert_eq!(first.key_name.as_ref(), "preferred");
	assert_eq!(second.key_name.as_ref(), "spare");
}

#[tokio::test]
async fn missing_keys_fail_fast_instead_of_queueing() {
	let scoped = key(1, 0).with_tenant_scope(TenantScope::only([tenant("school-a")]));
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("scoped", scoped)]);
	let other_tenant = AcquireRequest::new(
		provider(),
		tenant("school-b"),
		HolderId::new("user-1").expect("Holder fixture should be valid."),
	);
	let unknown_provider = AcquireRequest::new(
		ProviderId::new("kling").expect("Provider fixture should be valid."),
		tenant("school-a"),
		HolderId::new("user-1").expect("Holder fixture should be valid."),
	);

	assert!(matches!(broker.acquire(other_tenant).await, Err(Error::NoEligibleKey { .. })));
	assert!(matches!(broker.acquire(unknown_provider).await, Err(Error::NoEligibleKey { .. })));
	assert_eq!(broker.queue.len(&provider()), 0);
	assert_eq!(
		broker.diagnose(&provider(), &tenant("school-b")),
		AdmissionStatus::NoEligibleKey
	);

	let lease = broker.acquire(request("user-2")).await.expect("In-scope tenant should be granted.");

	assert_eq!(lease.tenant, tenant("school-a"));
}

#[tokio::test]
async fn expired_key_is_never_leased() {
	let (broker, clock) = broker_with(BrokerConfig::default(), vec![(
		"short-lived",
		key(1, 0).with_expires_at(Some(START + Duration::minutes(5))),
	)]);

	broker
		.release(&broker.acquire(request("user-1")).await.expect("Fresh key should be leased.").id);
	clock.advance(Duration::minutes(5));

	assert!(matches!(broker.acquire(request("user-2")).await, Err(Error::NoEligibleKey { .. })));
}

#[tokio::test]
async fn queued_request_times_out_and_leaves_the_queue() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let _held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let result = broker.acquire(request("late").with_timeout(Duration::milliseconds(50))).await;

	assert!(matches!(result, Err(Error::Timeout { .. })));
	assert_eq!(broker.queue.len(&provider()), 0);
	assert_eq!(broker.metrics.timeouts(), 1);
}

#[tokio::test]
async fn cancel_resolves_only_the_targeted_waiter() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let doomed_id = RequestId::new("req-doomed").expect("Request fixture should be valid.");
	let doomed = spawn_acquire(&broker, request("doomed").with_request_id(doomed_id.clone()));

	wait_for_queue(&broker, 1).await;

	let survivor = spawn_acquire(&broker, request("survivor"));

	wait_for_queue(&broker, 2).await;

	assert_eq!(broker.queue_position(&doomed_id), Some(1));
	assert!(broker.cancel(&doomed_id));
	assert!(!broker.cancel(&doomed_id));
	assert!(matches!(
		doomed.await.expect("Acquire task should not panic."),
		Err(Error::Cancelled { ref request }) if request == &doomed_id
	));

	broker.release(&held.id);

	let lease = survivor
		.await
		.expect("Acquire task should not panic.")
		.expect("The surviving waiter should be granted.");

	assert_eq!(lease.holder.as_ref(), "survivor");
	assert_eq!(broker.metrics.cancellations(), 1);
}

#[tokio::test]
async fn repeated_request_id_is_refused_while_the_first_waits() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let shared_id = RequestId::new("req-shared").expect("Request fixture should be valid.");
	let first = spawn_acquire(
		&broker,
		request("first").with_request_id(shared_id.clone()).with_timeout(Duration::seconds(2)),
	);

	wait_for_queue(&broker, 1).await;

	assert!(matches!(
		broker.acquire(request("second").with_request_id(shared_id.clone())).await,
		Err(Error::DuplicateRequest { ref request }) if request == &shared_id
	));
	assert_eq!(broker.queue.len(&provider()), 1);

	broker.release(&held.id);

	let lease = tokio::time::timeout(std::time::Duration::from_secs(3), first)
		.await
		.expect("The first waiter should resolve.")
		.expect("Acquire task should not panic.")
		.expect("The first waiter should be granted.");

	assert_eq!(lease.holder.as_ref(), "first");

	broker.release(&lease.id);

	assert!(broker.leases.is_empty());
	assert_eq!(broker.queue.len(&provider()), 0);
}

#[tokio::test]
async fn multi_unit_waiter_is_not_overtaken_by_smaller_requests() {
	let config = BrokerConfig::default().with_aging_step(None);
	let (broker, clock) = broker_with(config, vec![("k1", key(10, 3))]);

	broker.acquire(request("early").with_units(2)).await.expect("Initial grant should succeed.");

	let large = spawn_acquire(&broker, request("large").with_units(2));

	wait_for_queue(&broker, 1).await;

	let small = spawn_acquire(&broker, request("small"));

	wait_for_queue(&broker, 2).await;
	broker.reaper().sweep();

	assert!(!small.is_finished());
	assert!(!large.is_finished());
	assert!(matches!(
		broker.try_acquire(request("impatient")),
		Err(Error::Unavailable { reason: BlockReason::Queued, .. })
	));

	clock.advance(Duration::seconds(60));

	let report = broker.reaper().sweep();
	let large = large
		.await
		.expect("Acquire task should not panic.")
		.expect("The earlier waiter should be granted first.");
	let small = small
		.await
		.expect("Acquire task should not panic.")
		.expect("The later waiter should fit behind it.");

	assert_eq!(report.granted, 2);
	assert_eq!(large.units, 2);
	assert_eq!(small.minute_bucket, large.minute_bucket);
	assert_eq!(broker.rate.usage(large.key_id, START + Duration::seconds(60)), 3);
}

#[tokio::test]
async fn waiter_with_disjoint_keys_is_served_past_a_blocked_head() {
	let scoped = |tenant_id: &str| {
		key(1, 0).with_tenant_scope(TenantScope::only([tenant(tenant_id)]))
	};
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![
		("key-a", scoped("school-a")),
		("key-b", scoped("school-b")),
	]);
	let for_tenant = |holder: &str, tenant_id: &str| {
		AcquireRequest::new(
			provider(),
			tenant(tenant_id),
			HolderId::new(holder).expect("Holder fixture should be valid."),
		)
		.with_timeout(Duration::seconds(5))
	};
	let _held_a = broker
		.acquire(for_tenant("holder-a", "school-a"))
		.await
		.expect("Tenant A grant should succeed.");
	let held_b = broker
		.acquire(for_tenant("holder-b", "school-b"))
		.await
		.expect("Tenant B grant should succeed.");
	let waiting_a = spawn_acquire(&broker, for_tenant("waiter-a", "school-a"));

	wait_for_queue(&broker, 1).await;

	let waiting_b = spawn_acquire(&broker, for_tenant("waiter-b", "school-b"));

	wait_for_queue(&broker, 2).await;
	broker.release(&held_b.id);

	let lease = waiting_b
		.await
		.expect("Acquire task should not panic.")
		.expect("Tenant B waiter should use its own key.");

	assert_eq!(lease.key_name.as_ref(), "key-b");
	assert!(!waiting_a.is_finished());
	assert_eq!(broker.queue.len(&provider()), 1);
}

#[tokio::test]
async fn manual_clock_expires_waiters_only_through_the_sweep() {
	let config = BrokerConfig::default().with_waiter_max_age(Duration::minutes(1));
	let (broker, clock) = broker_with(config, vec![("k1", key(1, 0))]);
	let _held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let waiting = spawn_acquire(&broker, request("stale").with_timeout(Duration::seconds(30)));

	wait_for_queue(&broker, 1).await;
	clock.advance(Duration::seconds(90));
	tokio::time::sleep(std::time::Duration::from_millis(20)).await;

	assert!(!waiting.is_finished());
	assert_eq!(broker.reaper().sweep().expired_waiters, 1);
	assert!(matches!(
		waiting.await.expect("Acquire task should not panic."),
		Err(Error::Timeout { .. })
	));
}

#[tokio::test]
async fn dropped_acquire_withdraws_its_waiter() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let abandoned = spawn_acquire(&broker, request("abandoned"));

	wait_for_queue(&broker, 1).await;
	abandoned.abort();

	let _ = abandoned.await;

	wait_for_queue(&broker, 0).await;
	broker.release(&held.id);

	assert!(broker.leases.is_empty());
}

#[tokio::test]
async fn try_acquire_reports_why_it_refused() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![
		("k1", key(1, 0).with_priority(1)),
		("k2", key(5, 1)),
	]);
	let first = broker.try_acquire(request("user-1")).expect("Idle pool should grant immediately.");
	let second = broker.try_acquire(request("user-2")).expect("Fallback key should grant.");

	assert_eq!(first.key_name.as_ref(), "k1");
	assert_eq!(second.key_name.as_ref(), "k2");

	match broker.try_acquire(request("user-3")) {
		Err(Error::Unavailable { reason, retry_after, .. }) => {
			assert_eq!(reason, BlockReason::ConcurrencyAndRate);
			assert_eq!(retry_after, Some(clock::until_next_bucket(START)));
		},
		other => panic!("Unexpected immediate acquire outcome: {other:?}."),
	}

	broker.release(&first.id);

	let third = broker.try_acquire(request("user-3")).expect("Released capacity should grant.");

	assert_eq!(third.key_name.as_ref(), "k1");
}

#[tokio::test]
async fn try_acquire_on_a_spent_minute_reports_rate() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(2, 1))]);

	broker.try_acquire(request("user-1")).expect("Idle pool should grant immediately.");

	assert!(matches!(
		broker.try_acquire(request("user-2")),
		Err(Error::Unavailable { reason: BlockReason::Rate, retry_after: Some(_), .. })
	));
	assert!(matches!(
		broker.diagnose(&provider(), &tenant("school-a")),
		AdmissionStatus::Blocked { reason: BlockReason::Rate, retry_after: Some(_) }
	));
}

#[tokio::test]
async fn diagnosis_accounts_for_requested_units() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(5, 3))]);

	broker.acquire(request("user-1").with_units(2)).await.expect("Initial grant should succeed.");

	assert_eq!(broker.diagnose(&provider(), &tenant("school-a")), AdmissionStatus::Available);
	assert!(matches!(
		broker.diagnose_units(&provider(), &tenant("school-a"), 2),
		AdmissionStatus::Blocked { reason: BlockReason::Rate, retry_after: Some(_) }
	));
	assert!(matches!(
		broker.try_acquire(request("user-2").with_units(2)),
		Err(Error::Unavailable { reason: BlockReason::Rate, .. })
	));
}

#[tokio::test]
async fn try_acquire_does_not_overtake_waiters() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![("k1", key(1, 0))]);
	let held = broker.acquire(request("holder")).await.expect("Initial grant should succeed.");
	let waiting = spawn_acquire(&broker, request("patient"));

	wait_for_queue(&broker, 1).await;

	assert!(matches!(
		broker.try_acquire(request("impatient")),
		Err(Error::Unavailable { reason: BlockReason::Queued, .. })
	));

	broker.release(&held.id);

	let lease = waiting.await.expect("Acquire task should not panic.").expect("Waiter should be granted.");

	assert_eq!(lease.holder.as_ref(), "patient");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_never_exceed_key_ceilings() {
	let (broker, _clock) = broker_with(BrokerConfig::default(), vec![
		("k1", key(2, 0)),
		("k2", key(3, 0).with_priority(1)),
	]);
	let peak = std::sync::Arc::new(AtomicUsize::new(0));
	let handles: Vec<_> = (0..40)
		.map(|idx| {
			let broker = broker.clone();
			let peak = peak.clone();

			tokio::spawn(async move {
				let lease = broker
					.acquire(request(&format!("user-{idx}")).with_timeout(Duration::seconds(10)))
					.await
					.expect("Every caller should eventually be granted.");
				let ceiling = if lease.key_name.as_ref() == "k1" { 2 } else { 3 };

				assert!(broker.leases.active_count(lease.key_id) <= ceiling);
				peak.fetch_max(broker.leases.len(), Ordering::SeqCst);
				tokio::task::yield_now().await;
				broker.release(&lease.id);
			})
		})
		.collect();

	for handle in handles {
		handle.await.expect("Acquire task should not panic.");
	}

	assert!(peak.load(Ordering::SeqCst) <= 5);
	assert!(broker.leases.is_empty());
	assert_eq!(broker.metrics.grants(), 40);
}
