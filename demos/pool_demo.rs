//! Demonstrates a small key pool: two holders share one single-slot key, the second waits in
//! the queue, and the reaper hands capacity over once the first lease is released.

// crates.io
use color_eyre::Result;
use time::Duration;
// self
use keypool_broker::{
	AcquireRequest, Broker,
	config::BrokerConfig,
	id::{HolderId, ProviderId, TenantId},
	key::API_KEY_FIELD,
	sync::PoolSpec,
};

const POOL: &str = r#"{
	"openai": [
		{ "name": "primary", "api_key": "sk-demo-primary", "concurrency_limit": 1, "rpm_limit": 60, "priority": 10 },
		{ "name": "backup", "api_key": "sk-demo-backup", "concurrency_limit": 1, "rpm_limit": 10, "is_active": false }
	]
}"#;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let config = BrokerConfig::default()
		.with_default_ttl(Duration::seconds(30))
		.with_sweep_interval(Duration::seconds(1));
	let broker = Broker::new(config);
	let reaper = broker.reaper().spawn();
	let report = broker.reconcile(&PoolSpec::from_json(POOL)?).await;

	println!("Reconciled: {} inserted, {} skipped.", report.inserted.len(), report.skipped.len());

	let provider = ProviderId::new("openai")?;
	let tenant = TenantId::new("school-a")?;
	let first = broker
		.acquire(AcquireRequest::new(provider.clone(), tenant.clone(), HolderId::new("worker-1")?))
		.await?;

	println!(
		"worker-1 holds `{}` ({}).",
		first.key_name,
		first.secret.expose(API_KEY_FIELD).map(|_| "secret available").unwrap_or("no secret")
	);

	let waiting = {
		let broker = broker.clone();
		let request = AcquireRequest::new(provider.clone(), tenant.clone(), HolderId::new("worker-2")?)
			.with_priority(5)
			.with_timeout(Duration::seconds(10));

		tokio::spawn(async move { broker.acquire(request).await })
	};

	tokio::time::sleep(std::time::Duration::from_millis(100)).await;

	println!("Queue while worker-1 holds the key: {:?}.", broker.diagnose(&provider, &tenant));

	broker.heartbeat(&first.id)?;
	broker.release(&first.id);

	let second = waiting.await??;

	println!("worker-2 received `{}` after the handover.", second.key_name);
	println!("{}", serde_json::to_string_pretty(&broker.snapshot(&provider))?);

	broker.release(&second.id);
	reaper.shutdown().await;

	Ok(())
}
