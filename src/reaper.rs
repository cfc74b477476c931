//! Heartbeat reaper: reclaims abandoned leases and keeps queues and usage tidy.
//!
//! A sweep reclaims every lease whose deadline passed, using the generation observed at scan
//! time so a heartbeat or release racing with the sweep wins. It then expires waiters older
//! than the configured maximum age, drops old usage buckets, and re-offers capacity to every
//! queue (a minute rollover frees rate budget without any release happening).

// crates.io
use tokio::{
	sync::oneshot,
	task::JoinHandle,
	time::{self, MissedTickBehavior},
};
// self
use crate::{
	_prelude::*,
	broker::Broker,
	clock,
	id::LeaseId,
	lease::LeaseEnd,
	obs::{self, BrokerOp, OpOutcome, OpSpan},
};

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
	/// Leases reclaimed from unresponsive holders.
	pub reclaimed: Vec<LeaseId>,
	/// Waiters expired for exceeding the maximum queue age.
	pub expired_waiters: usize,
	/// Usage buckets garbage-collected.
	pub collected_buckets: usize,
	/// Waiters granted while re-offering capacity.
	pub granted: usize,
}

/// Periodic sweeper bound to a broker.
#[derive(Clone, Debug)]
pub struct Reaper {
	broker: Broker,
}
impl Reaper {
	/// Binds a reaper to `broker`.
	pub fn new(broker: Broker) -> Self {
		Self { broker }
	}

	/// Runs one sweep at the broker's current time.
	pub fn sweep(&self) -> SweepReport {
		const OP: BrokerOp = BrokerOp::Sweep;

		let _span = OpSpan::new(OP, None).entered();
		let broker = &self.broker;
		let now = broker.now();
		let mut report = SweepReport::default();

		for (lease_id, generation) in broker.leases.expired(now) {
			let Some(lease) = broker.leases.reclaim(&lease_id, generation, now) else {
				continue;
			};

			broker.metrics.record_reclamation();
			broker.record_end(&lease, LeaseEnd::Reclaimed, now);
			obs::record_reclaimed(&lease.provider);
			tracing::warn!(
				lease = %lease.id,
				key = %lease.key_id,
				holder = %lease.holder,
				tenant = %lease.tenant,
				last_heartbeat_at = %lease.last_heartbeat_at,
				"Reclaimed abandoned lease."
			);
			report.reclaimed.push(lease.id);
		}

		let config = broker.config();

		report.expired_waiters = broker.queue.expire_older_than(now - config.waiter_max_age);
		report.collected_buckets = broker.rate.gc(now - config.usage_retention);
		report.granted = broker.pump_all();

		obs::record_op_outcome(OP, OpOutcome::Success);

		if report != SweepReport::default() {
			tracing::debug!(
				reclaimed = report.reclaimed.len(),
				expired_waiters = report.expired_waiters,
				collected_buckets = report.collected_buckets,
				granted = report.granted,
				"Sweep finished."
			);
		}

		report
	}

	/// Spawns the periodic sweep on the current Tokio runtime.
	///
	/// The first sweep runs immediately; a checkpoint follows every sweep when the broker has
	/// a store attached.
	pub fn spawn(self) -> ReaperHandle {
		let (shutdown, mut stop) = oneshot::channel();
		let task = tokio::spawn(async move {
			let mut tick = time::interval(clock::to_std(self.broker.config().sweep_interval));

			tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = &mut stop => break,
					_ = tick.tick() => {
						self.sweep();

						if let Err(e) = self.broker.checkpoint().await {
							tracing::warn!(error = %e, "Checkpoint after sweep failed.");
						}
					}
				}
			}

			tracing::debug!("Reaper stopped.");
		});

		ReaperHandle { shutdown: Some(shutdown), task }
	}
}

/// Handle to a spawned reaper; dropping it stops the task.
#[derive(Debug)]
pub struct ReaperHandle {
	shutdown: Option<oneshot::Sender<()>>,
	task: JoinHandle<()>,
}
impl ReaperHandle {
	/// Stops the reaper and waits for the in-progress sweep, if any, to finish.
	pub async fn shutdown(mut self) {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}

		let _ = (&mut self.task).await;
	}

	/// Returns true once the task has exited.
	pub fn is_finished(&self) -> bool {
		self.task.is_finished()
	}
}
impl Drop for ReaperHandle {
	fn drop(&mut self) {
		if let Some(shutdown) = self.shutdown.take() {
			let _ = shutdown.send(());
		}
	}
}

impl Broker {
	/// Returns a reaper bound to this broker.
	pub fn reaper(&self) -> Reaper {
		Reaper::new(self.clone())
	}
}
