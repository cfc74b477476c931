//! Admin mutations, reconciliation, and checkpoint/restore.

// self
use crate::{
	_prelude::*,
	broker::Broker,
	id::KeyId,
	key::ApiKeyRecord,
	obs::{self, BrokerOp, OpOutcome, OpSpan},
	store::PoolState,
	sync::{CredentialSource, PoolSpec, ReconcileReport, Synchronizer},
};

impl Broker {
	/// Deactivates or reactivates a key; returns whether the flag changed.
	///
	/// Outstanding leases on a deactivated key run to completion; waiters that can no longer be
	/// served resolve with [`Error::NoEligibleKey`].
	pub fn set_key_active(&self, key_id: KeyId, active: bool) -> Result<bool> {
		let changed = self.registry.set_active(key_id, active, self.now())?;

		if let Some(record) = self.registry.get(key_id).filter(|_| changed) {
			tracing::info!(key = %key_id, provider = %record.provider, active, "Key activity changed.");
			self.pump(&record.provider);
		}

		Ok(changed)
	}

	/// Applies a pool definition. Concurrent reconciliations run one at a time.
	pub async fn reconcile(&self, spec: &PoolSpec) -> ReconcileReport {
		const OP: BrokerOp = BrokerOp::Reconcile;

		let span = OpSpan::new(OP, None);

		obs::record_op_outcome(OP, OpOutcome::Attempt);

		span.instrument(async move {
			let _singleflight = self.reconcile_guard.lock().await;
			let report = Synchronizer::new(&self.registry, &self.catalog).reconcile(spec, self.now());

			tracing::info!(
				inserted = report.inserted.len(),
				updated = report.updated.len(),
				reactivated = report.reactivated.len(),
				deactivated = report.deactivated.len(),
				unchanged = report.unchanged,
				skipped = report.skipped.len(),
				"Key pool reconciled."
			);

			if !report.is_noop() {
				self.pump_all();
			}

			obs::record_op_outcome(
				OP,
				if report.skipped.is_empty() { OpOutcome::Success } else { OpOutcome::Failure },
			);

			report
		})
		.await
	}

	/// Loads a definition from `source` and applies it.
	pub async fn reconcile_from(&self, source: &dyn CredentialSource) -> Result<ReconcileReport> {
		let spec = source.load().await?;

		Ok(self.reconcile(&spec).await)
	}

	/// Copies the current registry, leases, and usage into a [`PoolState`].
	pub fn state(&self) -> PoolState {
		PoolState {
			saved_at: self.now(),
			keys: self.registry.all().iter().map(|record| ApiKeyRecord::clone(record)).collect(),
			leases: self.leases.leases(),
			usage: self.rate.windows(),
		}
	}

	/// Persists the current state to the attached store; a no-op without one.
	pub async fn checkpoint(&self) -> Result<()> {
		let Some(store) = &self.store else {
			return Ok(());
		};

		store.save(self.state()).await?;

		Ok(())
	}

	/// Loads the last checkpoint from the attached store and sweeps once before returning, so
	/// leases abandoned while the process was down are reclaimed before any acquire runs.
	pub async fn restore(self) -> Result<Self> {
		let state = match &self.store {
			Some(store) => store.load().await?,
			None => None,
		};

		if let Some(state) = state {
			tracing::info!(
				keys = state.keys.len(),
				leases = state.leases.len(),
				saved_at = %state.saved_at,
				"Restoring broker state."
			);

			self.registry.restore(state.keys);
			self.leases.restore(state.leases);
			self.rate.restore(state.usage);
		}

		self.reaper().sweep();

		Ok(self)
	}
}
