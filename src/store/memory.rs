//! In-memory [`StateStore`] for tests and single-process deployments.

// self
use crate::{
	_prelude::*,
	store::{PoolState, StateStore, StoreFuture},
};

/// Keeps the latest checkpoint in-process.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<RwLock<Option<PoolState>>>);
impl MemoryStore {
	/// Starts from an existing checkpoint, as if a previous process had saved it.
	pub fn with_state(state: PoolState) -> Self {
		Self(Arc::new(RwLock::new(Some(state))))
	}

	/// Returns the latest checkpoint without going through the async contract.
	pub fn latest(&self) -> Option<PoolState> {
		self.0.read().clone()
	}
}
impl StateStore for MemoryStore {
	fn save(&self, state: PoolState) -> StoreFuture<'_, ()> {
		Box::pin(async move {
			*self.0.write() = Some(state);

			Ok(())
		})
	}

	fn load(&self) -> StoreFuture<'_, Option<PoolState>> {
		Box::pin(async move { Ok(self.latest()) })
	}
}
