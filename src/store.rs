//! Persistence contracts and built-in stores for broker state.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

// self
use crate::{_prelude::*, key::ApiKeyRecord, lease::Lease, rate::UsageWindow};

/// Persistence contract for broker state.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + 'a + Send>>;

/// Storage backend contract for broker checkpoints.
pub trait StateStore
where
	Self: Send + Sync,
{
	/// Persists or replaces the latest checkpoint.
	fn save(&self, state: PoolState) -> StoreFuture<'_, ()>;

	/// Fetches the latest checkpoint, if any was saved.
	fn load(&self) -> StoreFuture<'_, Option<PoolState>>;
}

/// Point-in-time copy of everything needed to resume after a restart.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolState {
	/// Checkpoint instant.
	#[serde(with = "time::serde::rfc3339")]
	pub saved_at: OffsetDateTime,
	/// Every registered key, active or not.
	pub keys: Vec<ApiKeyRecord>,
	/// Leases outstanding at checkpoint time.
	pub leases: Vec<Lease>,
	/// Retained usage windows.
	pub usage: Vec<UsageWindow>,
}

/// Error type produced by [`StateStore`] implementations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum StoreError {
	/// Serialization failures surfaced by the backend.
	#[error("Serialization error: {message}.")]
	Serialization {
		/// Human-readable error payload.
		message: String,
	},
	/// Backend-level failure for the storage engine.
	#[error("Backend failure: {message}.")]
	Backend {
		/// Human-readable error payload.
		message: String,
	},
}
