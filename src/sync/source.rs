//! Pluggable origins for pool definitions.

// self
use crate::{
	_prelude::*,
	error::ConfigError,
	sync::{KEY_POOL_ENV, PoolSpec},
};

/// Future returned by [`CredentialSource::load`].
pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = Result<PoolSpec, ConfigError>> + 'a + Send>>;

/// Supplies the declarative pool definition on demand.
pub trait CredentialSource
where
	Self: Send + Sync,
{
	/// Loads the current definition.
	fn load(&self) -> SourceFuture<'_>;
}

/// Reads the definition from an environment variable on every load.
#[derive(Clone, Debug)]
pub struct EnvSource {
	var: String,
}
impl EnvSource {
	/// Reads the named variable instead of [`KEY_POOL_ENV`].
	pub fn new(var: impl Into<String>) -> Self {
		Self { var: var.into() }
	}

	/// Variable consulted by this source.
	pub fn var(&self) -> &str {
		&self.var
	}
}
impl Default for EnvSource {
	fn default() -> Self {
		Self::new(KEY_POOL_ENV)
	}
}
impl CredentialSource for EnvSource {
	fn load(&self) -> SourceFuture<'_> {
		Box::pin(async move { PoolSpec::from_env_var(&self.var) })
	}
}

/// Serves a fixed definition; useful for tests and embedded deployments.
#[derive(Clone, Debug, Default)]
pub struct StaticSource(Arc<RwLock<PoolSpec>>);
impl StaticSource {
	/// Wraps a definition.
	pub fn new(spec: PoolSpec) -> Self {
		Self(Arc::new(RwLock::new(spec)))
	}

	/// Swaps the served definition; the next load observes it.
	pub fn replace(&self, spec: PoolSpec) {
		*self.0.write() = spec;
	}
}
impl CredentialSource for StaticSource {
	fn load(&self) -> SourceFuture<'_> {
		Box::pin(async move { Ok(self.0.read().clone()) })
	}
}
