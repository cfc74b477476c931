// crates.io
use tracing::{Instrument, instrument::Instrumented};
// self
use crate::{_prelude::*, id::ProviderId, obs::BrokerOp};

/// A span builder used by broker operations.
#[derive(Clone, Debug)]
pub struct OpSpan {
	span: tracing::Span,
}
impl OpSpan {
	/// Creates a new span tagged with the operation and provider.
	pub fn new(op: BrokerOp, provider: Option<&ProviderId>) -> Self {
		let provider = provider.map(|provider| provider.as_ref()).unwrap_or("-");

		Self { span: tracing::info_span!("keypool_broker.op", op = op.as_str(), provider) }
	}

	/// Enters the span for synchronous sections.
	pub fn entered(self) -> OpSpanGuard {
		OpSpanGuard { _guard: self.span.entered() }
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> Instrumented<Fut>
	where
		Fut: Future,
	{
		fut.instrument(self.span.clone())
	}
}

/// RAII guard returned by [`OpSpan::entered`].
pub struct OpSpanGuard {
	_guard: tracing::span::EnteredSpan,
}
impl Debug for OpSpanGuard {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("OpSpanGuard(..)")
	}
}
