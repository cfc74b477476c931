//! Multi-tenant API key pool broker: lease provider credentials under per-key concurrency and
//! requests-per-minute ceilings, with fair priority/FIFO admission and heartbeat-driven
//! reclamation of abandoned leases.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod key;
pub mod lease;
pub mod obs;
pub mod queue;
pub mod rate;
pub mod reaper;
pub mod registry;
pub mod store;
pub mod sync;

mod _prelude {
	pub use std::{
		collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
		error::Error as StdError,
		fmt::{Debug, Display, Formatter, Result as FmtResult},
		future::Future,
		pin::Pin,
		str::FromStr,
		sync::Arc,
	};

	pub use async_lock::Mutex as AsyncMutex;
	pub use parking_lot::{Mutex, RwLock};
	pub use serde::{Deserialize, Serialize};
	pub use thiserror::Error as ThisError;
	pub use time::{Duration, OffsetDateTime};

	pub use crate::error::{Error, Result};
}

pub use broker::{AcquireRequest, Broker};
pub use lease::{Lease, LeaseEnd, ReleaseOutcome};
#[cfg(test)] use color_eyre as _;
