//! Credential records, secret material, and tenant scoping.

pub mod record;
pub mod scope;
pub mod secret;

pub use record::*;
pub use scope::*;
pub use secret::*;
