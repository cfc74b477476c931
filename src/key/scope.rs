//! Tenant scoping for credentials.

// self
use crate::{
	_prelude::*,
	id::{IdentifierError, TenantId},
};

const WILDCARD: &str = "*";

/// Tenants allowed to lease a credential.
///
/// On the wire a scope is `"*"` (or blank) for every tenant, a comma-separated string, or a
/// list of tenant identifiers.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ScopeRepr", into = "ScopeRepr")]
pub enum TenantScope {
	/// Every tenant may use the key.
	#[default]
	Any,
	/// Only the listed tenants may use the key.
	Only(BTreeSet<TenantId>),
}
impl TenantScope {
	/// Builds an explicit scope from tenant identifiers.
	pub fn only<I>(tenants: I) -> Self
	where
		I: IntoIterator<Item = TenantId>,
	{
		Self::Only(tenants.into_iter().collect())
	}

	/// Parses the textual form (`"*"`, blank, or `"a,b,c"`).
	pub fn parse(text: &str) -> Result<Self, IdentifierError> {
		let text = text.trim();

		if text.is_empty() || text == WILDCARD {
			return Ok(Self::Any);
		}

		Self::from_parts(text.split(','))
	}

	/// Returns true when `tenant` may lease under this scope (exact membership for lists).
	pub fn permits(&self, tenant: &TenantId) -> bool {
		match self {
			Self::Any => true,
			Self::Only(tenants) => tenants.contains(tenant),
		}
	}

	fn from_parts<'a, I>(parts: I) -> Result<Self, IdentifierError>
	where
		I: IntoIterator<Item = &'a str>,
	{
		let mut tenants = BTreeSet::new();

		for part in parts.into_iter().map(str::trim).filter(|part| !part.is_empty()) {
			if part == WILDCARD {
				return Ok(Self::Any);
			}

			tenants.insert(TenantId::new(part)?);
		}

		if tenants.is_empty() { Ok(Self::Any) } else { Ok(Self::Only(tenants)) }
	}
}
impl Debug for TenantScope {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		write!(f, "TenantScope({self})")
	}
}
impl Display for TenantScope {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Any => f.write_str(WILDCARD),
			Self::Only(tenants) => {
				for (idx, tenant) in tenants.iter().enumerate() {
					if idx > 0 {
						f.write_str(",")?;
					}

					f.write_str(tenant)?;
				}

				Ok(())
			},
		}
	}
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ScopeRepr {
	Text(String),
	List(Vec<String>),
}
impl TryFrom<ScopeRepr> for TenantScope {
	type Error = IdentifierError;

	fn try_from(repr: ScopeRepr) -> Result<Self, Self::Error> {
		match repr {
			ScopeRepr::Text(text) => Self::parse(&text),
			ScopeRepr::List(items) => Self::from_parts(items.iter().map(String::as_str)),
		}
	}
}
impl From<TenantScope> for ScopeRepr {
	fn from(scope: TenantScope) -> Self {
		Self::Text(scope.to_string())
	}
}
