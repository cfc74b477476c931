//! Redacted credential material with a stable fingerprint.

// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

/// Field name used for single-token providers.
pub const API_KEY_FIELD: &str = "api_key";
/// Field name of the public half for access/secret key pairs.
pub const ACCESS_KEY_FIELD: &str = "access_key";
/// Field name of the private half for access/secret key pairs.
pub const SECRET_KEY_FIELD: &str = "secret_key";

/// Provider credential payload; every formatter redacts the values.
///
/// Single-token providers carry one `api_key` field, signed providers carry an
/// `access_key`/`secret_key` pair, and anything else may ship an arbitrary field map.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeySecret(BTreeMap<String, String>);
impl KeySecret {
	/// Wraps a single API token.
	pub fn api_key(value: impl Into<String>) -> Self {
		Self::from_fields([(API_KEY_FIELD, value.into())])
	}

	/// Wraps an access/secret key pair.
	pub fn key_pair(access: impl Into<String>, secret: impl Into<String>) -> Self {
		Self::from_fields([(ACCESS_KEY_FIELD, access.into()), (SECRET_KEY_FIELD, secret.into())])
	}

	/// Builds a payload from arbitrary fields, dropping blank values.
	pub fn from_fields<I, K, V>(fields: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		Self(
			fields
				.into_iter()
				.map(|(k, v)| (k.into(), v.into().trim().to_owned()))
				.filter(|(k, v)| !k.is_empty() && !v.is_empty())
				.collect(),
		)
	}

	/// Returns the raw value of a field. Callers must avoid logging it.
	pub fn expose(&self, field: &str) -> Option<&str> {
		self.0.get(field).map(String::as_str)
	}

	/// Field names present in the payload.
	pub fn fields(&self) -> impl Iterator<Item = &str> {
		self.0.keys().map(String::as_str)
	}

	/// Returns true when no field carries a value.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Base64 (no padding) SHA-256 digest over the sorted `field=value` lines.
	///
	/// Safe to log; lets operators tell whether two payloads match without seeing either.
	pub fn fingerprint(&self) -> String {
		let mut hasher = Sha256::new();

		for (field, value) in &self.0 {
			hasher.update(field.as_bytes());
			hasher.update(b"=");
			hasher.update(value.as_bytes());
			hasher.update(b"\n");
		}

		STANDARD_NO_PAD.encode(hasher.finalize())
	}
}
impl Debug for KeySecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_map().entries(self.0.keys().map(|field| (field, "<redacted>"))).finish()
	}
}
impl Display for KeySecret {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn formatters_redact_values() {
		let secret = KeySecret::key_pair("ak-visible?", "sk-super-secret");
		let debug = format!("{secret:?}");

		assert!(!debug.contains("ak-visible?"));
		assert!(!debug.contains("sk-super-secret"));
		assert!(debug.contains("access_key"));
		assert_eq!(format!("{secret}"), "<redacted>");
	}

	#[test]
	fn blank_fields_are_dropped() {
		let secret = KeySecret::from_fields([("api_key", "  "), ("", "value")]);

		assert!(secret.is_empty());
		assert_eq!(KeySecret::api_key(" sk-1 ").expose(API_KEY_FIELD), Some("sk-1"));
	}

	#[test]
	fn fingerprint_is_stable_and_sensitive_to_values() {
		let a = KeySecret::api_key("sk-1");

		assert_eq!(a.fingerprint(), KeySecret::api_key("sk-1").fingerprint());
		assert_ne!(a.fingerprint(), KeySecret::api_key("sk-2").fingerprint());
		assert!(!a.fingerprint().contains("sk-1"));
	}
}
