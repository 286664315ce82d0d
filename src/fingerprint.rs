//! Canonical content hashing for staged record payloads.
//!
//! A fingerprint is stable under key-order permutation of JSON objects and
//! under removal of fields that lie on an excluded dot-path (or beneath one).
//! See SPEC_FULL.md §4.1.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FingerprintError {
	#[error("failed to serialize canonical payload: {0}")]
	Serialize(#[from] serde_json::Error),
}

/// A set of dot-paths (e.g. `"metadata.internal_id"`) to exclude from the
/// canonical payload. A path also excludes everything nested beneath it.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
	paths: Vec<String>,
}

impl ExcludeSet {
	pub fn new(paths: impl IntoIterator<Item = String>) -> Self {
		Self {
			paths: paths.into_iter().collect(),
		}
	}

	pub fn empty() -> Self {
		Self { paths: Vec::new() }
	}

	fn excludes(&self, path: &str) -> bool {
		self.paths
			.iter()
			.any(|p| path == p || path.starts_with(&format!("{p}.")))
	}
}

/// Compute the 64-character hex SHA-256 fingerprint of `payload`, omitting
/// any field whose dot-path is in `exclude`.
pub fn fingerprint(
	payload: &serde_json::Value,
	exclude: &ExcludeSet,
) -> Result<String, FingerprintError> {
	let canonical = canonicalize(payload, "", exclude);
	let bytes = serde_json::to_vec(&canonical)?;
	let mut hasher = Sha256::new();
	hasher.update(&bytes);
	Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
	use std::fmt::Write;
	let mut s = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		write!(s, "{b:02x}").expect("writing to String cannot fail");
	}
	s
}

/// Recursively rebuild `value` with object keys emitted in sorted order
/// (via `BTreeMap`) and excluded dot-paths dropped. Arrays keep their order.
fn canonicalize(value: &serde_json::Value, path: &str, exclude: &ExcludeSet) -> serde_json::Value {
	match value {
		serde_json::Value::Object(map) => {
			let mut sorted: BTreeMap<String, serde_json::Value> = BTreeMap::new();
			for (k, v) in map {
				let child_path = if path.is_empty() {
					k.clone()
				} else {
					format!("{path}.{k}")
				};
				if exclude.excludes(&child_path) {
					continue;
				}
				sorted.insert(k.clone(), canonicalize(v, &child_path, exclude));
			}
			serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
		}
		serde_json::Value::Array(items) => serde_json::Value::Array(
			items
				.iter()
				.enumerate()
				.map(|(i, v)| canonicalize(v, &format!("{path}[{i}]"), exclude))
				.collect(),
		),
		other => other.clone(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn stable_under_key_permutation() {
		let a = json!({"name": "Ann", "email": "a@x"});
		let b = json!({"email": "a@x", "name": "Ann"});
		let exclude = ExcludeSet::empty();
		assert_eq!(
			fingerprint(&a, &exclude).unwrap(),
			fingerprint(&b, &exclude).unwrap()
		);
	}

	#[test]
	fn excludes_top_level_field() {
		let a = json!({"name": "Ann", "internal_id": "1"});
		let b = json!({"name": "Ann", "internal_id": "2"});
		let exclude = ExcludeSet::new(vec!["internal_id".to_string()]);
		assert_eq!(
			fingerprint(&a, &exclude).unwrap(),
			fingerprint(&b, &exclude).unwrap()
		);
	}

	#[test]
	fn excludes_nested_prefix() {
		let a = json!({"name": "Ann", "meta": {"a": 1, "b": 2}});
		let b = json!({"name": "Ann", "meta": {"a": 9, "b": 9}});
		let exclude = ExcludeSet::new(vec!["meta".to_string()]);
		assert_eq!(
			fingerprint(&a, &exclude).unwrap(),
			fingerprint(&b, &exclude).unwrap()
		);
	}

	#[test]
	fn array_order_is_preserved_not_sorted() {
		let a = json!({"tags": ["b", "a"]});
		let b = json!({"tags": ["a", "b"]});
		let exclude = ExcludeSet::empty();
		assert_ne!(
			fingerprint(&a, &exclude).unwrap(),
			fingerprint(&b, &exclude).unwrap()
		);
	}

	#[test]
	fn differs_on_changed_non_excluded_field() {
		let a = json!({"name": "Ann"});
		let b = json!({"name": "Anne"});
		let exclude = ExcludeSet::empty();
		assert_ne!(
			fingerprint(&a, &exclude).unwrap(),
			fingerprint(&b, &exclude).unwrap()
		);
	}
}
