//! The dynamic to-side predicate DSL for [`super::StagedRelationshipCriteria`].
//! See SPEC_FULL.md §9 "Dynamic predicates (criteria)".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriteriaOp {
	Eq,
	Contains,
	In,
	Gt,
	Gte,
	Lt,
	Lte,
	Ne,
	Exists,
}

/// A single predicate over a dot-path field. `Criteria::And` combines many.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Criteria {
	Field {
		path: String,
		op: CriteriaOp,
		value: Value,
	},
	And(Vec<Criteria>),
}

impl Criteria {
	/// Evaluate this criteria against a candidate record's payload.
	pub fn matches(&self, payload: &Value) -> bool {
		match self {
			Criteria::Field { path, op, value } => {
				let found = lookup_path(payload, path);
				eval_op(*op, found, value)
			}
			Criteria::And(parts) => parts.iter().all(|c| c.matches(payload)),
		}
	}
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
	let mut current = value;
	for segment in path.split('.') {
		current = current.get(segment)?;
	}
	Some(current)
}

fn eval_op(op: CriteriaOp, found: Option<&Value>, expected: &Value) -> bool {
	match op {
		CriteriaOp::Exists => found.is_some() && !found.unwrap().is_null(),
		CriteriaOp::Eq => found == Some(expected),
		CriteriaOp::Ne => found != Some(expected),
		CriteriaOp::Contains => match (found, expected) {
			(Some(Value::Array(arr)), _) => arr.contains(expected),
			(Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
			_ => false,
		},
		CriteriaOp::In => match expected {
			Value::Array(options) => found.is_some_and(|f| options.contains(f)),
			_ => false,
		},
		CriteriaOp::Gt | CriteriaOp::Gte | CriteriaOp::Lt | CriteriaOp::Lte => {
			match (found.and_then(Value::as_f64), expected.as_f64()) {
				(Some(a), Some(b)) => match op {
					CriteriaOp::Gt => a > b,
					CriteriaOp::Gte => a >= b,
					CriteriaOp::Lt => a < b,
					CriteriaOp::Lte => a <= b,
					_ => unreachable!(),
				},
				_ => false,
			}
		}
	}
}

/// SHA-256 hex digest of `value`'s canonical JSON encoding, used directly
/// where a plain content hash (not fingerprint-exclusion-aware) is wanted.
pub fn hash_value(value: &Value) -> String {
	let bytes = serde_json::to_vec(value).unwrap_or_default();
	let mut hasher = Sha256::new();
	hasher.update(&bytes);
	let digest = hasher.finalize();
	digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn eq_matches_nested_field() {
		let c = Criteria::Field {
			path: "org.id".to_string(),
			op: CriteriaOp::Eq,
			value: json!("acme"),
		};
		assert!(c.matches(&json!({"org": {"id": "acme"}})));
		assert!(!c.matches(&json!({"org": {"id": "other"}})));
	}

	#[test]
	fn and_requires_all() {
		let c = Criteria::And(vec![
			Criteria::Field {
				path: "status".to_string(),
				op: CriteriaOp::Eq,
				value: json!("active"),
			},
			Criteria::Field {
				path: "tier".to_string(),
				op: CriteriaOp::Gte,
				value: json!(2),
			},
		]);
		assert!(c.matches(&json!({"status": "active", "tier": 3})));
		assert!(!c.matches(&json!({"status": "active", "tier": 1})));
	}

	#[test]
	fn contains_on_array() {
		let c = Criteria::Field {
			path: "tags".to_string(),
			op: CriteriaOp::Contains,
			value: json!("vip"),
		};
		assert!(c.matches(&json!({"tags": ["vip", "east"]})));
	}
}
