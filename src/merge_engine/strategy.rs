//! Field-level merge strategies. Generalizes the teacher's entity-level
//! `MergeStrategy`/`MergeRule` registry (`src/sync/merge.rs`) to per-field
//! strategies reducing a list of sourced values to one. See SPEC_FULL.md §9
//! "Field-merge strategies" and §4.5 step 4.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldStrategy {
	MostRecent,
	MostTrusted,
	LongestString,
	HighestNumber,
	CollectAll,
	PreferNonEmpty,
	CustomPriority,
}

impl FieldStrategy {
	/// Unknown strategy names fall back to `prefer_non_empty`, per spec.
	pub fn from_name(name: &str) -> Self {
		match name {
			"most_recent" => FieldStrategy::MostRecent,
			"most_trusted" => FieldStrategy::MostTrusted,
			"longest_string" => FieldStrategy::LongestString,
			"highest_number" => FieldStrategy::HighestNumber,
			"collect_all" => FieldStrategy::CollectAll,
			"custom_priority" => FieldStrategy::CustomPriority,
			_ => FieldStrategy::PreferNonEmpty,
		}
	}
}

/// One sourced value contributing to a field merge.
#[derive(Debug, Clone)]
pub struct SourcedValue {
	pub value: Value,
	pub updated_at: DateTime<Utc>,
	pub integration: String,
	pub staged_id: Uuid,
}

/// A record of a field where multiple competing non-equal values existed.
#[derive(Debug, Clone, Serialize)]
pub struct MergeConflict {
	pub field: String,
	pub chosen: Value,
	pub losing: Vec<Value>,
	pub strategy: FieldStrategy,
}

/// Reduce `values` (already filtered to non-null) using `strategy`. Returns
/// the chosen value and, if other distinct values competed, a conflict
/// record.
pub fn merge_field(
	field: &str,
	strategy: FieldStrategy,
	custom_priority: &HashMap<String, i32>,
	values: &[SourcedValue],
) -> Option<(Value, Option<MergeConflict>)> {
	if values.is_empty() {
		return None;
	}
	if values.len() == 1 {
		return Some((values[0].value.clone(), None));
	}

	let chosen_idx = match strategy {
		FieldStrategy::MostRecent => values
			.iter()
			.enumerate()
			.max_by_key(|(_, v)| v.updated_at)
			.map(|(i, _)| i)
			.unwrap(),
		FieldStrategy::MostTrusted => values
			.iter()
			.enumerate()
			.max_by(|(_, a), (_, b)| {
				let pa = custom_priority.get(&a.integration).copied().unwrap_or(0);
				let pb = custom_priority.get(&b.integration).copied().unwrap_or(0);
				pa.cmp(&pb).then(a.updated_at.cmp(&b.updated_at))
			})
			.map(|(i, _)| i)
			.unwrap(),
		FieldStrategy::CustomPriority => values
			.iter()
			.enumerate()
			.max_by_key(|(_, v)| custom_priority.get(&v.integration).copied().unwrap_or(0))
			.map(|(i, _)| i)
			.unwrap(),
		FieldStrategy::LongestString => values
			.iter()
			.enumerate()
			.max_by_key(|(_, v)| v.value.as_str().map(str::len).unwrap_or(0))
			.map(|(i, _)| i)
			.unwrap(),
		FieldStrategy::HighestNumber => values
			.iter()
			.enumerate()
			.max_by(|(_, a), (_, b)| {
				let na = a.value.as_f64().unwrap_or(f64::MIN);
				let nb = b.value.as_f64().unwrap_or(f64::MIN);
				na.partial_cmp(&nb).unwrap()
			})
			.map(|(i, _)| i)
			.unwrap(),
		FieldStrategy::CollectAll => {
			let mut seen = Vec::new();
			for v in values {
				if !seen.contains(&v.value) {
					seen.push(v.value.clone());
				}
			}
			return Some((Value::Array(seen), None));
		}
		FieldStrategy::PreferNonEmpty => values
			.iter()
			.position(|v| !is_empty(&v.value))
			.unwrap_or(0),
	};

	let chosen = values[chosen_idx].value.clone();
	let losing: Vec<Value> = values
		.iter()
		.enumerate()
		.filter(|(i, v)| *i != chosen_idx && v.value != chosen)
		.map(|(_, v)| v.value.clone())
		.collect();

	let conflict = if losing.is_empty() {
		None
	} else {
		Some(MergeConflict {
			field: field.to_string(),
			chosen: chosen.clone(),
			losing,
			strategy,
		})
	};
	Some((chosen, conflict))
}

fn is_empty(value: &Value) -> bool {
	match value {
		Value::Null => true,
		Value::String(s) => s.is_empty(),
		Value::Array(a) => a.is_empty(),
		Value::Object(o) => o.is_empty(),
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn v(value: Value, secs: i64, integration: &str) -> SourcedValue {
		SourcedValue {
			value,
			updated_at: DateTime::from_timestamp(secs, 0).unwrap(),
			integration: integration.to_string(),
			staged_id: Uuid::new_v4(),
		}
	}

	#[test]
	fn most_recent_picks_latest() {
		let values = vec![v(json!("old"), 1, "a"), v(json!("new"), 2, "b")];
		let (chosen, conflict) = merge_field("name", FieldStrategy::MostRecent, &HashMap::new(), &values).unwrap();
		assert_eq!(chosen, json!("new"));
		assert!(conflict.is_some());
	}

	#[test]
	fn most_trusted_uses_priority_map() {
		let mut priority = HashMap::new();
		priority.insert("crm".to_string(), 10);
		priority.insert("scraper".to_string(), 1);
		let values = vec![v(json!("scraped"), 5, "scraper"), v(json!("verified"), 1, "crm")];
		let (chosen, _) = merge_field("name", FieldStrategy::MostTrusted, &priority, &values).unwrap();
		assert_eq!(chosen, json!("verified"));
	}

	#[test]
	fn longest_string_wins() {
		let values = vec![v(json!("Ann"), 1, "a"), v(json!("Ann Smith"), 1, "b")];
		let (chosen, _) = merge_field("name", FieldStrategy::LongestString, &HashMap::new(), &values).unwrap();
		assert_eq!(chosen, json!("Ann Smith"));
	}

	#[test]
	fn collect_all_dedupes_preserving_order() {
		let values = vec![v(json!("a"), 1, "x"), v(json!("b"), 2, "y"), v(json!("a"), 3, "z")];
		let (chosen, conflict) = merge_field("tags", FieldStrategy::CollectAll, &HashMap::new(), &values).unwrap();
		assert_eq!(chosen, json!(["a", "b"]));
		assert!(conflict.is_none());
	}

	#[test]
	fn prefer_non_empty_skips_blanks() {
		let values = vec![v(json!(""), 1, "a"), v(json!("Ann"), 2, "b")];
		let (chosen, _) = merge_field("name", FieldStrategy::PreferNonEmpty, &HashMap::new(), &values).unwrap();
		assert_eq!(chosen, json!("Ann"));
	}

	#[test]
	fn unknown_strategy_name_falls_back_to_prefer_non_empty() {
		assert_eq!(FieldStrategy::from_name("whatever"), FieldStrategy::PreferNonEmpty);
	}
}
