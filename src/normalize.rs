//! Field normalizers and similarity functions used by the match engine.
//!
//! Each normalizer turns a raw JSON field value into the representation
//! stored in a [`crate::model::MatchFieldRow`], and/or compares two such
//! representations. See SPEC_FULL.md §4.4 "Normalizer & similarity
//! semantics".
//!
//! No crate in the surrounding example corpus offers phonetic or trigram
//! similarity, so both are hand-rolled here rather than pulled in from an
//! invented dependency.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NormalizeError {
	#[error("field value is not a string")]
	NotAString,
	#[error("field value is not numeric")]
	NotANumber,
	#[error("could not parse timestamp: {0}")]
	BadTimestamp(String),
}

/// Unicode-lowercase, trim leading/trailing whitespace.
pub fn normalize_exact(value: &str) -> String {
	value.trim().to_lowercase()
}

/// Collapse internal whitespace and lowercase, in preparation for shingling
/// or phonetic encoding.
fn normalize_for_fuzzy(value: &str) -> String {
	let lower = value.trim().to_lowercase();
	let mut out = String::with_capacity(lower.len());
	let mut last_was_space = false;
	for c in lower.chars() {
		if c.is_whitespace() {
			if !last_was_space {
				out.push(' ');
			}
			last_was_space = true;
		} else {
			out.push(c);
			last_was_space = false;
		}
	}
	out
}

/// The set of 3-character shingles of `value`, after fuzzy normalization.
/// Mirrors the shingling Postgres's `pg_trgm` extension performs, so index
/// rows and lookup queries build shingles identically.
pub fn trigrams(value: &str) -> HashSet<String> {
	let normalized = normalize_for_fuzzy(value);
	let chars: Vec<char> = normalized.chars().collect();
	if chars.len() < 3 {
		let mut set = HashSet::new();
		if !normalized.is_empty() {
			set.insert(normalized);
		}
		return set;
	}
	chars
		.windows(3)
		.map(|w| w.iter().collect::<String>())
		.collect()
}

/// Dice/Sørensen coefficient between two trigram sets:
/// `2 * |A ∩ B| / (|A| + |B|)`.
pub fn trigram_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
	if a.is_empty() && b.is_empty() {
		return 1.0;
	}
	if a.is_empty() || b.is_empty() {
		return 0.0;
	}
	let intersection = a.intersection(b).count() as f64;
	2.0 * intersection / (a.len() + b.len()) as f64
}

/// American Soundex: first letter retained, followed by three digits coding
/// the subsequent consonant groups (vowels and h/w/y dropped, adjacent
/// duplicates collapsed), zero-padded to length 4.
pub fn soundex(value: &str) -> String {
	let cleaned: Vec<char> = value.chars().filter(|c| c.is_alphabetic()).collect();
	if cleaned.is_empty() {
		return "0000".to_string();
	}

	fn code(c: char) -> Option<char> {
		match c.to_ascii_lowercase() {
			'b' | 'f' | 'p' | 'v' => Some('1'),
			'c' | 'g' | 'j' | 'k' | 'q' | 's' | 'x' | 'z' => Some('2'),
			'd' | 't' => Some('3'),
			'l' => Some('4'),
			'm' | 'n' => Some('5'),
			'r' => Some('6'),
			_ => None,
		}
	}

	let first = cleaned[0].to_ascii_uppercase();
	let mut digits = String::new();
	let mut last_code = code(cleaned[0]);

	for &c in &cleaned[1..] {
		let this_code = code(c);
		if this_code.is_some() && this_code != last_code {
			digits.push(this_code.unwrap());
		}
		if !matches!(c.to_ascii_lowercase(), 'h' | 'w') {
			last_code = this_code;
		}
		if digits.len() == 3 {
			break;
		}
	}

	while digits.len() < 3 {
		digits.push('0');
	}

	format!("{first}{digits}")
}

/// Parse a numeric field value from JSON (number or numeric string).
pub fn normalize_numeric(value: &serde_json::Value) -> Result<f64, NormalizeError> {
	match value {
		serde_json::Value::Number(n) => n.as_f64().ok_or(NormalizeError::NotANumber),
		serde_json::Value::String(s) => s.trim().parse::<f64>().map_err(|_| NormalizeError::NotANumber),
		_ => Err(NormalizeError::NotANumber),
	}
}

/// Similarity for numeric values given an absolute tolerance band. `0.0`
/// tolerance means exact-match semantics (1.0 if equal, else 0.0); a wider
/// band decays linearly to 0 at `tolerance` away from equal.
pub fn numeric_similarity(a: f64, b: f64, tolerance: f64) -> f64 {
	let diff = (a - b).abs();
	if tolerance <= 0.0 {
		return if diff == 0.0 { 1.0 } else { 0.0 };
	}
	(1.0 - diff / tolerance).clamp(0.0, 1.0)
}

const COMMON_TIMESTAMP_FORMATS: &[&str] = &[
	"%Y-%m-%dT%H:%M:%S%.f",
	"%Y-%m-%d %H:%M:%S",
	"%Y-%m-%d",
	"%m/%d/%Y",
];

/// Parse a timestamp field value, trying RFC 3339 first, then a small set
/// of common fallback formats.
pub fn normalize_timestamp(value: &str) -> Result<DateTime<Utc>, NormalizeError> {
	if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
		return Ok(dt.with_timezone(&Utc));
	}
	for fmt in COMMON_TIMESTAMP_FORMATS {
		if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
			return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
		}
		if let Ok(date) = chrono::NaiveDate::parse_from_str(value, fmt) {
			let naive = date.and_hms_opt(0, 0, 0).unwrap();
			return Ok(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
		}
	}
	Err(NormalizeError::BadTimestamp(value.to_string()))
}

/// Similarity for timestamps given a window in seconds. `0` window means
/// exact-match semantics.
pub fn date_range_similarity(a: DateTime<Utc>, b: DateTime<Utc>, window_secs: i64) -> f64 {
	let diff = (a - b).num_seconds().abs();
	if window_secs <= 0 {
		return if diff == 0 { 1.0 } else { 0.0 };
	}
	(1.0 - diff as f64 / window_secs as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_trims_and_lowercases() {
		assert_eq!(normalize_exact("  Ann Smith  "), "ann smith");
	}

	#[test]
	fn trigram_similarity_identical_strings_is_one() {
		let a = trigrams("robert");
		let b = trigrams("robert");
		assert_eq!(trigram_similarity(&a, &b), 1.0);
	}

	#[test]
	fn trigram_similarity_detects_typo_closeness() {
		let a = trigrams("robert");
		let b = trigrams("robbert");
		let sim = trigram_similarity(&a, &b);
		assert!(sim > 0.4 && sim < 1.0, "sim was {sim}");
	}

	#[test]
	fn soundex_classic_examples() {
		assert_eq!(soundex("Robert"), "R163");
		assert_eq!(soundex("Rupert"), "R163");
		assert_eq!(soundex("Ashcraft"), "A261");
	}

	#[test]
	fn soundex_empty_input() {
		assert_eq!(soundex(""), "0000");
	}

	#[test]
	fn numeric_similarity_exact_band() {
		assert_eq!(numeric_similarity(5.0, 5.0, 0.0), 1.0);
		assert_eq!(numeric_similarity(5.0, 5.1, 0.0), 0.0);
	}

	#[test]
	fn numeric_similarity_decays_within_band() {
		assert_eq!(numeric_similarity(5.0, 5.5, 1.0), 0.5);
	}

	#[test]
	fn timestamp_parses_rfc3339_and_fallback() {
		assert!(normalize_timestamp("2024-01-01T00:00:00Z").is_ok());
		assert!(normalize_timestamp("2024-01-01").is_ok());
		assert!(normalize_timestamp("not-a-date").is_err());
	}
}
