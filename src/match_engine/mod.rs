//! The match engine: index maintenance plus two-phase candidate generation
//! and rule evaluation. See SPEC_FULL.md §4.4.

use crate::error::MatchError;
use crate::model::{CandidateStatus, MatchCandidate, MatchCondition, MatchFieldRow, MatchRule, MatchType, StagedRecord};
use crate::normalize;
use crate::observability::MetricsRegistry;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

pub mod repo;

pub use repo::MatchRepo;

/// Tunables governing candidate-generation breadth and result thresholds.
/// Defaults match SPEC_FULL.md §4.4.
#[derive(Debug, Clone, Copy)]
pub struct MatchConfig {
	pub candidate_cap_per_rule: usize,
	pub min_match_score: f64,
	pub auto_merge_threshold: f64,
	pub max_candidates: usize,
}

impl Default for MatchConfig {
	fn default() -> Self {
		Self {
			candidate_cap_per_rule: 5000,
			min_match_score: 0.5,
			auto_merge_threshold: 0.95,
			max_candidates: 100,
		}
	}
}

pub struct MatchEngine {
	repo: MatchRepo,
	config: MatchConfig,
	metrics: Arc<MetricsRegistry>,
}

impl MatchEngine {
	pub fn new(pool: PgPool, config: MatchConfig, metrics: Arc<MetricsRegistry>) -> Self {
		Self {
			repo: MatchRepo::new(pool),
			config,
			metrics,
		}
	}

	/// Rebuild the denormalized index rows for `record`, replacing whatever
	/// was there before. SPEC_FULL.md §4.4 "Index maintenance".
	pub async fn index_record(&self, record: &StagedRecord) -> Result<(), MatchError> {
		let rules = self
			.repo
			.active_rules(&record.tenant_id, &record.entity_type)
			.await?;

		// Every condition's field is indexed, no_merge included: Phase B's
		// no-merge veto (`find_blocking_rule`) evaluates against these same
		// index rows, so a no_merge-only field that never got indexed would
		// always read back as a missing value on both sides regardless of
		// what the record actually holds.
		let mut triples: HashSet<(String, MatchType, Option<String>)> = HashSet::new();
		for rule in &rules {
			for cond in &rule.conditions {
				triples.insert((cond.field.clone(), cond.match_type, cond.normalizer.clone()));
			}
		}

		let mut rows = Vec::new();
		for (field, match_type, normalizer) in triples {
			let Some(raw) = lookup_field(&record.payload, &field) else {
				continue;
			};
			if let Some(row) = build_row(record, &field, match_type, normalizer.as_deref(), raw) {
				rows.push(row);
			}
		}

		self.repo.replace_index_rows(record, rows).await
	}

	/// Phase A + Phase B: find and score candidates for `record`.
	/// SPEC_FULL.md §4.4 "Candidate generation + evaluation".
	pub async fn find_matches(
		&self,
		record: &StagedRecord,
	) -> Result<Vec<MatchCandidate>, MatchError> {
		let start = std::time::Instant::now();
		let result = self.find_matches_inner(record).await;
		self.metrics.match_duration_seconds.observe(start.elapsed().as_secs_f64());
		if let Ok(results) = &result {
			self.metrics.match_candidates_total.inc_by(results.len() as u64);
		}
		result
	}

	async fn find_matches_inner(
		&self,
		record: &StagedRecord,
	) -> Result<Vec<MatchCandidate>, MatchError> {
		let rules = self
			.repo
			.active_rules(&record.tenant_id, &record.entity_type)
			.await?;
		if rules.is_empty() {
			return Ok(Vec::new());
		}
		self.metrics.match_rules_evaluated_total.inc_by(rules.len() as u64);

		let source_rows = self
			.repo
			.index_rows_for(&record.tenant_id, record.id)
			.await?;
		let source_by_field: HashMap<&str, &MatchFieldRow> =
			source_rows.iter().map(|r| (r.field_name.as_str(), r)).collect();

		// Phase A: candidate generation, rules as alternatives (union).
		let mut candidate_ids: HashSet<Uuid> = HashSet::new();
		for rule in &rules {
			let ids = self
				.phase_a_candidates(record, rule, &source_by_field)
				.await?;
			candidate_ids.extend(ids);
		}
		candidate_ids.remove(&record.id);

		if candidate_ids.is_empty() {
			return Ok(Vec::new());
		}

		let candidate_rows = self
			.repo
			.index_rows_for_many(&record.tenant_id, &candidate_ids)
			.await?;
		let mut by_candidate: HashMap<Uuid, Vec<&MatchFieldRow>> = HashMap::new();
		for row in &candidate_rows {
			by_candidate
				.entry(row.staged_record_id)
				.or_default()
				.push(row);
		}

		// Phase B: no-merge veto, then weighted scoring; ordered ids give a
		// stable insertion-order tie-break.
		let mut ordered_ids: Vec<Uuid> = candidate_ids.into_iter().collect();
		ordered_ids.sort();

		let mut results = Vec::new();
		for candidate_id in ordered_ids {
			let empty = Vec::new();
			let candidate_fields = by_candidate.get(&candidate_id).unwrap_or(&empty);
			let candidate_by_field: HashMap<&str, &MatchFieldRow> = candidate_fields
				.iter()
				.map(|r| (r.field_name.as_str(), *r))
				.collect();

			if let Some(blocking_rule) =
				find_blocking_rule(&rules, &source_by_field, &candidate_by_field)
			{
				results.push(MatchCandidate {
					id: Uuid::new_v4(),
					staged_record_id: record.id,
					candidate_staged_record_id: candidate_id,
					score: 0.0,
					blocked: true,
					rule_matched: Some(blocking_rule),
					auto_merge: false,
					status: CandidateStatus::Rejected,
				});
				continue;
			}

			let score = rules
				.iter()
				.map(|r| score_rule(r, &source_by_field, &candidate_by_field))
				.fold(0.0_f64, f64::max);

			if score >= self.config.min_match_score {
				let auto_merge = score >= self.config.auto_merge_threshold;
				results.push(MatchCandidate {
					id: Uuid::new_v4(),
					staged_record_id: record.id,
					candidate_staged_record_id: candidate_id,
					score,
					blocked: false,
					rule_matched: None,
					auto_merge,
					status: if auto_merge {
						CandidateStatus::AutoMerged
					} else {
						CandidateStatus::Pending
					},
				});
			}
		}

		results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
		results.truncate(self.config.max_candidates);
		Ok(results)
	}

	async fn phase_a_candidates(
		&self,
		record: &StagedRecord,
		rule: &MatchRule,
		source_by_field: &HashMap<&str, &MatchFieldRow>,
	) -> Result<HashSet<Uuid>, MatchError> {
		let indexable: Vec<&MatchCondition> = rule
			.conditions
			.iter()
			.filter(|c| !c.no_merge && !c.invert)
			.filter(|c| matches!(c.match_type, MatchType::Exact | MatchType::Phonetic))
			.collect();

		let fuzzy: Vec<&MatchCondition> = rule
			.conditions
			.iter()
			.filter(|c| !c.no_merge && !c.invert)
			.filter(|c| matches!(c.match_type, MatchType::Fuzzy))
			.collect();

		if !indexable.is_empty() {
			let mut lookups = Vec::new();
			for cond in &indexable {
				let Some(source_row) = source_by_field.get(cond.field.as_str()) else {
					if cond.required {
						return Ok(HashSet::new());
					}
					continue;
				};
				lookups.push((cond.field.clone(), source_row.token.clone().or(source_row.value_text.clone())));
			}
			if lookups.is_empty() {
				return Ok(HashSet::new());
			}
			return self
				.repo
				.candidates_by_indexable(
					&record.tenant_id,
					&record.entity_type,
					&lookups,
					self.config.candidate_cap_per_rule,
				)
				.await;
		}

		if let Some(anchor) = fuzzy
			.iter()
			.max_by(|a, b| a.threshold_or_default().partial_cmp(&b.threshold_or_default()).unwrap())
		{
			let Some(source_row) = source_by_field.get(anchor.field.as_str()) else {
				return Ok(HashSet::new());
			};
			let Some(text) = &source_row.value_text else {
				return Ok(HashSet::new());
			};
			return self
				.repo
				.candidates_by_fuzzy(
					&record.tenant_id,
					&record.entity_type,
					&anchor.field,
					text,
					anchor.threshold_or_default(),
					self.config.candidate_cap_per_rule,
				)
				.await;
		}

		Ok(HashSet::new())
	}
}

fn lookup_field<'a>(payload: &'a serde_json::Value, dot_path: &str) -> Option<&'a serde_json::Value> {
	let mut current = payload;
	for segment in dot_path.split('.') {
		current = current.get(segment)?;
	}
	if current.is_null() {
		return None;
	}
	Some(current)
}

fn build_row(
	record: &StagedRecord,
	field: &str,
	match_type: MatchType,
	normalizer: Option<&str>,
	raw: &serde_json::Value,
) -> Option<MatchFieldRow> {
	let mut row = MatchFieldRow {
		id: Uuid::new_v4(),
		tenant_id: record.tenant_id.clone(),
		entity_type: record.entity_type.clone(),
		staged_record_id: record.id,
		field_name: field.to_string(),
		match_type: match_type.as_str().to_string(),
		normalizer: normalizer.map(str::to_string),
		value_text: None,
		token: None,
		value_num: None,
		value_ts: None,
	};

	match match_type {
		MatchType::Exact => {
			let s = raw.as_str()?;
			if s.is_empty() {
				return None;
			}
			row.value_text = Some(normalize::normalize_exact(s));
		}
		MatchType::Fuzzy => {
			let s = raw.as_str()?;
			if s.is_empty() {
				return None;
			}
			row.value_text = Some(s.to_string());
		}
		MatchType::Phonetic => {
			let s = raw.as_str()?;
			if s.is_empty() {
				return None;
			}
			row.token = Some(normalize::soundex(s));
		}
		MatchType::Numeric => {
			row.value_num = normalize::normalize_numeric(raw).ok();
			row.value_num?;
		}
		MatchType::DateRange => {
			let s = raw.as_str()?;
			row.value_ts = normalize::normalize_timestamp(s).ok();
			row.value_ts?;
		}
	}
	Some(row)
}

fn condition_pass(
	cond: &MatchCondition,
	source: Option<&&MatchFieldRow>,
	candidate: Option<&&MatchFieldRow>,
) -> (bool, f64) {
	let raw_pass = match cond.match_type {
		MatchType::Exact => match (source, candidate) {
			(Some(s), Some(c)) => s.value_text == c.value_text,
			_ => false,
		},
		MatchType::Phonetic => match (source, candidate) {
			(Some(s), Some(c)) => s.token == c.token,
			_ => false,
		},
		MatchType::Fuzzy => {
			let sim = match (source, candidate) {
				(Some(s), Some(c)) => match (&s.value_text, &c.value_text) {
					(Some(st), Some(ct)) => {
						normalize::trigram_similarity(&normalize::trigrams(st), &normalize::trigrams(ct))
					}
					_ => 0.0,
				},
				_ => 0.0,
			};
			let passes = sim >= cond.threshold_or_default();
			return finish(cond, passes, sim);
		}
		MatchType::Numeric => {
			let sim = match (source, candidate) {
				(Some(s), Some(c)) => match (s.value_num, c.value_num) {
					(Some(a), Some(b)) => normalize::numeric_similarity(a, b, cond.threshold.unwrap_or(0.0)),
					_ => 0.0,
				},
				_ => 0.0,
			};
			let passes = sim > 0.0;
			return finish(cond, passes, sim);
		}
		MatchType::DateRange => {
			let sim = match (source, candidate) {
				(Some(s), Some(c)) => match (s.value_ts, c.value_ts) {
					(Some(a), Some(b)) => {
						normalize::date_range_similarity(a, b, cond.threshold.unwrap_or(0.0) as i64)
					}
					_ => 0.0,
				},
				_ => 0.0,
			};
			let passes = sim > 0.0;
			return finish(cond, passes, sim);
		}
	};
	finish(cond, raw_pass, if raw_pass { 1.0 } else { 0.0 })
}

fn finish(cond: &MatchCondition, raw_pass: bool, similarity: f64) -> (bool, f64) {
	if cond.invert {
		(!raw_pass, 1.0 - similarity)
	} else {
		(raw_pass, similarity)
	}
}

fn find_blocking_rule(
	rules: &[MatchRule],
	source: &HashMap<&str, &MatchFieldRow>,
	candidate: &HashMap<&str, &MatchFieldRow>,
) -> Option<String> {
	for rule in rules {
		for cond in rule.conditions.iter().filter(|c| c.no_merge) {
			let (pass, _) = condition_pass(cond, source.get(cond.field.as_str()), candidate.get(cond.field.as_str()));
			if pass {
				return Some(rule.name.clone());
			}
		}
	}
	None
}

fn score_rule(
	rule: &MatchRule,
	source: &HashMap<&str, &MatchFieldRow>,
	candidate: &HashMap<&str, &MatchFieldRow>,
) -> f64 {
	let scoring: Vec<&MatchCondition> = rule.conditions.iter().filter(|c| !c.no_merge).collect();
	if scoring.is_empty() {
		return 0.0;
	}

	let mut total_weight = 0.0;
	let mut contribution = 0.0;
	for cond in &scoring {
		let (pass, similarity) =
			condition_pass(cond, source.get(cond.field.as_str()), candidate.get(cond.field.as_str()));
		if cond.required && !pass {
			return 0.0;
		}
		total_weight += cond.weight;
		contribution += similarity.max(0.0) * cond.weight;
	}
	if total_weight == 0.0 {
		return 0.0;
	}
	(contribution / total_weight) * rule.score_weight
}

#[cfg(test)]
mod tests {
	use super::*;

	fn field_row(field: &str, value_text: Option<&str>, token: Option<&str>) -> MatchFieldRow {
		MatchFieldRow {
			id: Uuid::new_v4(),
			tenant_id: "t1".to_string(),
			entity_type: "person".to_string(),
			staged_record_id: Uuid::new_v4(),
			field_name: field.to_string(),
			match_type: "exact".to_string(),
			normalizer: None,
			value_text: value_text.map(str::to_string),
			token: token.map(str::to_string),
			value_num: None,
			value_ts: None,
		}
	}

	fn exact_condition(field: &str) -> MatchCondition {
		MatchCondition {
			field: field.to_string(),
			match_type: MatchType::Exact,
			normalizer: None,
			weight: 1.0,
			threshold: None,
			required: false,
			invert: false,
			no_merge: false,
		}
	}

	fn no_merge_condition(field: &str, invert: bool) -> MatchCondition {
		MatchCondition {
			no_merge: true,
			invert,
			..exact_condition(field)
		}
	}

	#[test]
	fn lookup_field_walks_dot_path() {
		let payload = serde_json::json!({"address": {"city": "Denver"}, "empty": null});
		assert_eq!(
			lookup_field(&payload, "address.city").and_then(|v| v.as_str()),
			Some("Denver")
		);
		assert!(lookup_field(&payload, "address.zip").is_none());
		assert!(lookup_field(&payload, "empty").is_none());
	}

	#[test]
	fn condition_pass_exact_requires_both_sides_present() {
		let s = field_row("email", Some("a@example.com"), None);
		let c = field_row("email", Some("a@example.com"), None);
		let cond = exact_condition("email");
		assert_eq!(condition_pass(&cond, Some(&&s), Some(&&c)), (true, 1.0));

		let missing = condition_pass(&cond, None, Some(&&c));
		assert_eq!(missing, (false, 0.0));
	}

	#[test]
	fn finish_inverts_pass_and_similarity() {
		assert_eq!(finish(&exact_condition("f"), true, 1.0), (true, 1.0));
		let inverted = no_merge_condition("f", true);
		assert_eq!(finish(&inverted, true, 1.0), (false, 0.0));
		assert_eq!(finish(&inverted, false, 0.0), (true, 1.0));
	}

	/// Regression test: a no_merge field that no rule ever scores on (only
	/// blocks) must still be indexed so Phase B reads its real value instead
	/// of two missing sides that always compare unequal.
	#[test]
	fn no_merge_inverted_condition_blocks_only_on_real_difference() {
		let rule = MatchRule {
			id: Uuid::new_v4(),
			tenant_id: "t1".to_string(),
			entity_type: "person".to_string(),
			name: "email-match-department-guard".to_string(),
			priority: 0,
			active: true,
			score_weight: 1.0,
			conditions: vec![exact_condition("email"), no_merge_condition("department", true)],
		};

		let source_email = field_row("email", Some("a@example.com"), None);
		let source_dept = field_row("department", Some("sales"), None);
		let mut source: HashMap<&str, &MatchFieldRow> = HashMap::new();
		source.insert("email", &source_email);
		source.insert("department", &source_dept);

		let same_dept_email = field_row("email", Some("a@example.com"), None);
		let same_dept = field_row("department", Some("sales"), None);
		let mut candidate_same: HashMap<&str, &MatchFieldRow> = HashMap::new();
		candidate_same.insert("email", &same_dept_email);
		candidate_same.insert("department", &same_dept);
		assert!(
			find_blocking_rule(std::slice::from_ref(&rule), &source, &candidate_same).is_none(),
			"equal departments must not block"
		);

		let diff_dept_email = field_row("email", Some("a@example.com"), None);
		let diff_dept = field_row("department", Some("ops"), None);
		let mut candidate_diff: HashMap<&str, &MatchFieldRow> = HashMap::new();
		candidate_diff.insert("email", &diff_dept_email);
		candidate_diff.insert("department", &diff_dept);
		assert_eq!(
			find_blocking_rule(std::slice::from_ref(&rule), &source, &candidate_diff),
			Some(rule.name.clone()),
			"differing departments must block"
		);
	}

	#[test]
	fn score_rule_required_condition_failure_yields_zero() {
		let rule = MatchRule {
			id: Uuid::new_v4(),
			tenant_id: "t1".to_string(),
			entity_type: "person".to_string(),
			name: "strict".to_string(),
			priority: 0,
			active: true,
			score_weight: 1.0,
			conditions: vec![MatchCondition {
				required: true,
				..exact_condition("email")
			}],
		};
		let source_row = field_row("email", Some("a@example.com"), None);
		let candidate_row = field_row("email", Some("b@example.com"), None);
		let mut source: HashMap<&str, &MatchFieldRow> = HashMap::new();
		source.insert("email", &source_row);
		let mut candidate: HashMap<&str, &MatchFieldRow> = HashMap::new();
		candidate.insert("email", &candidate_row);

		assert_eq!(score_rule(&rule, &source, &candidate), 0.0);
	}

	#[test]
	fn score_rule_weights_matched_conditions() {
		let rule = MatchRule {
			id: Uuid::new_v4(),
			tenant_id: "t1".to_string(),
			entity_type: "person".to_string(),
			name: "email-and-name".to_string(),
			priority: 0,
			active: true,
			score_weight: 1.0,
			conditions: vec![
				MatchCondition {
					weight: 3.0,
					..exact_condition("email")
				},
				MatchCondition {
					weight: 1.0,
					..exact_condition("name")
				},
			],
		};
		let email = field_row("email", Some("a@example.com"), None);
		let name_mismatch = field_row("name", Some("alice"), None);
		let mut source: HashMap<&str, &MatchFieldRow> = HashMap::new();
		source.insert("email", &email);
		source.insert("name", &name_mismatch);

		let email_c = field_row("email", Some("a@example.com"), None);
		let name_c = field_row("name", Some("alicia"), None);
		let mut candidate: HashMap<&str, &MatchFieldRow> = HashMap::new();
		candidate.insert("email", &email_c);
		candidate.insert("name", &name_c);

		// email matches (weight 3), name doesn't (weight 1): 3/4 * score_weight.
		assert_eq!(score_rule(&rule, &source, &candidate), 0.75);
	}
}
