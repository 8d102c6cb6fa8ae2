use serde::Serialize;

use ctm_domain::{CriterionCounts, JudgmentSet, SelfAssessment};
use ctm_storage::KvStore;

use crate::{
	AggregationScorer, MatchScorer, PatientQuery, Result,
	assessment::{self, AssessmentRecord},
	matching::{self, MatchRecord},
};

/// Everything known about one scored (patient, trial) pair. `None` marks a signal that was never
/// computed, as opposed to a zero score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientTrialRecord {
	pub patient_id: String,
	pub trial_id: String,
	pub label: Option<u8>,
	pub inclusion_judgments: Option<JudgmentSet>,
	pub exclusion_judgments: Option<JudgmentSet>,
	pub self_assessment: Option<SelfAssessment>,
	pub malformed_judgments: bool,
	pub malformed_assessment: bool,
}
impl PatientTrialRecord {
	pub fn has_judgments(&self) -> bool {
		self.inclusion_judgments.is_some() || self.exclusion_judgments.is_some()
	}

	pub fn counts(&self) -> CriterionCounts {
		let empty = JudgmentSet::new();

		CriterionCounts::from_judgments(
			self.inclusion_judgments.as_ref().unwrap_or(&empty),
			self.exclusion_judgments.as_ref().unwrap_or(&empty),
		)
	}

	pub fn match_score(&self, scorer: &MatchScorer) -> f64 {
		scorer.score_counts(&self.counts())
	}

	pub fn final_score(&self, scorer: &MatchScorer) -> f64 {
		AggregationScorer::combine(self.match_score(scorer), self.self_assessment.as_ref())
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTrial {
	pub trial_id: String,
	pub score: f64,
	pub label: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedList {
	pub patient_id: String,
	pub ranked: Vec<RankedTrial>,
}
impl RankedList {
	pub fn labels_and_scores(&self) -> Vec<(u8, f64)> {
		self.ranked.iter().map(|trial| (trial.label, trial.score)).collect()
	}
}

/// Counts of substituted defaults, surfaced next to the metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MissingData {
	pub pairs: usize,
	pub missing_judgments: usize,
	pub malformed_judgments: usize,
	pub missing_self_assessment: usize,
	pub malformed_self_assessment: usize,
	pub unlabeled_pairs: usize,
	pub patients_without_candidates: usize,
}
impl MissingData {
	pub fn record(&mut self, record: &PatientTrialRecord) {
		self.pairs += 1;

		if !record.has_judgments() {
			self.missing_judgments += 1;
		}
		if record.malformed_judgments {
			self.malformed_judgments += 1;
		}
		if record.self_assessment.is_none() {
			self.missing_self_assessment += 1;
		}
		if record.malformed_assessment {
			self.malformed_self_assessment += 1;
		}
		if record.label.is_none() {
			self.unlabeled_pairs += 1;
		}
	}
}

/// Joins cached judgments and self-assessments for each candidate, in candidate order.
pub fn build_records(
	patient: &PatientQuery,
	trial_ids: &[String],
	match_store: &dyn KvStore,
	assessment_store: &dyn KvStore,
) -> Result<Vec<PatientTrialRecord>> {
	let mut out = Vec::with_capacity(trial_ids.len());

	for trial_id in trial_ids {
		let label = patient.label(trial_id);
		let match_key = matching::match_key(&patient.patient_id, label.unwrap_or(0), trial_id);
		let judgments = ctm_storage::get_typed::<MatchRecord>(match_store, &match_key)?;
		let assessment = ctm_storage::get_typed::<AssessmentRecord>(
			assessment_store,
			&assessment::assessment_key(&patient.patient_id, trial_id),
		)?;
		let malformed_judgments = judgments.as_ref().is_some_and(MatchRecord::is_malformed);
		let malformed_assessment = assessment.as_ref().is_some_and(|record| record.malformed);
		let (inclusion_judgments, exclusion_judgments) = match judgments {
			Some(record) => (Some(record.inclusion), Some(record.exclusion)),
			None => (None, None),
		};
		let self_assessment = assessment.filter(|record| !record.malformed).map(|record| record.assessment);

		out.push(PatientTrialRecord {
			patient_id: patient.patient_id.clone(),
			trial_id: trial_id.clone(),
			label,
			inclusion_judgments,
			exclusion_judgments,
			self_assessment,
			malformed_judgments,
			malformed_assessment,
		});
	}

	Ok(out)
}

/// Orders records by `score`, best first. Equal scores keep input order. Records scored `None`
/// are left out.
pub fn rank_by<F>(patient_id: &str, records: &[PatientTrialRecord], mut score: F) -> RankedList
where
	F: FnMut(&PatientTrialRecord) -> Option<f64>,
{
	let mut ranked = records
		.iter()
		.filter_map(|record| {
			score(record).map(|value| RankedTrial {
				trial_id: record.trial_id.clone(),
				score: value,
				label: record.label.unwrap_or(0),
			})
		})
		.collect::<Vec<_>>();

	// `sort_by` is stable.
	ranked.sort_by(|left, right| crate::cmp_f64_desc(left.score, right.score));

	RankedList { patient_id: patient_id.to_string(), ranked }
}

pub fn rank(patient_id: &str, records: &[PatientTrialRecord], scorer: &MatchScorer) -> RankedList {
	rank_by(patient_id, records, |record| Some(record.final_score(scorer)))
}
