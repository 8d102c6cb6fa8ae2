use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ctm_domain::{CriterionCounts, CriterionGroup, JudgmentSet, PatientNote, Trial};
use ctm_storage::KvStore;

use crate::{
	Corpus, EligibilityOracle, OracleError, PatientQuery, Result, throttle::RateLimiter,
};

/// Criterion-level judgments for one (patient, trial) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
	pub inclusion: JudgmentSet,
	pub exclusion: JudgmentSet,
	/// Groups whose oracle reply could not be parsed and were stored empty.
	#[serde(default)]
	pub malformed: Vec<CriterionGroup>,
}
impl MatchRecord {
	pub fn counts(&self) -> CriterionCounts {
		CriterionCounts::from_judgments(&self.inclusion, &self.exclusion)
	}

	pub fn is_malformed(&self) -> bool {
		!self.malformed.is_empty()
	}
}

/// Progress of one resumable stage run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
	/// Units found in the cache and skipped.
	pub cached: usize,
	/// Units computed and persisted by this run.
	pub completed: usize,
	/// Persisted units whose oracle reply was malformed.
	pub malformed: usize,
	/// Units left uncached after a retryable failure.
	pub retryable: usize,
	/// Units that could not start because an input was missing.
	pub missing: usize,
}

pub fn match_key(patient_id: &str, label: u8, trial_id: &str) -> String {
	format!("{patient_id}/{label}/{trial_id}")
}

pub struct MatchingStage<'a> {
	oracle: &'a dyn EligibilityOracle,
	store: &'a dyn KvStore,
	criterion_min_chars: usize,
}
impl<'a> MatchingStage<'a> {
	pub fn new(
		oracle: &'a dyn EligibilityOracle,
		store: &'a dyn KvStore,
		criterion_min_chars: u32,
	) -> Self {
		Self { oracle, store, criterion_min_chars: criterion_min_chars as usize }
	}

	/// Judges every candidate pair not yet cached. Each pair is persisted as soon as both
	/// criterion groups have an answer.
	pub async fn run(
		&self,
		limiter: &mut RateLimiter,
		corpus: &Corpus,
		patients: &[PatientQuery],
		candidates: &BTreeMap<String, Vec<String>>,
	) -> Result<StageReport> {
		let mut report = StageReport::default();

		for patient in patients {
			let Some(trial_ids) = candidates.get(&patient.patient_id) else {
				tracing::debug!(patient_id = %patient.patient_id, "No candidates. Skipping patient.");

				continue;
			};
			let note = PatientNote::from_text(&patient.note_text);

			for trial_id in trial_ids {
				let key = match_key(&patient.patient_id, patient.label(trial_id).unwrap_or(0), trial_id);

				if self.store.contains(&key)? {
					report.cached += 1;

					continue;
				}

				let Some(trial) = corpus.get(trial_id) else {
					tracing::warn!(
						patient_id = %patient.patient_id,
						trial_id = %trial_id,
						"Candidate trial is not in the corpus."
					);

					report.missing += 1;

					continue;
				};
				let Some(record) = self.match_pair(limiter, &patient.patient_id, &note, trial).await?
				else {
					report.retryable += 1;

					continue;
				};

				if record.is_malformed() {
					report.malformed += 1;
				}

				ctm_storage::insert_typed(self.store, &key, &record)?;

				report.completed += 1;
			}
		}

		tracing::info!(
			cached = report.cached,
			completed = report.completed,
			malformed = report.malformed,
			retryable = report.retryable,
			missing = report.missing,
			"Criterion matching finished."
		);

		Ok(report)
	}

	/// `None` when a call failed in a way worth retrying on the next run. Rejected requests
	/// abort the stage.
	pub async fn match_pair(
		&self,
		limiter: &mut RateLimiter,
		patient_id: &str,
		note: &PatientNote,
		trial: &Trial,
	) -> Result<Option<MatchRecord>> {
		let mut record = MatchRecord::default();

		for group in CriterionGroup::ALL {
			let criteria = trial.criteria(group, self.criterion_min_chars);

			if criteria.is_empty() {
				continue;
			}

			limiter.acquire().await;

			let judgments = match self.oracle.judge(note, trial, group, &criteria).await {
				Ok(judgments) => judgments,
				Err(err @ OracleError::Malformed { .. }) => {
					tracing::warn!(
						patient_id,
						trial_id = %trial.id,
						group = %group,
						error = %err,
						"Storing empty judgments for malformed reply."
					);

					record.malformed.push(group);

					JudgmentSet::new()
				},
				Err(err @ OracleError::Retryable { .. }) => {
					tracing::warn!(
						patient_id,
						trial_id = %trial.id,
						group = %group,
						error = %err,
						"Skipping pair until the next run."
					);

					return Ok(None);
				},
				Err(err @ OracleError::Fatal { .. }) => {
					tracing::error!(
						patient_id,
						trial_id = %trial.id,
						group = %group,
						error = %err,
						"Aborting criterion matching."
					);

					return Err(err.into());
				},
			};

			match group {
				CriterionGroup::Inclusion => record.inclusion = judgments,
				CriterionGroup::Exclusion => record.exclusion = judgments,
			}
		}

		Ok(Some(record))
	}
}
