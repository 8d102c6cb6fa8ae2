use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ctm_domain::{PatientNote, SelfAssessment};
use ctm_storage::KvStore;

use crate::{
	Corpus, EligibilityOracle, OracleError, PatientQuery, Result,
	matching::{self, MatchRecord, StageReport},
	throttle::RateLimiter,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentRecord {
	pub assessment: SelfAssessment,
	#[serde(default)]
	pub malformed: bool,
}

pub fn assessment_key(patient_id: &str, trial_id: &str) -> String {
	format!("{patient_id}/{trial_id}")
}

/// Asks for a self-assessment of every candidate pair that already has criterion judgments.
pub struct AssessmentStage<'a> {
	oracle: &'a dyn EligibilityOracle,
	match_store: &'a dyn KvStore,
	store: &'a dyn KvStore,
}
impl<'a> AssessmentStage<'a> {
	pub fn new(
		oracle: &'a dyn EligibilityOracle,
		match_store: &'a dyn KvStore,
		store: &'a dyn KvStore,
	) -> Self {
		Self { oracle, match_store, store }
	}

	pub async fn run(
		&self,
		limiter: &mut RateLimiter,
		corpus: &Corpus,
		patients: &[PatientQuery],
		candidates: &BTreeMap<String, Vec<String>>,
	) -> Result<StageReport> {
		let mut report = StageReport::default();

		for patient in patients {
			let Some(trial_ids) = candidates.get(&patient.patient_id) else { continue };
			let note = PatientNote::from_text(&patient.note_text);

			for trial_id in trial_ids {
				let key = assessment_key(&patient.patient_id, trial_id);

				if self.store.contains(&key)? {
					report.cached += 1;

					continue;
				}

				let match_key =
					matching::match_key(&patient.patient_id, patient.label(trial_id).unwrap_or(0), trial_id);
				let (Some(trial), Some(judgments)) = (
					corpus.get(trial_id),
					ctm_storage::get_typed::<MatchRecord>(self.match_store, &match_key)?,
				) else {
					report.missing += 1;

					continue;
				};

				limiter.acquire().await;

				let record = match self
					.oracle
					.assess(&note, trial, &judgments.inclusion, &judgments.exclusion)
					.await
				{
					Ok(assessment) => AssessmentRecord { assessment, malformed: false },
					Err(err @ OracleError::Malformed { .. }) => {
						tracing::warn!(
							patient_id = %patient.patient_id,
							trial_id = %trial_id,
							error = %err,
							"Storing empty self-assessment for malformed reply."
						);

						report.malformed += 1;

						AssessmentRecord { assessment: SelfAssessment::default(), malformed: true }
					},
					Err(err @ OracleError::Retryable { .. }) => {
						tracing::warn!(
							patient_id = %patient.patient_id,
							trial_id = %trial_id,
							error = %err,
							"Skipping self-assessment until the next run."
						);

						report.retryable += 1;

						continue;
					},
					Err(err @ OracleError::Fatal { .. }) => {
						tracing::error!(
							patient_id = %patient.patient_id,
							trial_id = %trial_id,
							error = %err,
							"Aborting self-assessment."
						);

						return Err(err.into());
					},
				};

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
			"Self-assessment finished."
		);

		Ok(report)
	}
}
