use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ctm_storage::KvStore;

use crate::{
	ConditionGenerator, OracleError, PatientQuery, Result,
	matching::StageReport,
	oracle::GeneratedConditions,
	throttle::RateLimiter,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionRecord {
	pub summary: Option<String>,
	pub conditions: Vec<String>,
	#[serde(default)]
	pub malformed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionSource {
	Supplied,
	Generated,
	RawNote,
}

/// Picks the condition list for each patient: a supplied list first, then a generated one when
/// a generator is configured, else the note itself as the only condition.
pub struct ConditionStage<'a> {
	generator: Option<&'a dyn ConditionGenerator>,
	store: &'a dyn KvStore,
	max_conditions: usize,
}
impl<'a> ConditionStage<'a> {
	pub fn new(
		generator: Option<&'a dyn ConditionGenerator>,
		store: &'a dyn KvStore,
		max_conditions: u32,
	) -> Self {
		Self { generator, store, max_conditions: max_conditions as usize }
	}

	/// Patients whose generation failed with a retryable error are left out of the result.
	pub async fn run(
		&self,
		limiter: &mut RateLimiter,
		patients: &[PatientQuery],
		supplied: &BTreeMap<String, Vec<String>>,
	) -> Result<(BTreeMap<String, (ConditionSource, Vec<String>)>, StageReport)> {
		let mut out = BTreeMap::new();
		let mut report = StageReport::default();

		for patient in patients {
			let patient_id = patient.patient_id.clone();

			if let Some(list) = supplied.get(&patient_id) {
				out.insert(patient_id, (ConditionSource::Supplied, list.clone()));

				continue;
			}

			let Some(generator) = self.generator else {
				out.insert(patient_id, (ConditionSource::RawNote, vec![patient.note_text.clone()]));

				continue;
			};

			if let Some(record) = ctm_storage::get_typed::<ConditionRecord>(self.store, &patient_id)? {
				report.cached += 1;

				out.insert(patient_id, (ConditionSource::Generated, record.conditions));

				continue;
			}

			limiter.acquire().await;

			let record = match generator.generate(&patient.note_text, self.max_conditions).await {
				Ok(GeneratedConditions { summary, conditions }) =>
					ConditionRecord { summary, conditions, malformed: false },
				Err(err @ OracleError::Malformed { .. }) => {
					tracing::warn!(patient_id = %patient_id, error = %err, "Storing empty condition list.");

					report.malformed += 1;

					ConditionRecord { malformed: true, ..ConditionRecord::default() }
				},
				Err(err @ OracleError::Retryable { .. }) => {
					tracing::warn!(
						patient_id = %patient_id,
						error = %err,
						"Skipping condition generation until the next run."
					);

					report.retryable += 1;

					continue;
				},
				Err(err @ OracleError::Fatal { .. }) => {
					tracing::error!(patient_id = %patient_id, error = %err, "Aborting condition generation.");

					return Err(err.into());
				},
			};

			ctm_storage::insert_typed(self.store, &patient_id, &record)?;

			report.completed += 1;

			out.insert(patient_id, (ConditionSource::Generated, record.conditions));
		}

		Ok((out, report))
	}
}
