use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use ctm_storage::KvStore;

use crate::{
	FusedCandidate, HybridFusionRetriever, PatientQuery, Result, matching::StageReport,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
	pub conditions: Vec<String>,
	pub candidates: Vec<FusedCandidate>,
}
impl CandidateRecord {
	pub fn trial_ids(&self) -> Vec<String> {
		self.candidates.iter().map(|candidate| candidate.trial_id.clone()).collect()
	}
}

/// Share of a patient's relevant trials present in a candidate list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Recall {
	/// Retrieved positives over all positives. `None` when the patient has no positive label.
	pub recall: Option<f64>,
	/// Retrieved label mass over total label mass.
	pub weighted_recall: Option<f64>,
}

pub fn recall(patient: &PatientQuery, trial_ids: &[String]) -> Recall {
	let retrieved = trial_ids.iter().map(String::as_str).collect::<HashSet<_>>();
	let mut positives = 0_u32;
	let mut hits = 0_u32;
	let mut mass = 0_u32;
	let mut hit_mass = 0_u32;

	for (trial_id, label) in patient.positives() {
		positives += 1;
		mass += label as u32;

		if retrieved.contains(trial_id) {
			hits += 1;
			hit_mass += label as u32;
		}
	}

	if positives == 0 {
		return Recall::default();
	}

	Recall {
		recall: Some(hits as f64 / positives as f64),
		weighted_recall: Some(hit_mass as f64 / mass as f64),
	}
}

/// Mean of the defined values, or `None` when nothing is defined.
pub fn mean_recall<'a>(values: impl IntoIterator<Item = &'a Recall>) -> Recall {
	let mut recall = Vec::new();
	let mut weighted = Vec::new();

	for value in values {
		recall.extend(value.recall);
		weighted.extend(value.weighted_recall);
	}

	let mean = |values: &[f64]| {
		(!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
	};

	Recall { recall: mean(&recall), weighted_recall: mean(&weighted) }
}

pub struct RetrievalStage<'a> {
	retriever: &'a HybridFusionRetriever<'a>,
	store: &'a dyn KvStore,
	candidate_limit: usize,
	lexical_weight: f32,
	dense_weight: f32,
}
impl<'a> RetrievalStage<'a> {
	pub fn new(
		retriever: &'a HybridFusionRetriever<'a>,
		store: &'a dyn KvStore,
		candidate_limit: u32,
		lexical_weight: f32,
		dense_weight: f32,
	) -> Self {
		Self { retriever, store, candidate_limit: candidate_limit as usize, lexical_weight, dense_weight }
	}

	/// Retrieves and persists candidates for every patient with conditions and no cached list.
	pub async fn run(
		&self,
		patients: &[PatientQuery],
		conditions: &BTreeMap<String, Vec<String>>,
	) -> Result<StageReport> {
		let mut report = StageReport::default();
		let mut recalls = Vec::new();

		for patient in patients {
			let patient_id = patient.patient_id.as_str();

			if let Some(record) = ctm_storage::get_typed::<CandidateRecord>(self.store, patient_id)? {
				recalls.push(recall(patient, &record.trial_ids()));

				report.cached += 1;

				continue;
			}

			let Some(conditions) = conditions.get(patient_id) else {
				report.missing += 1;

				continue;
			};
			let candidates = match self
				.retriever
				.retrieve_scored(
					patient_id,
					conditions,
					self.candidate_limit,
					self.lexical_weight,
					self.dense_weight,
				)
				.await
			{
				Ok(candidates) => candidates,
				Err(err) => {
					tracing::warn!(patient_id, error = %err, "Retrieval failed. Skipping patient.");

					report.retryable += 1;

					continue;
				},
			};
			let record = CandidateRecord { conditions: conditions.clone(), candidates };
			let patient_recall = recall(patient, &record.trial_ids());

			tracing::info!(
				patient_id,
				candidates = record.candidates.len(),
				recall = ?patient_recall.recall,
				weighted_recall = ?patient_recall.weighted_recall,
				"Retrieved candidates."
			);

			ctm_storage::insert_typed(self.store, patient_id, &record)?;

			recalls.push(patient_recall);

			report.completed += 1;
		}

		let mean = mean_recall(&recalls);

		tracing::info!(
			cached = report.cached,
			completed = report.completed,
			retryable = report.retryable,
			missing = report.missing,
			recall = ?mean.recall,
			weighted_recall = ?mean.weighted_recall,
			"Candidate retrieval finished."
		);

		Ok(report)
	}
}
