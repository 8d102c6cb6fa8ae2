use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ctm_config::EmbeddingProviderConfig;

use crate::{EmbeddingProvider, LexicalIndex, Result, VectorIndex};

/// One ranker's ordered output for the condition at `condition_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionRanking {
	pub condition_index: usize,
	pub trial_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedCandidate {
	pub trial_id: String,
	pub score: f64,
	/// Best zero-based rank seen across every (condition, ranker) list.
	pub best_rank: u32,
}

/// Reciprocal-rank fusion with condition decay: a trial at rank `r` in a list for condition `i`
/// gains `1 / (r + k) / (i + 1)`.
///
/// Output is ordered by score, then best rank, then trial id, and holds at most `top_n` trials
/// that appeared in some list.
pub fn fuse(rankings: &[ConditionRanking], k: u32, top_n: usize) -> Vec<FusedCandidate> {
	let mut by_trial: HashMap<&str, FusedCandidate> = HashMap::new();
	let k = k as f64;

	for ranking in rankings {
		let decay = 1.0 / (ranking.condition_index as f64 + 1.0);

		for (rank, trial_id) in ranking.trial_ids.iter().enumerate() {
			let gain = 1.0 / (rank as f64 + k) * decay;
			let entry = by_trial.entry(trial_id.as_str()).or_insert_with(|| FusedCandidate {
				trial_id: trial_id.clone(),
				score: 0.0,
				best_rank: u32::MAX,
			});

			entry.score += gain;
			entry.best_rank = entry.best_rank.min(rank as u32);
		}
	}

	let mut fused = by_trial.into_values().collect::<Vec<_>>();

	fused.sort_by(|left, right| {
		crate::cmp_f64_desc(left.score, right.score)
			.then_with(|| left.best_rank.cmp(&right.best_rank))
			.then_with(|| left.trial_id.cmp(&right.trial_id))
	});
	fused.truncate(top_n);

	fused
}

/// Issues every condition against the enabled rankers and fuses the results.
pub struct HybridFusionRetriever<'a> {
	lexical: &'a LexicalIndex,
	vector: Option<&'a VectorIndex>,
	query_embedding: &'a EmbeddingProviderConfig,
	embedding: &'a dyn EmbeddingProvider,
	fusion_k: u32,
	ranker_depth: usize,
}
impl<'a> HybridFusionRetriever<'a> {
	/// `vector` may be `None` when dense retrieval is disabled for the run.
	pub fn new(
		lexical: &'a LexicalIndex,
		vector: Option<&'a VectorIndex>,
		query_embedding: &'a EmbeddingProviderConfig,
		embedding: &'a dyn EmbeddingProvider,
		fusion_k: u32,
		ranker_depth: u32,
	) -> Self {
		Self {
			lexical,
			vector,
			query_embedding,
			embedding,
			fusion_k,
			ranker_depth: ranker_depth as usize,
		}
	}

	pub async fn retrieve(
		&self,
		patient_id: &str,
		conditions: &[String],
		top_n: usize,
		lexical_weight: f32,
		dense_weight: f32,
	) -> Result<Vec<String>> {
		let fused =
			self.retrieve_scored(patient_id, conditions, top_n, lexical_weight, dense_weight).await?;

		Ok(fused.into_iter().map(|candidate| candidate.trial_id).collect())
	}

	/// Weights gate rankers on or off. A ranker with a weight of zero is never queried.
	pub async fn retrieve_scored(
		&self,
		patient_id: &str,
		conditions: &[String],
		top_n: usize,
		lexical_weight: f32,
		dense_weight: f32,
	) -> Result<Vec<FusedCandidate>> {
		if conditions.is_empty() {
			tracing::debug!(patient_id, "No conditions. Returning an empty candidate set.");

			return Ok(Vec::new());
		}

		let mut rankings = Vec::new();

		if lexical_weight > 0.0 {
			for (condition_index, condition) in conditions.iter().enumerate() {
				let trial_ids = self
					.lexical
					.search(condition, self.ranker_depth)
					.into_iter()
					.map(|(trial_id, _)| trial_id)
					.collect();

				rankings.push(ConditionRanking { condition_index, trial_ids });
			}
		}
		if dense_weight > 0.0 {
			match self.vector {
				Some(vector) => {
					let hits = vector
						.search_texts(self.query_embedding, self.embedding, conditions, self.ranker_depth)
						.await?;

					for (condition_index, hits) in hits.into_iter().enumerate() {
						let trial_ids = hits.into_iter().map(|(trial_id, _)| trial_id).collect();

						rankings.push(ConditionRanking { condition_index, trial_ids });
					}
				},
				None => {
					tracing::warn!(patient_id, "Dense weight is set but no vector index was loaded.");
				},
			}
		}

		let fused = fuse(&rankings, self.fusion_k, top_n);

		tracing::debug!(
			patient_id,
			conditions = conditions.len(),
			rankings = rankings.len(),
			candidates = fused.len(),
			"Fused candidate rankings."
		);

		Ok(fused)
	}
}
