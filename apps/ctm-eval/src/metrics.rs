use serde::Serialize;

use ctm_service::cmp_f64_desc;

/// Ranking quality for one patient. `auc` is `None` when the positive trials all share one label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PatientMetrics {
	pub ndcg: f64,
	pub precision: f64,
	pub mrr: f64,
	pub auc: Option<f64>,
}

/// Per-patient metrics averaged over the patients that could be evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CohortMetrics {
	pub ndcg: Option<f64>,
	pub precision: Option<f64>,
	pub mrr: Option<f64>,
	pub auc: Option<f64>,
	pub evaluated_patients: usize,
	pub auc_patients: usize,
	/// Patients whose labels were all identical.
	pub skipped_patients: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingEvaluator {
	cutoff: usize,
}
impl RankingEvaluator {
	pub fn new(cutoff: u32) -> Self {
		Self { cutoff: cutoff.max(1) as usize }
	}

	/// `items` are `(label, score)` pairs in candidate order. Returns `None` when every label is
	/// the same, since there is nothing to rank against.
	pub fn evaluate_patient(&self, items: &[(u8, f64)]) -> Option<PatientMetrics> {
		let first = items.first()?.0;

		if items.iter().all(|(label, _)| *label == first) {
			return None;
		}

		let sorted = sort_by_score(items);

		Some(PatientMetrics {
			ndcg: ndcg_at(items, self.cutoff),
			precision: precision_at(&sorted, self.cutoff),
			mrr: reciprocal_rank(&sorted, self.cutoff),
			auc: auc(items),
		})
	}

	pub fn evaluate<'a, I>(&self, per_patient: I) -> CohortMetrics
	where
		I: IntoIterator<Item = &'a [(u8, f64)]>,
	{
		let mut ndcg = Vec::new();
		let mut precision = Vec::new();
		let mut mrr = Vec::new();
		let mut aucs = Vec::new();
		let mut skipped_patients = 0;

		for items in per_patient {
			let Some(metrics) = self.evaluate_patient(items) else {
				skipped_patients += 1;

				continue;
			};

			ndcg.push(metrics.ndcg);
			precision.push(metrics.precision);
			mrr.push(metrics.mrr);
			aucs.extend(metrics.auc);
		}

		CohortMetrics {
			ndcg: mean(&ndcg),
			precision: mean(&precision),
			mrr: mean(&mrr),
			auc: mean(&aucs),
			evaluated_patients: ndcg.len(),
			auc_patients: aucs.len(),
			skipped_patients,
		}
	}
}

/// Stable descending sort: equal scores keep candidate order.
pub fn sort_by_score(items: &[(u8, f64)]) -> Vec<(u8, f64)> {
	let mut sorted = items.to_vec();

	sorted.sort_by(|left, right| cmp_f64_desc(left.1, right.1));

	sorted
}

/// Normalized DCG at `k` with graded gains. Tied scores share the average gain of their group
/// over the positions the group occupies.
pub fn ndcg_at(items: &[(u8, f64)], k: usize) -> f64 {
	let discounts = (0..items.len())
		.map(|idx| if idx < k { 1.0 / (idx as f64 + 2.0).log2() } else { 0.0 })
		.collect::<Vec<_>>();
	let sorted = sort_by_score(items);
	let mut dcg = 0.0;
	let mut start = 0;

	while start < sorted.len() {
		let score = sorted[start].1;
		let end = sorted[start..]
			.iter()
			.position(|(_, other)| *other != score)
			.map_or(sorted.len(), |offset| start + offset);
		let gain = sorted[start..end].iter().map(|(label, _)| *label as f64).sum::<f64>()
			/ (end - start) as f64;

		dcg += gain * discounts[start..end].iter().sum::<f64>();
		start = end;
	}

	let mut ideal = items.iter().map(|(label, _)| *label as f64).collect::<Vec<_>>();

	ideal.sort_by(|left, right| cmp_f64_desc(*left, *right));

	let idcg = ideal.iter().zip(&discounts).map(|(gain, discount)| gain * discount).sum::<f64>();

	if idcg > 0.0 { dcg / idcg } else { 0.0 }
}

/// Precision at `k` on graded labels, where a label of 2 counts as a full hit.
///
/// When the list is at least `k` long and the first and `k`-th scores are equal, every item
/// sharing the top score is counted instead of the first `k`. Lists shorter than `k` are
/// normalized by their own length.
pub fn precision_at(sorted: &[(u8, f64)], k: usize) -> f64 {
	let top = &sorted[..sorted.len().min(k)];

	if top.is_empty() {
		return 0.0;
	}

	let label_sum = |items: &[(u8, f64)]| items.iter().map(|(label, _)| *label as f64).sum::<f64>();

	if top.len() == k {
		let top_score = top[0].1;

		if top[k - 1].1 == top_score {
			let tied = sorted.iter().filter(|(_, score)| *score == top_score).copied().collect::<Vec<_>>();

			return label_sum(&tied) / (2.0 * tied.len() as f64);
		}

		return label_sum(top) / (2.0 * k as f64);
	}

	label_sum(top) / (2.0 * top.len() as f64)
}

/// Reciprocal rank of the first relevant item within the top `k`.
pub fn reciprocal_rank(sorted: &[(u8, f64)], k: usize) -> f64 {
	sorted
		.iter()
		.take(k)
		.position(|(label, _)| *label > 0)
		.map_or(0.0, |idx| 1.0 / (idx as f64 + 1.0))
}

/// Among relevant items only, the probability that a label-2 item outscores a label-1 item,
/// counting ties as one half. `None` unless both labels are present.
pub fn auc(items: &[(u8, f64)]) -> Option<f64> {
	let eligible = items.iter().filter(|(label, _)| *label == 2).map(|(_, score)| *score).collect::<Vec<_>>();
	let partial = items.iter().filter(|(label, _)| *label == 1).map(|(_, score)| *score).collect::<Vec<_>>();

	if eligible.is_empty() || partial.is_empty() {
		return None;
	}

	let mut wins = 0.0;

	for high in &eligible {
		for low in &partial {
			if high > low {
				wins += 1.0;
			} else if high == low {
				wins += 0.5;
			}
		}
	}

	Some(wins / (eligible.len() * partial.len()) as f64)
}

fn mean(values: &[f64]) -> Option<f64> {
	(!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn items(labels: &[u8], scores: &[f64]) -> Vec<(u8, f64)> {
		labels.iter().copied().zip(scores.iter().copied()).collect()
	}

	#[test]
	fn full_tie_across_the_cutoff_counts_every_tied_item() {
		let tied = items(&[1, 1, 1, 0, 0, 0, 0, 0, 0, 0], &[0.5; 10]);

		assert!((precision_at(&sort_by_score(&tied), 10) - 0.15).abs() < 1e-12);

		let mut wider = tied.clone();

		wider.extend(items(&[2, 2], &[0.5, 0.5]));

		assert!((precision_at(&sort_by_score(&wider), 10) - 7.0 / 24.0).abs() < 1e-12);
	}

	#[test]
	fn signed_zeros_tie_like_the_ranked_list() {
		let list = items(&[0, 2, 1], &[-0.0, 0.0, -0.0]);

		assert_eq!(sort_by_score(&list), list);

		let mut reported = list.clone();

		reported.sort_by(|left, right| cmp_f64_desc(left.1, right.1));

		assert_eq!(sort_by_score(&list), reported);
		// Stable order keeps the unrelated trial first.
		assert!((reciprocal_rank(&sort_by_score(&list), 10) - 0.5).abs() < 1e-12);
	}

	#[test]
	fn partial_ties_use_the_plain_cutoff() {
		let mut scores = vec![1.0; 9];

		scores.push(0.0);
		scores.push(0.0);

		let list = items(&[2, 1, 0, 0, 0, 0, 0, 0, 0, 1, 2], &scores);

		assert!((precision_at(&sort_by_score(&list), 10) - 4.0 / 20.0).abs() < 1e-12);
	}

	#[test]
	fn short_lists_normalize_by_length() {
		let list = items(&[2, 0, 1], &[0.9, 0.8, 0.1]);

		assert!((precision_at(&sort_by_score(&list), 10) - 3.0 / 6.0).abs() < 1e-12);
	}

	#[test]
	fn reciprocal_rank_finds_first_relevant_in_cutoff() {
		let list = sort_by_score(&items(&[0, 0, 1], &[0.9, 0.8, 0.7]));

		assert!((reciprocal_rank(&list, 10) - 1.0 / 3.0).abs() < 1e-12);
		assert_eq!(reciprocal_rank(&list, 2), 0.0);
	}

	#[test]
	fn ndcg_is_one_for_ideal_order() {
		let list = items(&[2, 1, 0], &[0.9, 0.5, 0.1]);

		assert!((ndcg_at(&list, 10) - 1.0).abs() < 1e-12);
	}

	#[test]
	fn ndcg_averages_gains_within_ties() {
		let list = items(&[0, 2], &[0.5, 0.5]);
		let d1 = 1.0;
		let d2 = 1.0 / 3.0_f64.log2();
		let expected = (1.0 * (d1 + d2)) / (2.0 * d1);

		assert!((ndcg_at(&list, 10) - expected).abs() < 1e-12);
	}

	#[test]
	fn ndcg_respects_cutoff() {
		let list = items(&[0, 1], &[0.9, 0.1]);

		assert_eq!(ndcg_at(&list, 1), 0.0);
	}

	#[test]
	fn auc_ranks_eligible_over_partial_matches() {
		let list = items(&[2, 1, 1, 0], &[0.9, 0.5, 0.9, 5.0]);

		assert_eq!(auc(&list), Some(0.75));
		assert_eq!(auc(&items(&[1, 1, 0], &[0.1, 0.2, 0.3])), None);
	}

	#[test]
	fn patients_with_uniform_labels_are_skipped() {
		let evaluator = RankingEvaluator::new(10);
		let uniform = items(&[1, 1], &[0.2, 0.1]);
		let mixed = items(&[0, 1], &[0.2, 0.1]);
		let cohort = evaluator.evaluate([uniform.as_slice(), mixed.as_slice()]);

		assert_eq!(cohort.evaluated_patients, 1);
		assert_eq!(cohort.skipped_patients, 1);
		assert_eq!(cohort.auc_patients, 0);
		assert_eq!(cohort.auc, None);
		assert_eq!(cohort.mrr, Some(0.5));
	}
}
