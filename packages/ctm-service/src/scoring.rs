use serde::{Deserialize, Serialize};

use ctm_domain::{CriterionCounts, JudgmentSet, SelfAssessment};

/// Turns criterion-level labels into one matching score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScorer {
	epsilon: f64,
}
impl MatchScorer {
	pub fn new(epsilon: f64) -> Self {
		Self { epsilon }
	}

	/// Share of applicable inclusion criteria met, minus one for any unmet inclusion criterion and
	/// minus one for any triggered exclusion criterion.
	pub fn score(&self, inclusion: &JudgmentSet, exclusion: &JudgmentSet) -> f64 {
		self.score_counts(&CriterionCounts::from_judgments(inclusion, exclusion))
	}

	pub fn score_counts(&self, counts: &CriterionCounts) -> f64 {
		let included = counts.included as f64;
		let denominator =
			(counts.included + counts.not_included + counts.inclusion_no_info) as f64 + self.epsilon;
		let mut score = included / denominator;

		if counts.not_included > 0 {
			score -= 1.0;
		}
		if counts.excluded > 0 {
			score -= 1.0;
		}

		score
	}
}

impl Default for MatchScorer {
	fn default() -> Self {
		Self::new(1e-9)
	}
}

pub struct AggregationScorer;
impl AggregationScorer {
	/// `(relevance + eligibility) / 100`, with a missing field counted as zero.
	pub fn self_assessment_score(assessment: Option<&SelfAssessment>) -> f64 {
		let Some(assessment) = assessment else { return 0.0 };
		let relevance = assessment.relevance_score.unwrap_or(0.0);
		let eligibility = assessment.eligibility_score.unwrap_or(0.0);

		(relevance + eligibility) / 100.0
	}

	pub fn combine(match_score: f64, assessment: Option<&SelfAssessment>) -> f64 {
		match_score + Self::self_assessment_score(assessment)
	}
}

/// Single-signal scores used to rank by one component at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreVariant {
	Combined,
	InclusionRatio,
	NotIncludedRatio,
	AnyNotIncluded,
	ExcludedRatio,
	NotExcludedRatio,
	AnyExcluded,
	Relevance,
	Eligibility,
}
impl ScoreVariant {
	pub const ALL: [Self; 9] = [
		Self::Combined,
		Self::InclusionRatio,
		Self::NotIncludedRatio,
		Self::AnyNotIncluded,
		Self::ExcludedRatio,
		Self::NotExcludedRatio,
		Self::AnyExcluded,
		Self::Relevance,
		Self::Eligibility,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Combined => "combined",
			Self::InclusionRatio => "inclusion_ratio",
			Self::NotIncludedRatio => "not_included_ratio",
			Self::AnyNotIncluded => "any_not_included",
			Self::ExcludedRatio => "excluded_ratio",
			Self::NotExcludedRatio => "not_excluded_ratio",
			Self::AnyExcluded => "any_excluded",
			Self::Relevance => "relevance",
			Self::Eligibility => "eligibility",
		}
	}

	/// `None` when the variant is undefined for this trial: ratios need at least one applicable
	/// criterion and the assessment variants need the corresponding score.
	pub fn value(
		self,
		scorer: &MatchScorer,
		counts: &CriterionCounts,
		assessment: Option<&SelfAssessment>,
	) -> Option<f64> {
		let ratio = |part: u32, total: u32| (total > 0).then(|| part as f64 / total as f64);
		let penalty = |hit: u32| if hit > 0 { -1.0 } else { 0.0 };

		match self {
			Self::Combined =>
				Some(AggregationScorer::combine(scorer.score_counts(counts), assessment)),
			Self::InclusionRatio => ratio(counts.included, counts.applicable_inclusion()),
			Self::NotIncludedRatio =>
				ratio(counts.not_included, counts.applicable_inclusion()).map(|value| -value),
			Self::AnyNotIncluded => Some(penalty(counts.not_included)),
			Self::ExcludedRatio =>
				ratio(counts.excluded, counts.applicable_exclusion()).map(|value| -value),
			Self::NotExcludedRatio => ratio(counts.not_excluded, counts.applicable_exclusion()),
			Self::AnyExcluded => Some(penalty(counts.excluded)),
			Self::Relevance => assessment.and_then(|assessment| assessment.relevance_score),
			Self::Eligibility => assessment.and_then(|assessment| assessment.eligibility_score),
		}
	}
}
