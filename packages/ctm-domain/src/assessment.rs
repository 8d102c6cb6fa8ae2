use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, response};

/// Holistic trial-level judgment. Each score is `None` when the oracle omitted it or emitted
/// something that is not a number, which keeps "missing" apart from a legitimate zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelfAssessment {
	pub relevance_explanation: Option<String>,
	pub relevance_score: Option<f64>,
	pub eligibility_explanation: Option<String>,
	pub eligibility_score: Option<f64>,
}
impl SelfAssessment {
	pub fn new(relevance_score: f64, eligibility_score: f64) -> Self {
		Self {
			relevance_score: Some(relevance_score),
			eligibility_score: Some(eligibility_score),
			..Self::default()
		}
	}

	pub fn from_value(value: &Value) -> Self {
		let text = |keys: &[&str]| {
			keys.iter().find_map(|key| value.get(*key)).and_then(Value::as_str).map(str::to_string)
		};
		let number = |keys: &[&str]| {
			keys.iter().find_map(|key| value.get(*key)).and_then(response::lenient_f64)
		};

		Self {
			relevance_explanation: text(&["relevance_explanation"]),
			relevance_score: number(&["relevance_score_R", "relevance_score"]),
			eligibility_explanation: text(&["eligibility_explanation"]),
			eligibility_score: number(&["eligibility_score_E", "eligibility_score"]),
		}
	}
}

pub fn parse_assessment_response(raw: &str) -> Result<SelfAssessment> {
	let value = response::parse_json_object(raw)?;

	Ok(SelfAssessment::from_value(&value))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reads_scores_and_keeps_missing_fields_absent() {
		let value = serde_json::json!({
			"relevance_explanation": "Same disease.",
			"relevance_score_R": "85",
			"eligibility_score_E": "unknown"
		});
		let assessment = SelfAssessment::from_value(&value);

		assert_eq!(assessment.relevance_score, Some(85.0));
		assert_eq!(assessment.eligibility_score, None);
		assert_eq!(assessment.relevance_explanation.as_deref(), Some("Same disease."));
	}
}
