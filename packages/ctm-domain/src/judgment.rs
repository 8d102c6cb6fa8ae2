use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, response, trial::CriterionGroup};

pub type JudgmentSet = BTreeMap<u32, CriterionJudgment>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EligibilityLabel {
	NotApplicable,
	NotEnoughInformation,
	Included,
	NotIncluded,
	Excluded,
	NotExcluded,
}
impl EligibilityLabel {
	/// Accepts the labels that are valid for `group` only.
	pub fn parse(group: CriterionGroup, raw: &str) -> Option<Self> {
		let normalized = raw.trim().to_lowercase().replace(['_', '-'], " ");
		let label = match normalized.as_str() {
			"not applicable" => Self::NotApplicable,
			"not enough information" => Self::NotEnoughInformation,
			"included" => Self::Included,
			"not included" => Self::NotIncluded,
			"excluded" => Self::Excluded,
			"not excluded" => Self::NotExcluded,
			_ => return None,
		};

		label.valid_for(group).then_some(label)
	}

	pub fn valid_for(self, group: CriterionGroup) -> bool {
		match self {
			Self::NotApplicable | Self::NotEnoughInformation => true,
			Self::Included | Self::NotIncluded => group == CriterionGroup::Inclusion,
			Self::Excluded | Self::NotExcluded => group == CriterionGroup::Exclusion,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::NotApplicable => "not applicable",
			Self::NotEnoughInformation => "not enough information",
			Self::Included => "included",
			Self::NotIncluded => "not included",
			Self::Excluded => "excluded",
			Self::NotExcluded => "not excluded",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionJudgment {
	pub reasoning: String,
	pub evidence_sentence_ids: Vec<u32>,
	pub label: EligibilityLabel,
}
impl CriterionJudgment {
	/// Reads the `[reasoning, [sentence ids], label]` triple. Anything else is treated as absent.
	pub fn from_value(group: CriterionGroup, value: &Value) -> Option<Self> {
		let items = value.as_array()?;

		if items.len() != 3 {
			return None;
		}

		let reasoning = items[0].as_str()?.to_string();
		let mut evidence_sentence_ids = Vec::new();

		for id in items[1].as_array()? {
			let id = match id {
				Value::Number(number) => number.as_u64(),
				Value::String(text) => text.trim().parse::<u64>().ok(),
				_ => None,
			}?;

			evidence_sentence_ids.push(u32::try_from(id).ok()?);
		}

		let label = EligibilityLabel::parse(group, items[2].as_str()?)?;

		Some(Self { reasoning, evidence_sentence_ids, label })
	}
}

/// Per-group label tallies over one trial's judgments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CriterionCounts {
	pub inclusion_total: u32,
	pub included: u32,
	pub not_included: u32,
	pub inclusion_not_applicable: u32,
	pub inclusion_no_info: u32,
	pub exclusion_total: u32,
	pub excluded: u32,
	pub not_excluded: u32,
	pub exclusion_not_applicable: u32,
	pub exclusion_no_info: u32,
}
impl CriterionCounts {
	pub fn from_judgments(inclusion: &JudgmentSet, exclusion: &JudgmentSet) -> Self {
		let mut counts = Self::default();

		for judgment in inclusion.values() {
			counts.inclusion_total += 1;

			match judgment.label {
				EligibilityLabel::Included => counts.included += 1,
				EligibilityLabel::NotIncluded => counts.not_included += 1,
				EligibilityLabel::NotApplicable => counts.inclusion_not_applicable += 1,
				EligibilityLabel::NotEnoughInformation => counts.inclusion_no_info += 1,
				EligibilityLabel::Excluded | EligibilityLabel::NotExcluded => {},
			}
		}
		for judgment in exclusion.values() {
			counts.exclusion_total += 1;

			match judgment.label {
				EligibilityLabel::Excluded => counts.excluded += 1,
				EligibilityLabel::NotExcluded => counts.not_excluded += 1,
				EligibilityLabel::NotApplicable => counts.exclusion_not_applicable += 1,
				EligibilityLabel::NotEnoughInformation => counts.exclusion_no_info += 1,
				EligibilityLabel::Included | EligibilityLabel::NotIncluded => {},
			}
		}

		counts
	}

	pub fn applicable_inclusion(&self) -> u32 {
		self.inclusion_total - self.inclusion_not_applicable
	}

	pub fn applicable_exclusion(&self) -> u32 {
		self.exclusion_total - self.exclusion_not_applicable
	}
}

/// Builds a judgment set from the oracle's `{criterion_index: triple}` object. Malformed entries
/// are dropped one by one.
pub fn judgments_from_value(group: CriterionGroup, value: &Value) -> JudgmentSet {
	let mut out = JudgmentSet::new();
	let Some(object) = value.as_object() else { return out };

	for (key, entry) in object {
		let Ok(index) = key.trim().parse::<u32>() else { continue };
		let Some(judgment) = CriterionJudgment::from_value(group, entry) else { continue };

		out.insert(index, judgment);
	}

	out
}

/// Fails only when the whole response cannot be read as a JSON object.
pub fn parse_judgment_response(group: CriterionGroup, raw: &str) -> Result<JudgmentSet> {
	let value = response::parse_json_object(raw)?;

	Ok(judgments_from_value(group, &value))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn labels_are_group_aware() {
		assert_eq!(
			EligibilityLabel::parse(CriterionGroup::Inclusion, "Not Included"),
			Some(EligibilityLabel::NotIncluded)
		);
		assert_eq!(EligibilityLabel::parse(CriterionGroup::Inclusion, "excluded"), None);
		assert_eq!(
			EligibilityLabel::parse(CriterionGroup::Exclusion, "not_enough_information"),
			Some(EligibilityLabel::NotEnoughInformation)
		);
	}

	#[test]
	fn counts_skip_labels_from_the_other_group() {
		let mut inclusion = JudgmentSet::new();

		inclusion.insert(0, judgment(EligibilityLabel::Included));
		inclusion.insert(1, judgment(EligibilityLabel::NotApplicable));

		let mut exclusion = JudgmentSet::new();

		exclusion.insert(0, judgment(EligibilityLabel::Excluded));
		exclusion.insert(1, judgment(EligibilityLabel::Included));

		let counts = CriterionCounts::from_judgments(&inclusion, &exclusion);

		assert_eq!(counts.included, 1);
		assert_eq!(counts.applicable_inclusion(), 1);
		assert_eq!(counts.excluded, 1);
		assert_eq!(counts.exclusion_total, 2);
	}

	fn judgment(label: EligibilityLabel) -> CriterionJudgment {
		CriterionJudgment { reasoning: String::new(), evidence_sentence_ids: Vec::new(), label }
	}
}
