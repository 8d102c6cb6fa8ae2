use std::fmt;

use serde::{Deserialize, Serialize};

use crate::text;

const TITLE_WEIGHT: usize = 3;
const DISEASE_WEIGHT: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trial {
	#[serde(alias = "_id", alias = "nct_id")]
	pub id: String,
	#[serde(alias = "brief_title")]
	pub title: String,
	#[serde(alias = "brief_summary")]
	pub summary: String,
	#[serde(rename = "disease_list", alias = "diseases_list")]
	pub diseases: Vec<String>,
	#[serde(rename = "drug_list", alias = "drugs_list")]
	pub interventions: Vec<String>,
	#[serde(rename = "inclusion_criteria_text", alias = "inclusion_criteria")]
	pub inclusion_criteria: String,
	#[serde(rename = "exclusion_criteria_text", alias = "exclusion_criteria")]
	pub exclusion_criteria: String,
}
impl Trial {
	pub fn criteria_text(&self, group: CriterionGroup) -> &str {
		match group {
			CriterionGroup::Inclusion => &self.inclusion_criteria,
			CriterionGroup::Exclusion => &self.exclusion_criteria,
		}
	}

	pub fn criteria(&self, group: CriterionGroup, min_chars: usize) -> Vec<Criterion> {
		split_criteria(self.criteria_text(group), min_chars)
	}

	/// Token multiset used by the lexical index. Title tokens appear three times, each disease's
	/// tokens twice and the summary once.
	pub fn weighted_tokens(&self) -> Vec<String> {
		let title = text::tokenize(&self.title);
		let mut tokens = Vec::with_capacity(title.len() * TITLE_WEIGHT);

		for _ in 0..TITLE_WEIGHT {
			tokens.extend(title.iter().cloned());
		}
		for disease in &self.diseases {
			let disease_tokens = text::tokenize(disease);

			for _ in 0..DISEASE_WEIGHT {
				tokens.extend(disease_tokens.iter().cloned());
			}
		}

		tokens.extend(text::tokenize(&self.summary));

		tokens
	}

	pub fn embedding_text(&self) -> String {
		format!("{}\n{}", self.title.trim(), self.summary.trim())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionGroup {
	Inclusion,
	Exclusion,
}
impl CriterionGroup {
	pub const ALL: [Self; 2] = [Self::Inclusion, Self::Exclusion];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Inclusion => "inclusion",
			Self::Exclusion => "exclusion",
		}
	}
}

impl fmt::Display for CriterionGroup {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
	pub index: u32,
	pub text: String,
}

/// Splits eligibility text into paragraph units.
///
/// Indices are assigned after filtering, so judgments keyed by index only line up with criteria
/// produced by this exact rule.
pub fn split_criteria(raw: &str, min_chars: usize) -> Vec<Criterion> {
	let mut out = Vec::new();
	let mut index = 0_u32;

	for paragraph in raw.split("\n\n") {
		let paragraph = paragraph.trim();

		if is_section_header(paragraph) {
			continue;
		}
		if paragraph.chars().count() < min_chars {
			continue;
		}

		out.push(Criterion { index, text: paragraph.to_string() });

		index += 1;
	}

	out
}

pub fn render_criteria(criteria: &[Criterion]) -> String {
	let mut out = String::new();

	for criterion in criteria {
		out.push_str(&format!("{}. {}\n", criterion.index, criterion.text));
	}

	out
}

fn is_section_header(paragraph: &str) -> bool {
	let lower = paragraph.to_lowercase();

	lower.contains("inclusion criteria") || lower.contains("exclusion criteria")
}
