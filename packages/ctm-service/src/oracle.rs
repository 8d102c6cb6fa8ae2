use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ctm_config::LlmProviderConfig;
use ctm_domain::{
	Criterion, CriterionGroup, JudgmentSet, PatientNote, SelfAssessment, Trial, assessment,
	judgment, response, trial,
};
use ctm_providers::chat;

use crate::{BoxFuture, ChatProvider};

const JUDGE_SYSTEM_PROMPT: &str = "You screen patients for clinical trials. You receive a trial \
description, a numbered list of its {group} criteria and a patient note whose sentences are \
numbered from 0. For every criterion, reason about whether the note addresses it, cite the ids \
of the supporting sentences and assign one label. Allowed labels: {labels}. Use \"not \
applicable\" when the criterion is irrelevant to this patient and \"not enough information\" \
when the note neither confirms nor rules it out. Reply with one JSON object mapping each \
criterion number (as a string) to [reasoning, [sentence ids], label] and nothing else.";
const ASSESS_SYSTEM_PROMPT: &str = "You rank clinical trials for a patient. You receive the \
patient note, a trial description and criterion-level eligibility judgments. Explain how \
relevant the trial is to the patient and give a relevance score R from 0 (unrelated) to 100 \
(exactly on target). Then explain the patient's eligibility and give an eligibility score E with \
-R <= E <= R, where E = -R means clearly ineligible, E = R means meets every inclusion criterion \
and no exclusion criterion, and E = 0 means no usable evidence either way. Reply with one JSON \
object {\"relevance_explanation\": string, \"relevance_score_R\": number, \
\"eligibility_explanation\": string, \"eligibility_score_E\": number} and nothing else.";
const CONDITIONS_SYSTEM_PROMPT: &str = "You help find clinical trials for a patient. Summarize \
the patient's main medical problems, then list at most {max} conditions to search trials with, \
most important first. Reply with one JSON object {\"summary\": string, \"conditions\": [string]} \
and nothing else.";

/// Failure of a single oracle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleError {
	/// The call did not complete. Nothing is cached, so a later run retries the unit.
	Retryable { message: String },
	/// The call completed but the reply is unusable. Cached as an empty result.
	Malformed { message: String },
	/// The provider rejected the request itself (bad credentials, unknown model, invalid
	/// configuration). Repeating it cannot succeed, so the stage stops.
	Fatal { message: String },
}
impl OracleError {
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Retryable { .. })
	}
}

impl fmt::Display for OracleError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Retryable { message } => write!(f, "Retryable oracle failure: {message}"),
			Self::Malformed { message } => write!(f, "Malformed oracle response: {message}"),
			Self::Fatal { message } => write!(f, "Oracle request rejected: {message}"),
		}
	}
}

impl std::error::Error for OracleError {}

impl From<ctm_providers::Error> for OracleError {
	fn from(err: ctm_providers::Error) -> Self {
		match err {
			ctm_providers::Error::InvalidResponse { message } => Self::Malformed { message },
			ctm_providers::Error::SerdeJson(err) => Self::Malformed { message: err.to_string() },
			other if other.is_transient() => Self::Retryable { message: other.to_string() },
			other => Self::Fatal { message: other.to_string() },
		}
	}
}

impl From<ctm_domain::Error> for OracleError {
	fn from(err: ctm_domain::Error) -> Self {
		Self::Malformed { message: err.to_string() }
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedConditions {
	pub summary: Option<String>,
	pub conditions: Vec<String>,
}

pub trait EligibilityOracle
where
	Self: Send + Sync,
{
	/// Labels one criterion group of `trial` for the patient.
	fn judge<'a>(
		&'a self,
		note: &'a PatientNote,
		trial: &'a Trial,
		group: CriterionGroup,
		criteria: &'a [Criterion],
	) -> BoxFuture<'a, Result<JudgmentSet, OracleError>>;

	/// Holistic relevance and eligibility given the criterion-level judgments.
	fn assess<'a>(
		&'a self,
		note: &'a PatientNote,
		trial: &'a Trial,
		inclusion: &'a JudgmentSet,
		exclusion: &'a JudgmentSet,
	) -> BoxFuture<'a, Result<SelfAssessment, OracleError>>;
}

pub trait ConditionGenerator
where
	Self: Send + Sync,
{
	fn generate<'a>(
		&'a self,
		note_text: &'a str,
		max_conditions: usize,
	) -> BoxFuture<'a, Result<GeneratedConditions, OracleError>>;
}

/// Oracle backed by a chat-completion model.
#[derive(Clone)]
pub struct LlmOracle {
	cfg: LlmProviderConfig,
	chat: Arc<dyn ChatProvider>,
	criterion_min_chars: usize,
}
impl LlmOracle {
	pub fn new(cfg: LlmProviderConfig, chat: Arc<dyn ChatProvider>, criterion_min_chars: u32) -> Self {
		Self { cfg, chat, criterion_min_chars: criterion_min_chars as usize }
	}

	async fn ask(&self, system: &str, user: &str) -> Result<String, OracleError> {
		let messages = chat::system_user_messages(system, user);

		self.chat.complete(&self.cfg, &messages).await.map_err(|err| {
			tracing::warn!(
				provider_id = %self.cfg.provider_id,
				transient = err.is_transient(),
				error = %err,
				"Oracle request failed."
			);

			OracleError::from(err)
		})
	}
}

impl EligibilityOracle for LlmOracle {
	fn judge<'a>(
		&'a self,
		note: &'a PatientNote,
		trial: &'a Trial,
		group: CriterionGroup,
		criteria: &'a [Criterion],
	) -> BoxFuture<'a, Result<JudgmentSet, OracleError>> {
		Box::pin(async move {
			let system = judge_system_prompt(group);
			let user = judge_user_prompt(note, trial, group, criteria);
			let raw = self.ask(&system, &user).await?;

			Ok(judgment::parse_judgment_response(group, &raw)?)
		})
	}

	fn assess<'a>(
		&'a self,
		note: &'a PatientNote,
		trial: &'a Trial,
		inclusion: &'a JudgmentSet,
		exclusion: &'a JudgmentSet,
	) -> BoxFuture<'a, Result<SelfAssessment, OracleError>> {
		Box::pin(async move {
			let judgments = render_judgments(trial, inclusion, exclusion, self.criterion_min_chars);
			let user = format!(
				"Patient note:\n{}\n\nTrial:\n{}\n\nCriterion-level judgments:\n{}\nJSON:",
				note.render(),
				trial_header(trial),
				judgments
			);
			let raw = self.ask(ASSESS_SYSTEM_PROMPT, &user).await?;

			Ok(assessment::parse_assessment_response(&raw)?)
		})
	}
}

impl ConditionGenerator for LlmOracle {
	fn generate<'a>(
		&'a self,
		note_text: &'a str,
		max_conditions: usize,
	) -> BoxFuture<'a, Result<GeneratedConditions, OracleError>> {
		Box::pin(async move {
			let system = CONDITIONS_SYSTEM_PROMPT.replace("{max}", &max_conditions.to_string());
			let user = format!("Patient description:\n{note_text}\n\nJSON:");
			let raw = self.ask(&system, &user).await?;

			parse_conditions_response(&raw, max_conditions)
		})
	}
}

pub fn judge_system_prompt(group: CriterionGroup) -> String {
	let labels = match group {
		CriterionGroup::Inclusion => "\"not applicable\", \"not enough information\", \"included\", \"not included\"",
		CriterionGroup::Exclusion => "\"not applicable\", \"not enough information\", \"excluded\", \"not excluded\"",
	};

	JUDGE_SYSTEM_PROMPT.replace("{group}", group.as_str()).replace("{labels}", labels)
}

pub fn judge_user_prompt(
	note: &PatientNote,
	trial: &Trial,
	group: CriterionGroup,
	criteria: &[Criterion],
) -> String {
	format!(
		"Trial:\n{}\n\n{} criteria:\n{}\nPatient note:\n{}\n\nJSON:",
		trial_header(trial),
		capitalize(group.as_str()),
		trial::render_criteria(criteria),
		note.render()
	)
}

pub fn trial_header(trial: &Trial) -> String {
	format!(
		"Title: {}\nTarget diseases: {}\nInterventions: {}\nSummary: {}",
		trial.title.trim(),
		trial.diseases.join(", "),
		trial.interventions.join(", "),
		trial.summary.trim()
	)
}

/// Judgments in criterion order, skipping indices that no longer resolve to a criterion.
pub fn render_judgments(
	trial: &Trial,
	inclusion: &JudgmentSet,
	exclusion: &JudgmentSet,
	min_chars: usize,
) -> String {
	let mut out = String::new();

	for (group, judgments) in [(CriterionGroup::Inclusion, inclusion), (CriterionGroup::Exclusion, exclusion)] {
		let criteria = trial.criteria(group, min_chars);

		for (index, judgment) in judgments {
			let Some(criterion) = criteria.iter().find(|criterion| criterion.index == *index) else {
				continue;
			};

			out.push_str(&format!("{group} criterion {index}: {}\n", criterion.text));
			out.push_str(&format!("\tReasoning: {}\n", judgment.reasoning));

			if !judgment.evidence_sentence_ids.is_empty() {
				out.push_str(&format!("\tEvidence sentences: {:?}\n", judgment.evidence_sentence_ids));
			}

			out.push_str(&format!("\tLabel: {}\n", judgment.label.as_str()));
		}
	}

	out
}

pub fn parse_conditions_response(
	raw: &str,
	max_conditions: usize,
) -> Result<GeneratedConditions, OracleError> {
	let value = response::parse_json_object(raw)?;
	let Some(list) = value.get("conditions").and_then(Value::as_array) else {
		return Err(OracleError::Malformed { message: "Missing conditions list.".to_string() });
	};
	let conditions = list
		.iter()
		.filter_map(Value::as_str)
		.map(str::trim)
		.filter(|condition| !condition.is_empty())
		.take(max_conditions)
		.map(str::to_string)
		.collect();
	let summary = value.get("summary").and_then(Value::as_str).map(str::to_string);

	Ok(GeneratedConditions { summary, conditions })
}

fn capitalize(raw: &str) -> String {
	let mut chars = raw.chars();

	match chars.next() {
		Some(first) => first.to_uppercase().chain(chars).collect(),
		None => String::new(),
	}
}

#[cfg(test)]
mod tests {
	use ctm_domain::{CriterionJudgment, EligibilityLabel};

	use super::*;

	fn trial() -> Trial {
		Trial {
			id: "NCT1".to_string(),
			title: "Asthma inhaler study".to_string(),
			summary: "Tests a new inhaler.".to_string(),
			diseases: vec!["Asthma".to_string()],
			interventions: vec!["Inhaler".to_string()],
			inclusion_criteria: "Inclusion Criteria:\n\nAge over 18\n\nDiagnosed asthma".to_string(),
			exclusion_criteria: "Pregnancy".to_string(),
		}
	}

	#[test]
	fn provider_errors_map_to_typed_failures() {
		let malformed = OracleError::from(ctm_providers::Error::InvalidResponse {
			message: "no choices".to_string(),
		});
		let fatal = OracleError::from(ctm_providers::Error::InvalidConfig {
			message: "bad header".to_string(),
		});

		assert!(!malformed.is_retryable());
		assert!(matches!(fatal, OracleError::Fatal { .. }));
		assert!(!fatal.is_retryable());
	}

	#[test]
	fn judge_prompt_numbers_criteria_and_sentences() {
		let trial = trial();
		let note = PatientNote::from_text("A 40-year-old woman. She has asthma.");
		let criteria = trial.criteria(CriterionGroup::Inclusion, 5);
		let prompt = judge_user_prompt(&note, &trial, CriterionGroup::Inclusion, &criteria);

		assert!(prompt.contains("0. Age over 18\n1. Diagnosed asthma\n"));
		assert!(prompt.contains("1. She has asthma."));
		assert!(judge_system_prompt(CriterionGroup::Exclusion).contains("\"not excluded\""));
	}

	#[test]
	fn rendered_judgments_skip_unknown_indices() {
		let mut inclusion = JudgmentSet::new();

		inclusion.insert(
			1,
			CriterionJudgment {
				reasoning: "Asthma is documented.".to_string(),
				evidence_sentence_ids: vec![1],
				label: EligibilityLabel::Included,
			},
		);
		inclusion.insert(
			7,
			CriterionJudgment {
				reasoning: "Stale.".to_string(),
				evidence_sentence_ids: Vec::new(),
				label: EligibilityLabel::NotIncluded,
			},
		);

		let rendered = render_judgments(&trial(), &inclusion, &JudgmentSet::new(), 5);

		assert!(rendered.contains("inclusion criterion 1: Diagnosed asthma"));
		assert!(rendered.contains("Evidence sentences: [1]"));
		assert!(!rendered.contains("Stale."));
	}

	#[test]
	fn condition_lists_are_trimmed_and_capped() {
		let raw = r#"{"summary": "Asthma.", "conditions": [" asthma ", "", "wheezing", "cough"]}"#;
		let parsed = parse_conditions_response(raw, 2).expect("parse");

		assert_eq!(parsed.conditions, vec!["asthma".to_string(), "wheezing".to_string()]);
		assert_eq!(parsed.summary.as_deref(), Some("Asthma."));
		assert!(matches!(
			parse_conditions_response("{\"summary\": \"x\"}", 2),
			Err(OracleError::Malformed { .. })
		));
	}
}
