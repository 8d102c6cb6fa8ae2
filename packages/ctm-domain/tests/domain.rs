use ctm_domain::{
	CriterionGroup, EligibilityLabel, Error, PatientNote, Trial,
	assessment::parse_assessment_response, judgment::parse_judgment_response,
	note::CONSENT_SENTENCE,
};

fn sample_trial() -> Trial {
	serde_json::from_value(serde_json::json!({
		"_id": "NCT00000001",
		"brief_title": "Inhaled steroids in adult asthma",
		"brief_summary": "A randomized study of inhaled steroids.",
		"diseases_list": ["Asthma"],
		"drugs_list": ["Budesonide"],
		"inclusion_criteria": "Inclusion Criteria:\n\nAge 18 to 65\n\nDiagnosed asthma",
		"exclusion_criteria": "Exclusion Criteria:\n\nPregnancy\n\nSmoker"
	}))
	.expect("Failed to deserialize trial.")
}

#[test]
fn trial_accepts_corpus_aliases() {
	let trial = sample_trial();

	assert_eq!(trial.id, "NCT00000001");
	assert_eq!(trial.diseases, vec!["Asthma".to_string()]);
	assert_eq!(trial.criteria(CriterionGroup::Inclusion, 5).len(), 2);
	assert_eq!(trial.criteria(CriterionGroup::Exclusion, 5)[1].text, "Smoker");
}

#[test]
fn note_rendering_numbers_sentences_and_appends_consent() {
	let note = PatientNote::from_text("A 40-year-old woman with asthma. She smokes.");
	let rendered = note.render();

	assert_eq!(note.sentences().len(), 3);
	assert!(rendered.starts_with("0. A 40-year-old woman with asthma."));
	assert!(rendered.ends_with(&format!("2. {CONSENT_SENTENCE}")));
}

#[test]
fn malformed_judgment_entries_are_dropped_individually() {
	let raw = r#"{
		"0": ["Adult patient.", [0], "included"],
		"1": ["Missing label.", [1]],
		"2": ["Wrong group label.", [], "excluded"],
		"x": ["Bad key.", [], "included"],
		"3": ["Asthma confirmed.", ["0", 1], "not enough information"]
	}"#;
	let judgments =
		parse_judgment_response(CriterionGroup::Inclusion, raw).expect("Response must parse.");

	assert_eq!(judgments.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
	assert_eq!(judgments[&3].label, EligibilityLabel::NotEnoughInformation);
	assert_eq!(judgments[&3].evidence_sentence_ids, vec![0, 1]);
}

#[test]
fn unparseable_judgment_response_is_an_error() {
	let err = parse_judgment_response(CriterionGroup::Exclusion, "I cannot answer that.")
		.expect_err("Expected parse failure.");

	assert!(matches!(err, Error::InvalidJson { .. }));
}

#[test]
fn assessment_response_tolerates_fences() {
	let raw = "```json\n{\"relevance_score_R\": 90, \"eligibility_score_E\": -45.5}\n```";
	let assessment = parse_assessment_response(raw).expect("Response must parse.");

	assert_eq!(assessment.relevance_score, Some(90.0));
	assert_eq!(assessment.eligibility_score, Some(-45.5));
}
