use crate::text;

/// Appended to every note so criteria about consent and protocol compliance have evidence.
pub const CONSENT_SENTENCE: &str = "The patient will provide informed consent, and will comply with the trial protocol without any practical issues.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientNote {
	sentences: Vec<String>,
}
impl PatientNote {
	pub fn from_text(note: &str) -> Self {
		let mut sentences = text::split_sentences(note);

		sentences.push(CONSENT_SENTENCE.to_string());

		Self { sentences }
	}

	pub fn sentences(&self) -> &[String] {
		&self.sentences
	}

	/// One sentence per line, each led by its zero-based sentence id.
	pub fn render(&self) -> String {
		self.sentences
			.iter()
			.enumerate()
			.map(|(idx, sentence)| format!("{idx}. {sentence}"))
			.collect::<Vec<_>>()
			.join("\n")
	}
}
