use std::{
	collections::{BTreeMap, HashMap, VecDeque},
	path::Path,
	sync::{
		Mutex,
		atomic::{AtomicUsize, Ordering},
	},
};

use serde_json::{Map, Value};

use ctm_config::{
	Bm25, Conditions, Config, EmbeddingProviderConfig, Evaluation, LlmProviderConfig, Matching,
	Providers, Ranking, Retrieval, Service, Storage,
};
use ctm_domain::{
	Criterion, CriterionGroup, CriterionJudgment, EligibilityLabel, JudgmentSet, PatientNote,
	SelfAssessment, Trial, text,
};
use ctm_service::{
	BoxFuture, ChatProvider, ConditionGenerator, Corpus, Dataset, EligibilityOracle,
	EmbeddingProvider, OracleError, PatientQuery, oracle::GeneratedConditions,
};

pub const TEST_DIMENSIONS: u32 = 16;

/// Bag-of-hashed-tokens embedding. Texts sharing tokens get a positive inner product.
#[derive(Debug, Default)]
pub struct HashEmbedding {
	calls: AtomicUsize,
	texts: AtomicUsize,
}
impl HashEmbedding {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub fn embedded_texts(&self) -> usize {
		self.texts.load(Ordering::SeqCst)
	}

	pub fn vector(text: &str, dimensions: usize) -> Vec<f32> {
		let mut vector = vec![0.0; dimensions.max(1)];

		for token in text::tokenize(text) {
			let hash = blake3::hash(token.as_bytes());
			let bytes = hash.as_bytes();
			let bucket = u16::from_le_bytes([bytes[0], bytes[1]]) as usize % vector.len();

			vector[bucket] += 1.0;
		}

		vector
	}
}

impl EmbeddingProvider for HashEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, ctm_providers::Result<Vec<Vec<f32>>>> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.texts.fetch_add(texts.len(), Ordering::SeqCst);

		let dimensions = cfg.dimensions as usize;
		let vectors = texts.iter().map(|text| Self::vector(text, dimensions)).collect();

		Box::pin(async move { Ok(vectors) })
	}
}

/// Hash embedding whose `fail_on`-th call (1-based) fails without embedding anything.
#[derive(Debug)]
pub struct FlakyEmbedding {
	inner: HashEmbedding,
	fail_on: usize,
	calls: AtomicUsize,
}
impl FlakyEmbedding {
	pub fn new(fail_on: usize) -> Self {
		Self { inner: HashEmbedding::new(), fail_on, calls: AtomicUsize::new(0) }
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	/// Texts embedded by successful calls.
	pub fn embedded_texts(&self) -> usize {
		self.inner.embedded_texts()
	}
}

impl EmbeddingProvider for FlakyEmbedding {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, ctm_providers::Result<Vec<Vec<f32>>>> {
		let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

		if call == self.fail_on {
			return Box::pin(async move {
				Err(ctm_providers::Error::InvalidResponse {
					message: format!("Scripted embedding failure on call {call}."),
				})
			});
		}

		self.inner.embed(cfg, texts)
	}
}

/// Embedding provider that must never be called.
pub struct UnusedEmbedding;
impl EmbeddingProvider for UnusedEmbedding {
	fn embed<'a>(
		&'a self,
		_cfg: &'a EmbeddingProviderConfig,
		_texts: &'a [String],
	) -> BoxFuture<'a, ctm_providers::Result<Vec<Vec<f32>>>> {
		panic!("Embedding provider should not be called.");
	}
}

/// Chat provider replying with queued strings, then with a fixed fallback.
pub struct ScriptedChat {
	replies: Mutex<VecDeque<ctm_providers::Result<String>>>,
	fallback: String,
	calls: AtomicUsize,
}
impl ScriptedChat {
	pub fn new(fallback: impl Into<String>) -> Self {
		Self { replies: Mutex::new(VecDeque::new()), fallback: fallback.into(), calls: AtomicUsize::new(0) }
	}

	pub fn push(&self, reply: ctm_providers::Result<String>) {
		self.replies.lock().unwrap_or_else(|err| err.into_inner()).push_back(reply);
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

impl ChatProvider for ScriptedChat {
	fn complete<'a>(
		&'a self,
		_cfg: &'a LlmProviderConfig,
		_messages: &'a [Value],
	) -> BoxFuture<'a, ctm_providers::Result<String>> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		let reply = self
			.replies
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.pop_front()
			.unwrap_or_else(|| Ok(self.fallback.clone()));

		Box::pin(async move { reply })
	}
}

/// Deterministic oracle. Every criterion gets the label configured for its trial and group,
/// defaulting to `included` / `not excluded`. Failures can be queued per trial.
#[derive(Default)]
pub struct ScriptedOracle {
	labels: HashMap<(String, CriterionGroup), EligibilityLabel>,
	assessments: HashMap<String, SelfAssessment>,
	conditions: HashMap<String, Vec<String>>,
	failures: Mutex<HashMap<String, VecDeque<OracleError>>>,
	judge_calls: AtomicUsize,
	assess_calls: AtomicUsize,
	generate_calls: AtomicUsize,
}
impl ScriptedOracle {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_label(mut self, trial_id: &str, group: CriterionGroup, label: EligibilityLabel) -> Self {
		self.labels.insert((trial_id.to_string(), group), label);

		self
	}

	pub fn with_assessment(mut self, trial_id: &str, relevance: f64, eligibility: f64) -> Self {
		self.assessments.insert(trial_id.to_string(), SelfAssessment::new(relevance, eligibility));

		self
	}

	/// Conditions returned for a note containing `needle`.
	pub fn with_conditions(mut self, needle: &str, conditions: &[&str]) -> Self {
		self.conditions
			.insert(needle.to_string(), conditions.iter().map(|condition| condition.to_string()).collect());

		self
	}

	/// Queues `error` for the next oracle call touching `key` (a trial id, or a note substring
	/// for condition generation).
	pub fn fail_next(&self, key: &str, error: OracleError) {
		self.failures
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.entry(key.to_string())
			.or_default()
			.push_back(error);
	}

	pub fn judge_calls(&self) -> usize {
		self.judge_calls.load(Ordering::SeqCst)
	}

	pub fn assess_calls(&self) -> usize {
		self.assess_calls.load(Ordering::SeqCst)
	}

	pub fn generate_calls(&self) -> usize {
		self.generate_calls.load(Ordering::SeqCst)
	}

	fn take_failure(&self, key: &str) -> Option<OracleError> {
		self.failures
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.get_mut(key)
			.and_then(VecDeque::pop_front)
	}
}

impl EligibilityOracle for ScriptedOracle {
	fn judge<'a>(
		&'a self,
		_note: &'a PatientNote,
		trial: &'a Trial,
		group: CriterionGroup,
		criteria: &'a [Criterion],
	) -> BoxFuture<'a, Result<JudgmentSet, OracleError>> {
		self.judge_calls.fetch_add(1, Ordering::SeqCst);

		let result = match self.take_failure(&trial.id) {
			Some(err) => Err(err),
			None => {
				let label = self.labels.get(&(trial.id.clone(), group)).copied().unwrap_or(
					match group {
						CriterionGroup::Inclusion => EligibilityLabel::Included,
						CriterionGroup::Exclusion => EligibilityLabel::NotExcluded,
					},
				);

				Ok(criteria
					.iter()
					.map(|criterion| {
						(
							criterion.index,
							CriterionJudgment {
								reasoning: format!("Scripted {}.", label.as_str()),
								evidence_sentence_ids: vec![0],
								label,
							},
						)
					})
					.collect())
			},
		};

		Box::pin(async move { result })
	}

	fn assess<'a>(
		&'a self,
		_note: &'a PatientNote,
		trial: &'a Trial,
		_inclusion: &'a JudgmentSet,
		_exclusion: &'a JudgmentSet,
	) -> BoxFuture<'a, Result<SelfAssessment, OracleError>> {
		self.assess_calls.fetch_add(1, Ordering::SeqCst);

		let result = match self.take_failure(&trial.id) {
			Some(err) => Err(err),
			None => Ok(self.assessments.get(&trial.id).cloned().unwrap_or_else(|| SelfAssessment::new(50.0, 0.0))),
		};

		Box::pin(async move { result })
	}
}

impl ConditionGenerator for ScriptedOracle {
	fn generate<'a>(
		&'a self,
		note_text: &'a str,
		max_conditions: usize,
	) -> BoxFuture<'a, Result<GeneratedConditions, OracleError>> {
		self.generate_calls.fetch_add(1, Ordering::SeqCst);

		let matched = self.conditions.iter().find(|(needle, _)| note_text.contains(needle.as_str()));
		let failure = matched.and_then(|(needle, _)| self.take_failure(needle));
		let result = match (failure, matched) {
			(Some(err), _) => Err(err),
			(None, Some((_, conditions))) => Ok(GeneratedConditions {
				summary: Some(note_text.to_string()),
				conditions: conditions.iter().take(max_conditions).cloned().collect(),
			}),
			(None, None) => Ok(GeneratedConditions::default()),
		};

		Box::pin(async move { result })
	}
}

pub fn trial(id: &str, title: &str, summary: &str) -> Trial {
	Trial {
		id: id.to_string(),
		title: title.to_string(),
		summary: summary.to_string(),
		diseases: Vec::new(),
		interventions: Vec::new(),
		inclusion_criteria: "Inclusion Criteria:\n\nAdults aged 18 or older\n\nConfirmed diagnosis".to_string(),
		exclusion_criteria: "Exclusion Criteria:\n\nPregnancy or breastfeeding".to_string(),
	}
}

/// Three target trials plus filler trials so every shared term keeps a positive idf.
pub fn toy_corpus() -> Corpus {
	let trials = vec![
		trial("T1", "", "alpha alpha"),
		trial("T2", "", "alpha beta beta"),
		trial("T3", "", "beta gamma gamma"),
		trial("F1", "", "delta"),
		trial("F2", "", "epsilon"),
		trial("F3", "", "zeta"),
	];

	Corpus::new("toy", trials).expect("Toy corpus must be valid.")
}

pub fn patient(patient_id: &str, note_text: &str, ground_truth: &[(&str, u8)]) -> PatientQuery {
	PatientQuery {
		patient_id: patient_id.to_string(),
		note_text: note_text.to_string(),
		ground_truth: ground_truth.iter().map(|(trial_id, label)| (trial_id.to_string(), *label)).collect(),
	}
}

pub fn toy_dataset(patients: Vec<PatientQuery>, supplied: &[(&str, &[&str])]) -> Dataset {
	let supplied_conditions = supplied
		.iter()
		.map(|(patient_id, conditions)| {
			(patient_id.to_string(), conditions.iter().map(|condition| condition.to_string()).collect())
		})
		.collect::<BTreeMap<_, _>>();

	Dataset { corpus: toy_corpus(), patients, supplied_conditions }
}

pub fn embedding_config(model: &str) -> EmbeddingProviderConfig {
	EmbeddingProviderConfig {
		provider_id: "test".to_string(),
		api_base: "http://127.0.0.1:1".to_string(),
		api_key: "test-key".to_string(),
		path: "/v1/embeddings".to_string(),
		model: model.to_string(),
		dimensions: TEST_DIMENSIONS,
		timeout_ms: 1_000,
		batch_size: 2,
		default_headers: Map::new(),
	}
}

/// Lexical-only configuration with `k = 60`, no call spacing and caches under `cache_dir`.
pub fn test_config(cache_dir: &Path) -> Config {
	Config {
		service: Service { log_level: "info".to_string() },
		dataset: ctm_config::Dataset {
			name: "toy".to_string(),
			corpus_path: cache_dir.join("corpus.jsonl"),
			queries_path: cache_dir.join("queries.jsonl"),
			conditions_path: None,
		},
		storage: Storage { cache_dir: cache_dir.to_path_buf() },
		providers: Providers {
			corpus_embedding: embedding_config("test-article"),
			query_embedding: embedding_config("test-query"),
			oracle: LlmProviderConfig {
				provider_id: "test".to_string(),
				api_base: "http://127.0.0.1:1".to_string(),
				api_key: "test-key".to_string(),
				path: "/v1/chat/completions".to_string(),
				model: "test-model".to_string(),
				temperature: 0.0,
				timeout_ms: 1_000,
				default_headers: Map::new(),
			},
		},
		retrieval: Retrieval {
			fusion_k: 60,
			ranker_depth: 10,
			candidate_limit: 2,
			lexical_weight: 1.0,
			dense_weight: 0.0,
			bm25: Bm25::default(),
		},
		matching: Matching { min_call_interval_ms: 0, criterion_min_chars: 5, max_trials_per_patient: None },
		conditions: Conditions::default(),
		ranking: Ranking::default(),
		evaluation: Evaluation::default(),
	}
}
