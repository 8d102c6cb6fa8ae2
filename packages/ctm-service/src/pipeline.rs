use std::{collections::BTreeMap, path::Path, sync::Arc};

use serde::Serialize;

use ctm_config::Config;
use ctm_storage::{JsonLogStore, KvStore, MemoryStore};

use crate::{
	ConditionGenerator, EligibilityOracle, EmbeddingProvider, HybridFusionRetriever, LexicalIndex,
	LlmOracle, MatchScorer, Providers, Result, VectorIndex,
	assessment::AssessmentStage,
	conditions::{ConditionSource, ConditionStage},
	dataset::Dataset,
	matching::{MatchingStage, StageReport},
	ranking::{self, MissingData, PatientTrialRecord, RankedList},
	retrieval::{self, CandidateRecord, Recall, RetrievalStage},
	throttle::RateLimiter,
};

/// One store per persisted artifact.
#[derive(Clone)]
pub struct Caches {
	pub lexical: Arc<dyn KvStore>,
	pub embeddings: Arc<dyn KvStore>,
	pub conditions: Arc<dyn KvStore>,
	pub candidates: Arc<dyn KvStore>,
	pub matching: Arc<dyn KvStore>,
	pub assessment: Arc<dyn KvStore>,
}
impl Caches {
	/// Index artifacts are shared across datasets and namespaced by corpus. Everything else
	/// lives under `cache_dir/<dataset>/`.
	pub fn open(cache_dir: &Path, dataset: &str) -> Result<Self> {
		let run_dir = cache_dir.join(dataset);
		let open = |path: std::path::PathBuf| -> Result<Arc<dyn KvStore>> {
			Ok(Arc::new(JsonLogStore::open(path)?))
		};

		Ok(Self {
			lexical: open(cache_dir.join("lexical_index.jsonl"))?,
			embeddings: open(cache_dir.join("trial_embeddings.jsonl"))?,
			conditions: open(run_dir.join("conditions.jsonl"))?,
			candidates: open(run_dir.join("candidates.jsonl"))?,
			matching: open(run_dir.join("matching.jsonl"))?,
			assessment: open(run_dir.join("assessment.jsonl"))?,
		})
	}

	pub fn in_memory() -> Self {
		Self {
			lexical: Arc::new(MemoryStore::new()),
			embeddings: Arc::new(MemoryStore::new()),
			conditions: Arc::new(MemoryStore::new()),
			candidates: Arc::new(MemoryStore::new()),
			matching: Arc::new(MemoryStore::new()),
			assessment: Arc::new(MemoryStore::new()),
		}
	}
}

/// Records and ranking for one patient.
#[derive(Debug, Clone, Serialize)]
pub struct PatientRanking {
	pub patient_id: String,
	pub recall: Recall,
	pub records: Vec<PatientTrialRecord>,
	pub ranked: RankedList,
}

#[derive(Debug, Clone, Serialize)]
pub struct CohortRanking {
	pub patients: Vec<PatientRanking>,
	pub missing: MissingData,
}

pub struct Pipeline {
	cfg: Config,
	dataset: Dataset,
	caches: Caches,
	embedding: Arc<dyn EmbeddingProvider>,
	oracle: Arc<dyn EligibilityOracle>,
	generator: Arc<dyn ConditionGenerator>,
}
impl Pipeline {
	/// Loads the dataset and opens the file caches named by `cfg`, talking to the configured
	/// HTTP providers.
	pub fn load(cfg: Config, providers: Providers) -> Result<Self> {
		let dataset = Dataset::load(&cfg.dataset)?;
		let caches = Caches::open(&cfg.storage.cache_dir, &cfg.dataset.name)?;
		let oracle = Arc::new(LlmOracle::new(
			cfg.providers.oracle.clone(),
			providers.chat.clone(),
			cfg.matching.criterion_min_chars,
		));

		Ok(Self::new(cfg, dataset, caches, providers.embedding, oracle.clone(), oracle))
	}

	pub fn new(
		cfg: Config,
		dataset: Dataset,
		caches: Caches,
		embedding: Arc<dyn EmbeddingProvider>,
		oracle: Arc<dyn EligibilityOracle>,
		generator: Arc<dyn ConditionGenerator>,
	) -> Self {
		Self { cfg, dataset, caches, embedding, oracle, generator }
	}

	pub fn config(&self) -> &Config {
		&self.cfg
	}

	pub fn dataset(&self) -> &Dataset {
		&self.dataset
	}

	pub fn caches(&self) -> &Caches {
		&self.caches
	}

	/// Resolves condition lists, builds the indexes and retrieves candidates for every patient
	/// without a cached candidate list.
	pub async fn run_retrieval(&self) -> Result<StageReport> {
		let conditions = self.resolve_conditions().await?;
		let retrieval = &self.cfg.retrieval;
		let lexical = LexicalIndex::load_or_build(
			&self.dataset.corpus,
			&retrieval.bm25,
			self.caches.lexical.as_ref(),
		)?;
		let vector = if retrieval.dense_weight > 0.0 {
			Some(
				VectorIndex::build(
					&self.dataset.corpus,
					&self.cfg.providers.corpus_embedding,
					self.embedding.as_ref(),
					self.caches.embeddings.as_ref(),
				)
				.await?,
			)
		} else {
			None
		};
		let retriever = HybridFusionRetriever::new(
			&lexical,
			vector.as_ref(),
			&self.cfg.providers.query_embedding,
			self.embedding.as_ref(),
			retrieval.fusion_k,
			retrieval.ranker_depth,
		);
		let stage = RetrievalStage::new(
			&retriever,
			self.caches.candidates.as_ref(),
			retrieval.candidate_limit,
			retrieval.lexical_weight,
			retrieval.dense_weight,
		);

		stage.run(&self.dataset.patients, &conditions).await
	}

	pub async fn run_matching(&self) -> Result<StageReport> {
		let candidates = self.candidate_ids()?;
		let stage = MatchingStage::new(
			self.oracle.as_ref(),
			self.caches.matching.as_ref(),
			self.cfg.matching.criterion_min_chars,
		);
		let mut limiter = RateLimiter::from_millis(self.cfg.matching.min_call_interval_ms);

		stage.run(&mut limiter, &self.dataset.corpus, &self.dataset.patients, &candidates).await
	}

	pub async fn run_assessment(&self) -> Result<StageReport> {
		let candidates = self.candidate_ids()?;
		let stage = AssessmentStage::new(
			self.oracle.as_ref(),
			self.caches.matching.as_ref(),
			self.caches.assessment.as_ref(),
		);
		let mut limiter = RateLimiter::from_millis(self.cfg.matching.min_call_interval_ms);

		stage.run(&mut limiter, &self.dataset.corpus, &self.dataset.patients, &candidates).await
	}

	/// Scores every cached candidate and ranks each patient's trials. Reads caches only.
	pub fn rank(&self) -> Result<CohortRanking> {
		let scorer = MatchScorer::new(self.cfg.ranking.match_epsilon);
		let candidates = self.candidate_ids()?;
		let mut missing = MissingData::default();
		let mut patients = Vec::with_capacity(self.dataset.patients.len());

		for patient in &self.dataset.patients {
			let Some(trial_ids) = candidates.get(&patient.patient_id) else {
				missing.patients_without_candidates += 1;

				continue;
			};

			if trial_ids.is_empty() {
				missing.patients_without_candidates += 1;
			}

			let records = ranking::build_records(
				patient,
				trial_ids,
				self.caches.matching.as_ref(),
				self.caches.assessment.as_ref(),
			)?;

			for record in &records {
				missing.record(record);
			}

			let ranked = ranking::rank(&patient.patient_id, &records, &scorer);

			patients.push(PatientRanking {
				patient_id: patient.patient_id.clone(),
				recall: retrieval::recall(patient, trial_ids),
				records,
				ranked,
			});
		}

		Ok(CohortRanking { patients, missing })
	}

	/// Cached candidate ids per patient, capped at `max_trials_per_patient`.
	pub fn candidate_ids(&self) -> Result<BTreeMap<String, Vec<String>>> {
		let limit = self.cfg.matching.max_trials_per_patient.map(|max| max as usize);
		let mut out = BTreeMap::new();

		for patient in &self.dataset.patients {
			let Some(record) = ctm_storage::get_typed::<CandidateRecord>(
				self.caches.candidates.as_ref(),
				&patient.patient_id,
			)?
			else {
				continue;
			};
			let mut trial_ids = record.trial_ids();

			if let Some(limit) = limit {
				trial_ids.truncate(limit);
			}

			out.insert(patient.patient_id.clone(), trial_ids);
		}

		Ok(out)
	}

	async fn resolve_conditions(&self) -> Result<BTreeMap<String, Vec<String>>> {
		let generator = self.cfg.conditions.generate.then_some(self.generator.as_ref());
		let stage = ConditionStage::new(
			generator,
			self.caches.conditions.as_ref(),
			self.cfg.conditions.max_conditions,
		);
		let mut limiter = RateLimiter::from_millis(self.cfg.matching.min_call_interval_ms);
		let (resolved, report) =
			stage.run(&mut limiter, &self.dataset.patients, &self.dataset.supplied_conditions).await?;
		let count = |wanted: ConditionSource| {
			resolved.values().filter(|(source, _)| *source == wanted).count()
		};

		tracing::info!(
			supplied = count(ConditionSource::Supplied),
			generated = count(ConditionSource::Generated),
			raw_note = count(ConditionSource::RawNote),
			generation_retryable = report.retryable,
			generation_malformed = report.malformed,
			"Resolved patient conditions."
		);

		Ok(resolved.into_iter().map(|(patient_id, (_, list))| (patient_id, list)).collect())
	}
}
