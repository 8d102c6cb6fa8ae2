use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub dataset: Dataset,
	pub storage: Storage,
	pub providers: Providers,
	pub retrieval: Retrieval,
	pub matching: Matching,
	#[serde(default)]
	pub conditions: Conditions,
	#[serde(default)]
	pub ranking: Ranking,
	#[serde(default)]
	pub evaluation: Evaluation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Dataset {
	/// Corpus identity. Index artifacts and embedding caches are namespaced by it.
	pub name: String,
	pub corpus_path: PathBuf,
	pub queries_path: PathBuf,
	/// Optional. JSON object mapping patient ids to priority-ordered condition strings.
	pub conditions_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub cache_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Providers {
	pub corpus_embedding: EmbeddingProviderConfig,
	pub query_embedding: EmbeddingProviderConfig,
	pub oracle: LlmProviderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default = "default_batch_size")]
	pub batch_size: u32,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retrieval {
	pub fusion_k: u32,
	/// Per-ranker depth fetched for every condition.
	pub ranker_depth: u32,
	/// Candidates kept per patient after fusion.
	pub candidate_limit: u32,
	pub lexical_weight: f32,
	pub dense_weight: f32,
	#[serde(default)]
	pub bm25: Bm25,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bm25 {
	pub k1: f32,
	pub b: f32,
	/// Floor for negative idf values, as a fraction of the average idf.
	pub epsilon: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Matching {
	pub min_call_interval_ms: u64,
	#[serde(default = "default_criterion_min_chars")]
	pub criterion_min_chars: u32,
	pub max_trials_per_patient: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Conditions {
	pub generate: bool,
	pub max_conditions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ranking {
	pub match_epsilon: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Evaluation {
	pub cutoff: u32,
	#[serde(default)]
	pub variants: bool,
}

impl Default for Bm25 {
	fn default() -> Self {
		Self { k1: 1.5, b: 0.75, epsilon: 0.25 }
	}
}

impl Default for Conditions {
	fn default() -> Self {
		Self { generate: false, max_conditions: 32 }
	}
}

impl Default for Ranking {
	fn default() -> Self {
		Self { match_epsilon: 1e-9 }
	}
}

impl Default for Evaluation {
	fn default() -> Self {
		Self { cutoff: 10, variants: false }
	}
}

fn default_batch_size() -> u32 {
	32
}

fn default_criterion_min_chars() -> u32 {
	5
}
