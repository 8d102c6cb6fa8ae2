mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Bm25, Conditions, Config, Dataset, EmbeddingProviderConfig, Evaluation, LlmProviderConfig,
	Matching, Providers, Ranking, Retrieval, Service, Storage,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;

	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.dataset.name.trim().is_empty() {
		return Err(Error::Validation { message: "dataset.name must be non-empty.".to_string() });
	}
	if cfg.dataset.name.contains(['/', '\\']) {
		return Err(Error::Validation {
			message: "dataset.name must not contain path separators.".to_string(),
		});
	}
	if cfg.storage.cache_dir.as_os_str().is_empty() {
		return Err(Error::Validation {
			message: "storage.cache_dir must be non-empty.".to_string(),
		});
	}

	for (label, embedding) in [
		("corpus_embedding", &cfg.providers.corpus_embedding),
		("query_embedding", &cfg.providers.query_embedding),
	] {
		if embedding.dimensions == 0 {
			return Err(Error::Validation {
				message: format!("providers.{label}.dimensions must be greater than zero."),
			});
		}
		if embedding.batch_size == 0 {
			return Err(Error::Validation {
				message: format!("providers.{label}.batch_size must be greater than zero."),
			});
		}
	}

	if cfg.providers.corpus_embedding.dimensions != cfg.providers.query_embedding.dimensions {
		return Err(Error::Validation {
			message: "providers.corpus_embedding.dimensions must match providers.query_embedding.dimensions."
				.to_string(),
		});
	}

	for (label, key) in [
		("corpus_embedding", &cfg.providers.corpus_embedding.api_key),
		("query_embedding", &cfg.providers.query_embedding.api_key),
		("oracle", &cfg.providers.oracle.api_key),
	] {
		if key.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("Provider {label} api_key must be non-empty."),
			});
		}
	}

	if cfg.retrieval.fusion_k == 0 {
		return Err(Error::Validation {
			message: "retrieval.fusion_k must be greater than zero.".to_string(),
		});
	}
	if cfg.retrieval.ranker_depth == 0 {
		return Err(Error::Validation {
			message: "retrieval.ranker_depth must be greater than zero.".to_string(),
		});
	}
	if cfg.retrieval.candidate_limit == 0 {
		return Err(Error::Validation {
			message: "retrieval.candidate_limit must be greater than zero.".to_string(),
		});
	}

	for (label, weight) in [
		("lexical_weight", cfg.retrieval.lexical_weight),
		("dense_weight", cfg.retrieval.dense_weight),
	] {
		if !weight.is_finite() {
			return Err(Error::Validation {
				message: format!("retrieval.{label} must be a finite number."),
			});
		}
		if weight < 0.0 {
			return Err(Error::Validation {
				message: format!("retrieval.{label} must be zero or greater."),
			});
		}
	}

	if cfg.retrieval.lexical_weight == 0.0 && cfg.retrieval.dense_weight == 0.0 {
		return Err(Error::Validation {
			message: "At least one of retrieval.lexical_weight and retrieval.dense_weight must be greater than zero."
				.to_string(),
		});
	}

	let bm25 = &cfg.retrieval.bm25;

	if !bm25.k1.is_finite() || bm25.k1 <= 0.0 {
		return Err(Error::Validation {
			message: "retrieval.bm25.k1 must be a finite number greater than zero.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&bm25.b) {
		return Err(Error::Validation {
			message: "retrieval.bm25.b must be in the range 0.0-1.0.".to_string(),
		});
	}
	if !bm25.epsilon.is_finite() || bm25.epsilon < 0.0 {
		return Err(Error::Validation {
			message: "retrieval.bm25.epsilon must be a finite number zero or greater.".to_string(),
		});
	}
	if cfg.matching.criterion_min_chars == 0 {
		return Err(Error::Validation {
			message: "matching.criterion_min_chars must be greater than zero.".to_string(),
		});
	}

	if let Some(max) = cfg.matching.max_trials_per_patient
		&& max == 0
	{
		return Err(Error::Validation {
			message: "matching.max_trials_per_patient must be greater than zero.".to_string(),
		});
	}

	if cfg.conditions.max_conditions == 0 {
		return Err(Error::Validation {
			message: "conditions.max_conditions must be greater than zero.".to_string(),
		});
	}
	if !cfg.ranking.match_epsilon.is_finite() || cfg.ranking.match_epsilon <= 0.0 {
		return Err(Error::Validation {
			message: "ranking.match_epsilon must be a finite number greater than zero.".to_string(),
		});
	}
	if cfg.evaluation.cutoff == 0 {
		return Err(Error::Validation {
			message: "evaluation.cutoff must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg
		.dataset
		.conditions_path
		.as_deref()
		.map(|path| path.as_os_str().is_empty() || path.to_string_lossy().trim().is_empty())
		.unwrap_or(false)
	{
		cfg.dataset.conditions_path = None;
	}

	cfg.dataset.name = cfg.dataset.name.trim().to_string();
}
