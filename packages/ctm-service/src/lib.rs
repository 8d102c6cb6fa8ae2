pub mod assessment;
pub mod conditions;
pub mod dataset;
pub mod fusion;
pub mod lexical;
pub mod matching;
pub mod oracle;
pub mod pipeline;
pub mod ranking;
pub mod retrieval;
pub mod scoring;
pub mod throttle;
pub mod vector;

mod error;

pub use dataset::{Corpus, Dataset, PatientQuery};
pub use error::{Error, Result};
pub use fusion::{FusedCandidate, HybridFusionRetriever};
pub use lexical::LexicalIndex;
pub use oracle::{ConditionGenerator, EligibilityOracle, LlmOracle, OracleError};
pub use pipeline::{Caches, Pipeline};
pub use scoring::{AggregationScorer, MatchScorer, ScoreVariant};
pub use vector::VectorIndex;

use std::{future::Future, pin::Pin, sync::Arc};

use serde_json::Value;

use ctm_config::{EmbeddingProviderConfig, LlmProviderConfig};
use ctm_providers::{chat, embedding};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, ctm_providers::Result<Vec<Vec<f32>>>>;
}

pub trait ChatProvider
where
	Self: Send + Sync,
{
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, ctm_providers::Result<String>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub chat: Arc<dyn ChatProvider>,
}
impl Providers {
	pub fn new(embedding: Arc<dyn EmbeddingProvider>, chat: Arc<dyn ChatProvider>) -> Self {
		Self { embedding, chat }
	}
}

impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), chat: provider }
	}
}

struct DefaultProviders;

impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, ctm_providers::Result<Vec<Vec<f32>>>> {
		Box::pin(embedding::embed(cfg, texts))
	}
}

impl ChatProvider for DefaultProviders {
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [Value],
	) -> BoxFuture<'a, ctm_providers::Result<String>> {
		Box::pin(chat::complete(cfg, messages))
	}
}

/// Descending order for scores. `-0.0` and `0.0` compare equal and NaN sorts last.
pub fn cmp_f64_desc(a: f64, b: f64) -> std::cmp::Ordering {
	match (a.is_nan(), b.is_nan()) {
		(true, true) => std::cmp::Ordering::Equal,
		(true, false) => std::cmp::Ordering::Greater,
		(false, true) => std::cmp::Ordering::Less,
		(false, false) => b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal),
	}
}
