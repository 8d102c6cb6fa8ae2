use ctm_config::EmbeddingProviderConfig;
use ctm_storage::KvStore;

use crate::{Corpus, EmbeddingProvider, Error, Result};

/// Exact inner-product index over one vector per trial.
#[derive(Debug, Clone)]
pub struct VectorIndex {
	ids: Vec<String>,
	vectors: Vec<Vec<f32>>,
	dimensions: usize,
}
impl VectorIndex {
	/// Embeds every trial not yet in `store`, one batch at a time. Each finished batch is
	/// persisted before the next request, so a failed build resumes where it stopped.
	pub async fn build(
		corpus: &Corpus,
		cfg: &EmbeddingProviderConfig,
		provider: &dyn EmbeddingProvider,
		store: &dyn KvStore,
	) -> Result<Self> {
		let namespace = format!("{}/{}", corpus.name(), cfg.model);
		let key = |trial_id: &str| format!("{namespace}/{trial_id}");
		let mut pending = Vec::new();

		for trial in corpus.trials() {
			if !store.contains(&key(&trial.id))? {
				pending.push(trial);
			}
		}

		if !pending.is_empty() {
			tracing::info!(
				corpus = corpus.name(),
				model = %cfg.model,
				pending = pending.len(),
				cached = corpus.len() - pending.len(),
				"Embedding trials."
			);
		}

		for batch in pending.chunks(cfg.batch_size.max(1) as usize) {
			let texts = batch.iter().map(|trial| trial.embedding_text()).collect::<Vec<_>>();
			let vectors = provider.embed(cfg, &texts).await?;

			if vectors.len() != batch.len() {
				return Err(Error::InvalidEmbedding {
					message: format!(
						"Provider returned {} vectors for {} trials.",
						vectors.len(),
						batch.len()
					),
				});
			}

			let mut entries = Vec::with_capacity(batch.len());

			for (trial, vector) in batch.iter().zip(vectors) {
				check_dimensions(&vector, cfg.dimensions as usize)?;

				entries.push((key(&trial.id), serde_json::to_value(vector)?));
			}

			store.insert_many_if_absent(entries)?;
		}

		let mut rows = Vec::with_capacity(corpus.len());

		for trial in corpus.trials() {
			let vector = ctm_storage::get_typed::<Vec<f32>>(store, &key(&trial.id))?.ok_or_else(|| {
				Error::InvalidEmbedding { message: format!("Missing cached vector for {}.", trial.id) }
			})?;

			rows.push((trial.id.clone(), vector));
		}

		Self::from_vectors(cfg.dimensions as usize, rows)
	}

	pub fn from_vectors(dimensions: usize, rows: Vec<(String, Vec<f32>)>) -> Result<Self> {
		let mut ids = Vec::with_capacity(rows.len());
		let mut vectors = Vec::with_capacity(rows.len());

		for (id, vector) in rows {
			check_dimensions(&vector, dimensions)?;

			ids.push(id);
			vectors.push(vector);
		}

		Ok(Self { ids, vectors, dimensions })
	}

	pub fn len(&self) -> usize {
		self.ids.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ids.is_empty()
	}

	/// Top `top_n` trials by inner product. Equal similarities keep insertion order.
	pub fn search(&self, query: &[f32], top_n: usize) -> Result<Vec<(String, f32)>> {
		check_dimensions(query, self.dimensions)?;

		let mut scored = self
			.vectors
			.iter()
			.enumerate()
			.map(|(idx, vector)| (idx, dot(query, vector)))
			.collect::<Vec<_>>();

		scored.sort_by(|(left_idx, left), (right_idx, right)| {
			crate::cmp_f64_desc(*left as f64, *right as f64).then_with(|| left_idx.cmp(right_idx))
		});

		Ok(scored.into_iter().take(top_n).map(|(idx, score)| (self.ids[idx].clone(), score)).collect())
	}

	/// Embeds `queries` with the query encoder and searches each one.
	pub async fn search_texts(
		&self,
		cfg: &EmbeddingProviderConfig,
		provider: &dyn EmbeddingProvider,
		queries: &[String],
		top_n: usize,
	) -> Result<Vec<Vec<(String, f32)>>> {
		let mut out = Vec::with_capacity(queries.len());

		for batch in queries.chunks(cfg.batch_size.max(1) as usize) {
			let vectors = provider.embed(cfg, batch).await?;

			if vectors.len() != batch.len() {
				return Err(Error::InvalidEmbedding {
					message: format!(
						"Provider returned {} vectors for {} queries.",
						vectors.len(),
						batch.len()
					),
				});
			}

			for vector in vectors {
				out.push(self.search(&vector, top_n)?);
			}
		}

		Ok(out)
	}
}

fn check_dimensions(vector: &[f32], expected: usize) -> Result<()> {
	if vector.len() != expected {
		return Err(Error::InvalidEmbedding {
			message: format!("Expected {expected} dimensions, got {}.", vector.len()),
		});
	}
	if vector.iter().any(|value| !value.is_finite()) {
		return Err(Error::InvalidEmbedding { message: "Vector contains a non-finite value.".to_string() });
	}

	Ok(())
}

fn dot(left: &[f32], right: &[f32]) -> f32 {
	left.iter().zip(right).map(|(a, b)| a * b).sum()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn search_orders_by_inner_product_with_stable_ties() {
		let index = VectorIndex::from_vectors(
			2,
			vec![
				("T1".to_string(), vec![0.0, 1.0]),
				("T2".to_string(), vec![1.0, 0.0]),
				("T3".to_string(), vec![1.0, 0.0]),
			],
		)
		.expect("index");
		let hits = index.search(&[1.0, 0.0], 2).expect("search");

		assert_eq!(hits, vec![("T2".to_string(), 1.0), ("T3".to_string(), 1.0)]);
	}

	#[test]
	fn dimension_mismatch_is_rejected() {
		let index =
			VectorIndex::from_vectors(2, vec![("T1".to_string(), vec![0.0, 1.0])]).expect("index");

		assert!(matches!(index.search(&[1.0], 1), Err(Error::InvalidEmbedding { .. })));
		assert!(VectorIndex::from_vectors(3, vec![("T1".to_string(), vec![0.0])]).is_err());
	}
}
