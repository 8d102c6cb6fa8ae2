use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use ctm_config::Bm25;
use ctm_domain::text;
use ctm_storage::KvStore;

use crate::{Corpus, Error, Result};

/// Okapi BM25 over one weighted token multiset per trial.
#[derive(Debug, Clone)]
pub struct LexicalIndex {
	doc_ids: Vec<String>,
	doc_lens: Vec<f64>,
	avg_doc_len: f64,
	postings: HashMap<String, Vec<(usize, u32)>>,
	idf: HashMap<String, f64>,
	params: Bm25,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenizedDoc {
	id: String,
	tokens: Vec<String>,
}

impl LexicalIndex {
	pub fn build(corpus: &Corpus, params: &Bm25) -> Result<Self> {
		let docs = corpus
			.trials()
			.iter()
			.map(|trial| (trial.id.clone(), trial.weighted_tokens()))
			.collect::<Vec<_>>();

		Self::from_documents(corpus.name(), docs, params)
	}

	/// Reuses the tokenized corpus persisted under the corpus name and fingerprint, tokenizing
	/// and persisting it on first use.
	pub fn load_or_build(corpus: &Corpus, params: &Bm25, store: &dyn KvStore) -> Result<Self> {
		let key = format!("{}/{}", corpus.name(), corpus.fingerprint()?);

		if let Some(docs) = ctm_storage::get_typed::<Vec<TokenizedDoc>>(store, &key)? {
			tracing::info!(corpus = corpus.name(), docs = docs.len(), "Loaded cached lexical index.");

			return Self::from_documents(
				corpus.name(),
				docs.into_iter().map(|doc| (doc.id, doc.tokens)).collect(),
				params,
			);
		}

		let docs = corpus
			.trials()
			.iter()
			.map(|trial| TokenizedDoc { id: trial.id.clone(), tokens: trial.weighted_tokens() })
			.collect::<Vec<_>>();

		ctm_storage::insert_typed(store, &key, &docs)?;

		tracing::info!(corpus = corpus.name(), docs = docs.len(), "Built lexical index.");

		Self::from_documents(
			corpus.name(),
			docs.into_iter().map(|doc| (doc.id, doc.tokens)).collect(),
			params,
		)
	}

	/// Documents without tokens are skipped. Fails when nothing is left to index.
	pub fn from_documents(name: &str, docs: Vec<(String, Vec<String>)>, params: &Bm25) -> Result<Self> {
		let mut doc_ids = Vec::with_capacity(docs.len());
		let mut doc_lens = Vec::with_capacity(docs.len());
		let mut postings: HashMap<String, Vec<(usize, u32)>> = HashMap::new();

		for (id, tokens) in docs {
			if tokens.is_empty() {
				tracing::warn!(trial_id = %id, "Trial has no indexable tokens. Skipping.");

				continue;
			}

			let doc_idx = doc_ids.len();
			let mut freqs: HashMap<String, u32> = HashMap::new();

			doc_lens.push(tokens.len() as f64);

			for token in tokens {
				*freqs.entry(token).or_insert(0) += 1;
			}
			for (token, tf) in freqs {
				postings.entry(token).or_default().push((doc_idx, tf));
			}

			doc_ids.push(id);
		}

		if doc_ids.is_empty() {
			return Err(Error::EmptyCorpus { name: name.to_string() });
		}

		for list in postings.values_mut() {
			list.sort_unstable_by_key(|(doc_idx, _)| *doc_idx);
		}

		let avg_doc_len = doc_lens.iter().sum::<f64>() / doc_lens.len() as f64;
		let idf = compute_idf(doc_ids.len(), &postings, params.epsilon as f64);

		Ok(Self { doc_ids, doc_lens, avg_doc_len, postings, idf, params: params.clone() })
	}

	pub fn len(&self) -> usize {
		self.doc_ids.len()
	}

	pub fn is_empty(&self) -> bool {
		self.doc_ids.is_empty()
	}

	/// Top `top_n` trials for `query`, best first. Trials sharing no token with the query are not
	/// returned. Equal scores keep corpus order.
	pub fn search(&self, query: &str, top_n: usize) -> Vec<(String, f64)> {
		let k1 = self.params.k1 as f64;
		let b = self.params.b as f64;
		let mut scores: HashMap<usize, f64> = HashMap::new();

		for token in text::tokenize(query) {
			let Some(list) = self.postings.get(&token) else { continue };
			let idf = self.idf.get(&token).copied().unwrap_or(0.0);

			for (doc_idx, tf) in list {
				let tf = *tf as f64;
				let norm = 1.0 - b + b * self.doc_lens[*doc_idx] / self.avg_doc_len;

				*scores.entry(*doc_idx).or_insert(0.0) += idf * (tf * (k1 + 1.0)) / (tf + k1 * norm);
			}
		}

		let mut ranked = scores.into_iter().collect::<Vec<_>>();

		ranked.sort_by(|(left_idx, left), (right_idx, right)| {
			crate::cmp_f64_desc(*left, *right).then_with(|| left_idx.cmp(right_idx))
		});

		ranked
			.into_iter()
			.take(top_n)
			.map(|(doc_idx, score)| (self.doc_ids[doc_idx].clone(), score))
			.collect()
	}
}

/// Robertson idf. Negative values are floored at `epsilon` times the mean idf.
fn compute_idf(
	doc_count: usize,
	postings: &HashMap<String, Vec<(usize, u32)>>,
	epsilon: f64,
) -> HashMap<String, f64> {
	let n = doc_count as f64;
	let mut idf = HashMap::with_capacity(postings.len());
	let mut idf_sum = 0.0;
	let mut negative = Vec::new();
	let mut tokens = postings.iter().collect::<Vec<_>>();

	// Fixed summation order keeps the floor identical across runs.
	tokens.sort_unstable_by(|(left, _), (right, _)| left.cmp(right));

	for (token, list) in tokens {
		let df = list.len() as f64;
		let value = (n - df + 0.5).ln() - (df + 0.5).ln();

		idf_sum += value;

		if value < 0.0 {
			negative.push(token.clone());
		}

		idf.insert(token.clone(), value);
	}

	let floor = epsilon * idf_sum / postings.len().max(1) as f64;

	for token in negative {
		idf.insert(token, floor);
	}

	idf
}
