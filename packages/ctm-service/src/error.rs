use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Failed to read dataset file at {path:?}: {source}")]
	ReadDataset { path: PathBuf, source: std::io::Error },
	#[error("Invalid dataset file at {path:?}: {message}")]
	InvalidDataset { path: PathBuf, message: String },
	#[error("Corpus {name} has no indexable trials.")]
	EmptyCorpus { name: String },
	#[error("Invalid embedding: {message}")]
	InvalidEmbedding { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error(transparent)]
	Storage(#[from] ctm_storage::Error),
	#[error(transparent)]
	Provider(#[from] ctm_providers::Error),
	#[error(transparent)]
	Oracle(#[from] crate::OracleError),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
}
