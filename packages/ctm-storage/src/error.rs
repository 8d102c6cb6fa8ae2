use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Failed to access cache file at {path:?}: {source}")]
	Io { path: PathBuf, source: std::io::Error },
	#[error("Cache file at {path:?} is corrupt: {source}")]
	Corrupt { path: PathBuf, source: serde_json::Error },
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error("Invalid cached value for {key}: {message}")]
	InvalidValue { key: String, message: String },
}
