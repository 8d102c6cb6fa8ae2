pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Response is not valid JSON: {message}")]
	InvalidJson { message: String },
	#[error("Response has an unexpected shape: {message}")]
	UnexpectedShape { message: String },
}
