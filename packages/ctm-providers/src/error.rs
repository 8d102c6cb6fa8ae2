pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	InvalidHeaderName(#[from] reqwest::header::InvalidHeaderName),
	#[error(transparent)]
	InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
	#[error("{message}")]
	InvalidConfig { message: String },
	#[error("{message}")]
	InvalidResponse { message: String },
}
impl Error {
	/// Whether repeating the same request later may succeed.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Reqwest(err) => {
				if err.is_timeout() || err.is_connect() {
					return true;
				}

				match err.status() {
					Some(status) => status.as_u16() == 429 || status.is_server_error(),
					None => err.is_request() || err.is_body() || err.is_decode(),
				}
			},
			Self::SerdeJson(_)
			| Self::InvalidHeaderName(_)
			| Self::InvalidHeaderValue(_)
			| Self::InvalidConfig { .. }
			| Self::InvalidResponse { .. } => false,
		}
	}
}
