use std::time::Duration;

use tokio::time::{self, Instant};

/// Spaces consecutive oracle calls at least `min_interval` apart.
#[derive(Debug)]
pub struct RateLimiter {
	min_interval: Duration,
	last_call: Option<Instant>,
}
impl RateLimiter {
	pub fn new(min_interval: Duration) -> Self {
		Self { min_interval, last_call: None }
	}

	pub fn from_millis(min_interval_ms: u64) -> Self {
		Self::new(Duration::from_millis(min_interval_ms))
	}

	/// Waits until the next call is allowed, then records it.
	pub async fn acquire(&mut self) {
		if let Some(last_call) = self.last_call {
			let ready_at = last_call + self.min_interval;

			if ready_at > Instant::now() {
				time::sleep_until(ready_at).await;
			}
		}

		self.last_call = Some(Instant::now());
	}
}
