#![forbid(unsafe_code)]

use std::time::Duration;

use tracing::warn;

/// Tiered reconnect backoff.
///
/// Attempts are counted from 1. The first `tier_width` attempts wait
/// `short`, the next `tier_width` wait `medium`, everything after waits
/// `long`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub short: Duration,
	pub medium: Duration,
	pub long: Duration,
	pub tier_width: u32,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			short: Duration::from_secs(10),
			medium: Duration::from_secs(30),
			long: Duration::from_secs(60),
			tier_width: 10,
		}
	}
}

impl BackoffPolicy {
	pub fn new(short: Duration, medium: Duration, long: Duration, tier_width: u32) -> Self {
		Self {
			short,
			medium,
			long,
			tier_width,
		}
		.normalized()
	}

	/// Enforce `short <= medium <= long` and `tier_width >= 1`.
	pub fn normalized(mut self) -> Self {
		let mut tiers = [self.short, self.medium, self.long];
		if !tiers.is_sorted() {
			warn!(
				short_ms = self.short.as_millis() as u64,
				medium_ms = self.medium.as_millis() as u64,
				long_ms = self.long.as_millis() as u64,
				"backoff tiers out of order; sorting"
			);
			tiers.sort();
			[self.short, self.medium, self.long] = tiers;
		}

		if self.tier_width == 0 {
			warn!("backoff tier_width of 0 is meaningless; using 1");
			self.tier_width = 1;
		}

		self
	}

	/// Delay before reconnect attempt number `attempt` (counted from 1).
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let attempt = attempt.max(1);
		if attempt <= self.tier_width {
			self.short
		} else if attempt <= self.tier_width.saturating_mul(2) {
			self.medium
		} else {
			self.long
		}
	}
}
