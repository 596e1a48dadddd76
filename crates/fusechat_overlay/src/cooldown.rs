#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use fusechat_domain::{ChatEvent, ChatUser, EventKind, EventSource};
use tokio::time::Instant;

/// Pending joins flush immediately once this many are queued.
const JOIN_FLUSH_THRESHOLD: usize = 3;

/// Cooldown and grouping configuration.
#[derive(Debug, Clone)]
pub struct CooldownSettings {
	pub enabled: bool,
	/// Minimum gap between emitted join group messages.
	pub join_cooldown: Duration,
	/// Joins older than this are discarded at flush time.
	pub join_group_window: Duration,
	pub like_cooldown: Duration,
	pub spam: SpamSettings,
}

impl Default for CooldownSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			join_cooldown: Duration::from_millis(5_000),
			join_group_window: Duration::from_millis(10_000),
			like_cooldown: Duration::from_millis(3_000),
			spam: SpamSettings::default(),
		}
	}
}

/// Sliding-window spam detection configuration.
#[derive(Debug, Clone)]
pub struct SpamSettings {
	pub enabled: bool,
	pub max_messages_per_user: usize,
	pub time_window: Duration,
}

impl Default for SpamSettings {
	fn default() -> Self {
		Self {
			enabled: true,
			max_messages_per_user: 5,
			time_window: Duration::from_millis(10_000),
		}
	}
}

/// Outcome of handing a join to the engine.
#[derive(Debug)]
pub enum JoinOutcome {
	/// Grouping disabled; the individual join passes through.
	PassThrough,
	/// Queued for a later flush.
	Queued,
	/// The queue hit the threshold; a grouped message is ready now.
	Flush(ChatEvent),
}

/// Owns all rate and grouping state. Callers supply `now` so tests stay
/// deterministic.
#[derive(Debug)]
pub struct CooldownEngine {
	cfg: CooldownSettings,
	pending_joins: Vec<(String, Instant)>,
	last_join_group: Option<Instant>,
	last_like: Option<Instant>,
	chat_times: HashMap<String, VecDeque<Instant>>,
}

impl CooldownEngine {
	pub fn new(cfg: CooldownSettings) -> Self {
		Self {
			cfg,
			pending_joins: Vec::new(),
			last_join_group: None,
			last_like: None,
			chat_times: HashMap::new(),
		}
	}

	/// Record a join. Returns a grouped message early when the pending
	/// queue reaches the flush threshold.
	pub fn note_join(&mut self, display_name: &str, now: Instant) -> JoinOutcome {
		if !self.cfg.enabled {
			return JoinOutcome::PassThrough;
		}

		self.pending_joins.push((display_name.to_string(), now));

		if self.pending_joins.len() >= JOIN_FLUSH_THRESHOLD
			&& let Some(grouped) = self.flush_joins(now)
		{
			return JoinOutcome::Flush(grouped);
		}

		JoinOutcome::Queued
	}

	/// Flush pending joins into at most one grouped system message.
	///
	/// Stale entries (age not strictly less than the group window) are
	/// discarded first. A flush inside the join cooldown leaves the queue
	/// pending for the next tick.
	pub fn flush_joins(&mut self, now: Instant) -> Option<ChatEvent> {
		if !self.cfg.enabled {
			return None;
		}

		self.pending_joins
			.retain(|(_, t)| now.duration_since(*t) < self.cfg.join_group_window);
		if self.pending_joins.is_empty() {
			return None;
		}

		if let Some(last) = self.last_join_group
			&& now.duration_since(last) < self.cfg.join_cooldown
		{
			return None;
		}

		let names: Vec<String> = self.pending_joins.drain(..).map(|(name, _)| name).collect();
		self.last_join_group = Some(now);

		let text = if names.len() == 1 {
			format!("{} joined the stream! \u{1F44B}", names[0])
		} else {
			format!("{} users joined: {} \u{1F44B}", names.len(), names.join(", "))
		};

		Some(ChatEvent::new(
			EventSource::TikTok,
			EventKind::System,
			ChatUser::new("system", "System"),
			text,
		))
	}

	/// Whether a like may surface right now; records the pass.
	pub fn allow_like(&mut self, now: Instant) -> bool {
		if !self.cfg.enabled {
			return true;
		}

		match self.last_like {
			Some(last) if now.duration_since(last) < self.cfg.like_cooldown => false,
			_ => {
				self.last_like = Some(now);
				true
			}
		}
	}

	/// Record a chat message for `user_key`. Returns true when the message
	/// breaches the per-user sliding window.
	pub fn register_chat(&mut self, user_key: &str, now: Instant) -> bool {
		if !self.cfg.enabled || !self.cfg.spam.enabled {
			return false;
		}

		let window = self.cfg.spam.time_window;
		let times = self.chat_times.entry(user_key.to_string()).or_default();
		while let Some(front) = times.front() {
			if now.duration_since(*front) < window {
				break;
			}
			times.pop_front();
		}
		times.push_back(now);

		times.len() > self.cfg.spam.max_messages_per_user
	}

	/// Drop spam-tracking state for users idle past the window, so the map
	/// does not grow with chatter turnover.
	pub fn sweep_idle_chatters(&mut self, now: Instant) {
		let window = self.cfg.spam.time_window;
		self.chat_times.retain(|_, times| {
			while let Some(front) = times.front() {
				if now.duration_since(*front) < window {
					break;
				}
				times.pop_front();
			}
			!times.is_empty()
		});
	}
}
