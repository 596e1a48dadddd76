#![forbid(unsafe_code)]

use std::fmt;

use fusechat_domain::{ChatEvent, EventKind};
use tokio::time::Instant;

use crate::cooldown::{CooldownEngine, JoinOutcome};

/// Per-kind display switches and list filters.
#[derive(Debug, Clone)]
pub struct FilterSettings {
	/// Exact display-name matches that are dropped outright.
	pub blocked_users: Vec<String>,
	pub hide_commands: bool,
	pub show_chats: bool,
	pub show_gifts: bool,
	pub show_likes: bool,
	pub show_joins: bool,
	pub show_shares: bool,
	pub show_follows: bool,
	pub min_diamonds_to_show: u64,
	/// Likes at or below this count never surface.
	pub min_likes_to_show: u64,
}

impl Default for FilterSettings {
	fn default() -> Self {
		Self {
			blocked_users: Vec::new(),
			hide_commands: false,
			show_chats: true,
			show_gifts: true,
			show_likes: true,
			show_joins: true,
			show_shares: true,
			show_follows: true,
			min_diamonds_to_show: 0,
			min_likes_to_show: 10,
		}
	}
}

/// Why an event was not delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	Blocked,
	Command,
	KindDisabled,
	BelowGiftMinimum,
	BelowLikeMinimum,
	LikeCooldown,
	Spam,
}

impl DropReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			DropReason::Blocked => "blocked",
			DropReason::Command => "command",
			DropReason::KindDisabled => "kind_disabled",
			DropReason::BelowGiftMinimum => "below_gift_minimum",
			DropReason::BelowLikeMinimum => "below_like_minimum",
			DropReason::LikeCooldown => "like_cooldown",
			DropReason::Spam => "spam",
		}
	}
}

impl fmt::Display for DropReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Pipeline outcome for one event.
#[derive(Debug)]
pub enum Verdict {
	Deliver(ChatEvent),
	/// Absorbed for now (queued join); surfaces later via a flush.
	Deferred,
	Drop(DropReason),
}

/// Ordered, short-circuiting policy stages over normalized events.
#[derive(Debug)]
pub struct FilterPipeline {
	settings: FilterSettings,
	cooldown: CooldownEngine,
}

impl FilterPipeline {
	pub fn new(settings: FilterSettings, cooldown: CooldownEngine) -> Self {
		Self { settings, cooldown }
	}

	pub fn apply(&mut self, event: ChatEvent, now: Instant) -> Verdict {
		if self.settings.blocked_users.iter().any(|b| *b == event.user.display_name) {
			return Verdict::Drop(DropReason::Blocked);
		}

		if self.settings.hide_commands && event.kind == EventKind::Chat && event.text.starts_with('!') {
			return Verdict::Drop(DropReason::Command);
		}

		match event.kind {
			EventKind::Chat if !self.settings.show_chats => return Verdict::Drop(DropReason::KindDisabled),
			EventKind::Gift => {
				if !self.settings.show_gifts {
					return Verdict::Drop(DropReason::KindDisabled);
				}
				if event.metric.unwrap_or(0) < self.settings.min_diamonds_to_show {
					return Verdict::Drop(DropReason::BelowGiftMinimum);
				}
			}
			EventKind::Like => {
				if !self.settings.show_likes {
					return Verdict::Drop(DropReason::KindDisabled);
				}
				if event.metric.unwrap_or(0) <= self.settings.min_likes_to_show {
					return Verdict::Drop(DropReason::BelowLikeMinimum);
				}
			}
			EventKind::Join if !self.settings.show_joins => return Verdict::Drop(DropReason::KindDisabled),
			EventKind::Share if !self.settings.show_shares => return Verdict::Drop(DropReason::KindDisabled),
			EventKind::Follow if !self.settings.show_follows => return Verdict::Drop(DropReason::KindDisabled),
			// SuperChat, Donation and System always pass.
			_ => {}
		}

		match event.kind {
			EventKind::Join => match self.cooldown.note_join(&event.user.display_name, now) {
				JoinOutcome::PassThrough => Verdict::Deliver(event),
				JoinOutcome::Queued => Verdict::Deferred,
				JoinOutcome::Flush(grouped) => Verdict::Deliver(grouped),
			},
			EventKind::Like => {
				if self.cooldown.allow_like(now) {
					Verdict::Deliver(event)
				} else {
					Verdict::Drop(DropReason::LikeCooldown)
				}
			}
			EventKind::Chat => {
				if self.cooldown.register_chat(&event.user.user_key(), now) {
					Verdict::Drop(DropReason::Spam)
				} else {
					Verdict::Deliver(event)
				}
			}
			_ => Verdict::Deliver(event),
		}
	}

	/// Periodic join flush, driven by the dispatcher's interval.
	pub fn flush_joins(&mut self, now: Instant) -> Option<ChatEvent> {
		self.cooldown.flush_joins(now)
	}

	/// Periodic housekeeping for idle spam-tracking state.
	pub fn sweep(&mut self, now: Instant) {
		self.cooldown.sweep_idle_chatters(now);
	}
}

#[cfg(test)]
mod tests {
	use fusechat_domain::{ChatUser, EventSource};

	use super::*;
	use crate::cooldown::CooldownSettings;

	fn pipeline(settings: FilterSettings) -> FilterPipeline {
		FilterPipeline::new(settings, CooldownEngine::new(CooldownSettings::default()))
	}

	fn chat(name: &str, text: &str) -> ChatEvent {
		ChatEvent::new(EventSource::Relay, EventKind::Chat, ChatUser::new("u1", name), text)
	}

	fn kind_event(kind: EventKind, metric: Option<u64>) -> ChatEvent {
		let mut ev = ChatEvent::new(EventSource::TikTok, kind, ChatUser::new("u1", "Fan"), "x");
		ev.metric = metric;
		ev
	}

	#[tokio::test(start_paused = true)]
	async fn blocked_users_are_dropped() {
		let mut p = pipeline(FilterSettings {
			blocked_users: vec!["Troll".to_string()],
			..FilterSettings::default()
		});
		let verdict = p.apply(chat("Troll", "hi"), Instant::now());
		assert!(matches!(verdict, Verdict::Drop(DropReason::Blocked)));

		// The match is exact, not case-insensitive.
		let verdict = p.apply(chat("troll", "hi"), Instant::now());
		assert!(matches!(verdict, Verdict::Deliver(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn command_hiding_only_affects_chat() {
		let mut p = pipeline(FilterSettings {
			hide_commands: true,
			..FilterSettings::default()
		});
		let verdict = p.apply(chat("Fan", "!so friend"), Instant::now());
		assert!(matches!(verdict, Verdict::Drop(DropReason::Command)));

		let mut gift = kind_event(EventKind::Gift, Some(5));
		gift.text = "!looks like a command".to_string();
		assert!(matches!(p.apply(gift, Instant::now()), Verdict::Deliver(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn gift_minimum_applies() {
		let mut p = pipeline(FilterSettings {
			min_diamonds_to_show: 10,
			..FilterSettings::default()
		});
		let verdict = p.apply(kind_event(EventKind::Gift, Some(9)), Instant::now());
		assert!(matches!(verdict, Verdict::Drop(DropReason::BelowGiftMinimum)));
		let verdict = p.apply(kind_event(EventKind::Gift, Some(10)), Instant::now());
		assert!(matches!(verdict, Verdict::Deliver(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn small_like_bursts_stay_hidden() {
		let mut p = pipeline(FilterSettings::default());
		let verdict = p.apply(kind_event(EventKind::Like, Some(10)), Instant::now());
		assert!(matches!(verdict, Verdict::Drop(DropReason::BelowLikeMinimum)));
		let verdict = p.apply(kind_event(EventKind::Like, Some(11)), Instant::now());
		assert!(matches!(verdict, Verdict::Deliver(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn like_cooldown_drops_followups() {
		let mut p = pipeline(FilterSettings::default());
		let now = Instant::now();
		assert!(matches!(p.apply(kind_event(EventKind::Like, Some(50)), now), Verdict::Deliver(_)));
		assert!(matches!(
			p.apply(kind_event(EventKind::Like, Some(50)), now),
			Verdict::Drop(DropReason::LikeCooldown)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn super_chats_pass_when_chats_are_hidden() {
		let mut p = pipeline(FilterSettings {
			show_chats: false,
			..FilterSettings::default()
		});
		assert!(matches!(
			p.apply(chat("Fan", "hi"), Instant::now()),
			Verdict::Drop(DropReason::KindDisabled)
		));
		let verdict = p.apply(kind_event(EventKind::SuperChat, None), Instant::now());
		assert!(matches!(verdict, Verdict::Deliver(_)));
	}

	#[tokio::test(start_paused = true)]
	async fn kth_message_passes_and_k_plus_first_is_spam() {
		let mut p = pipeline(FilterSettings::default());
		let now = Instant::now();
		for i in 0..5 {
			let verdict = p.apply(chat("Fan", "spam spam"), now);
			assert!(matches!(verdict, Verdict::Deliver(_)), "message {} should pass", i + 1);
		}
		let verdict = p.apply(chat("Fan", "spam spam"), now);
		assert!(matches!(verdict, Verdict::Drop(DropReason::Spam)));

		// Spam identity is case-insensitive.
		let verdict = p.apply(chat("FAN", "spam spam"), now);
		assert!(matches!(verdict, Verdict::Drop(DropReason::Spam)));
	}

	#[tokio::test(start_paused = true)]
	async fn joins_defer_and_flush_groups() {
		let mut p = pipeline(FilterSettings::default());
		let now = Instant::now();
		assert!(matches!(p.apply(kind_event(EventKind::Join, None), now), Verdict::Deferred));
		let grouped = p.flush_joins(now).expect("grouped join");
		assert_eq!(grouped.kind, EventKind::System);
	}
}
