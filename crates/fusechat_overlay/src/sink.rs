#![forbid(unsafe_code)]

use fusechat_domain::{ChatEvent, EventKind};
use fusechat_source::SourceStatus;
use tracing::info;
use uuid::Uuid;

use crate::buffer::{DisplayMessage, EvictReason};
use crate::filter::DropReason;

/// Consumer of buffer mutations, connection status and drop diagnostics.
pub trait RenderSink: Send {
	fn message_inserted(&mut self, msg: &DisplayMessage);
	fn message_evicted(&mut self, id: Uuid, reason: EvictReason);
	fn status_changed(&mut self, status: &SourceStatus);

	/// Diagnostic for an event dropped by policy (spam, blocked, ...).
	fn event_dropped(&mut self, _user: &str, _reason: DropReason) {}
}

/// Sound cue file names per event kind. An empty name disables the cue.
#[derive(Debug, Clone)]
pub struct SoundSettings {
	pub chat: String,
	pub gift: String,
	pub super_chat: String,
	pub donation: String,
	pub follow: String,
	pub share: String,
}

impl Default for SoundSettings {
	fn default() -> Self {
		Self {
			chat: "message.mp3".to_string(),
			gift: "gift.mp3".to_string(),
			super_chat: "superchat.mp3".to_string(),
			donation: "donation.mp3".to_string(),
			follow: "follow.mp3".to_string(),
			share: "share.mp3".to_string(),
		}
	}
}

impl SoundSettings {
	fn cue_for(&self, kind: EventKind) -> Option<&str> {
		let name = match kind {
			EventKind::Chat => &self.chat,
			EventKind::Gift => &self.gift,
			EventKind::SuperChat => &self.super_chat,
			EventKind::Donation => &self.donation,
			EventKind::Follow => &self.follow,
			EventKind::Share => &self.share,
			EventKind::Like | EventKind::Join | EventKind::System => return None,
		};
		(!name.trim().is_empty()).then_some(name.as_str())
	}
}

/// Pick the sound cue for an event, honoring mutes.
///
/// Muted users still display; only their cue is suppressed. `muted_users`
/// holds lowercase keys.
pub fn sound_cue<'a>(sounds: &'a SoundSettings, muted_users: &[String], event: &ChatEvent) -> Option<&'a str> {
	if muted_users.iter().any(|m| *m == event.user.user_key()) {
		return None;
	}
	sounds.cue_for(event.kind)
}

/// Structured-log sink; stands in for the overlay window.
#[derive(Debug)]
pub struct LogSink {
	sounds: SoundSettings,
	muted_users: Vec<String>,
}

impl LogSink {
	pub fn new(sounds: SoundSettings, muted_users: Vec<String>) -> Self {
		Self { sounds, muted_users }
	}
}

impl RenderSink for LogSink {
	fn message_inserted(&mut self, msg: &DisplayMessage) {
		let sound = sound_cue(&self.sounds, &self.muted_users, &msg.event);
		info!(
			id = %msg.id,
			source = %msg.event.source,
			kind = %msg.event.kind,
			user = %msg.event.user.display_name,
			text = %msg.event.text,
			metric = msg.event.metric,
			sound,
			"message shown"
		);
	}

	fn message_evicted(&mut self, id: Uuid, reason: EvictReason) {
		info!(%id, reason = reason.as_str(), "message removed");
	}

	fn status_changed(&mut self, status: &SourceStatus) {
		info!(
			source = %status.source,
			state = %status.state,
			detail = %status.detail,
			last_error = status.last_error.as_deref(),
			"source status"
		);
	}

	fn event_dropped(&mut self, user: &str, reason: DropReason) {
		info!(user, reason = reason.as_str(), "event dropped");
	}
}

#[cfg(test)]
mod tests {
	use fusechat_domain::{ChatUser, EventSource};

	use super::*;

	fn event(kind: EventKind, name: &str) -> ChatEvent {
		ChatEvent::new(EventSource::TikTok, kind, ChatUser::new("u1", name), "x")
	}

	#[test]
	fn cues_follow_the_kind() {
		let sounds = SoundSettings::default();
		assert_eq!(sound_cue(&sounds, &[], &event(EventKind::Gift, "Fan")), Some("gift.mp3"));
		assert_eq!(sound_cue(&sounds, &[], &event(EventKind::Join, "Fan")), None);
	}

	#[test]
	fn muted_users_lose_the_cue_only() {
		let sounds = SoundSettings::default();
		let muted = vec!["loudfan".to_string()];
		assert_eq!(sound_cue(&sounds, &muted, &event(EventKind::Chat, "LoudFan")), None);
		assert_eq!(
			sound_cue(&sounds, &muted, &event(EventKind::Chat, "OtherFan")),
			Some("message.mp3")
		);
	}

	#[test]
	fn empty_name_disables_the_cue() {
		let sounds = SoundSettings {
			chat: String::new(),
			..SoundSettings::default()
		};
		assert_eq!(sound_cue(&sounds, &[], &event(EventKind::Chat, "Fan")), None);
	}
}
