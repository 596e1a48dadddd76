#![forbid(unsafe_code)]

use anyhow::bail;
use fusechat_domain::{ChatEvent, ChatUser, EmoteSpan, EventKind, EventSource};

use crate::relay::{RelayFrame, RelayUser};
use crate::tiktok::{LiveEvent, LiveUser};

/// Normalize a relay event frame.
///
/// `Ok(None)` means a recognized but non-displayable frame; `Err` means the
/// frame is malformed and should be logged and dropped.
pub fn normalize_relay_frame(frame: &RelayFrame) -> anyhow::Result<Option<ChatEvent>> {
	let data = &frame.data;
	let Some(user) = &data.user else {
		bail!("relay frame missing user");
	};

	let kind = match data.trigger_category.as_deref() {
		Some("YouTube/SuperChat") => EventKind::SuperChat,
		Some("YouTube/Donation") => EventKind::Donation,
		_ => EventKind::Chat,
	};

	let text = data
		.message
		.clone()
		.or_else(|| data.raw_input.clone())
		.unwrap_or_default();
	if kind == EventKind::Chat && text.trim().is_empty() {
		bail!("relay chat frame without text");
	}

	let emotes: Vec<EmoteSpan> = data
		.emotes
		.iter()
		.map(|e| EmoteSpan {
			start_index: e.start_index,
			end_index: e.end_index,
			image_url: e.image_url.clone().unwrap_or_default(),
			name: e.name.clone().unwrap_or_default(),
		})
		.collect();

	let event = ChatEvent::new(EventSource::Relay, kind, relay_user(user), text).with_emotes(emotes);
	Ok(Some(event))
}

fn relay_user(user: &RelayUser) -> ChatUser {
	let display = user
		.display
		.clone()
		.or_else(|| user.name.clone())
		.or_else(|| user.unique_id.clone())
		.unwrap_or_else(|| "Unknown".to_string());
	let id = user
		.id
		.clone()
		.or_else(|| user.unique_id.clone())
		.or_else(|| user.name.clone())
		.unwrap_or_else(|| display.clone());

	ChatUser {
		id,
		display_name: display,
		avatar_url: user.profile_image_url.clone(),
		is_moderator: user.is_moderator,
		is_verified: user.is_verified,
		is_subscriber: user.is_subscribed,
		is_owner: user.is_owner,
	}
}

/// Normalize a live session event.
///
/// Lifecycle events (`StreamEnd`, `Disconnected`, `Error`) are the
/// supervisor's concern and normalize to `Ok(None)`, as do intermediate
/// events of a gift streak.
pub fn normalize_live_event(ev: &LiveEvent) -> anyhow::Result<Option<ChatEvent>> {
	let event = match ev {
		LiveEvent::Chat { user, comment } => {
			if comment.trim().is_empty() {
				bail!("live chat event without text");
			}
			ChatEvent::new(EventSource::TikTok, EventKind::Chat, live_user(user), comment.clone())
		}

		LiveEvent::Gift {
			user,
			gift_id,
			gift_type,
			repeat_end,
			repeat_count,
			diamond_count,
			gift_name,
			extended_gift_name,
		} => {
			// Streakable gifts repeat until the final event carries the
			// total; only that one is displayed.
			if *gift_type == Some(1) && !repeat_end {
				return Ok(None);
			}

			let name = gift_name
				.clone()
				.or_else(|| extended_gift_name.clone())
				.unwrap_or_else(|| format!("Gift ID: {gift_id}"));
			let count = (*repeat_count).max(1);

			ChatEvent::new(
				EventSource::TikTok,
				EventKind::Gift,
				live_user(user),
				format!("sent {count}x {name}"),
			)
			.with_metric(diamond_count.unwrap_or(0))
		}

		LiveEvent::Share { user } => ChatEvent::new(EventSource::TikTok, EventKind::Share, live_user(user), "shared the stream!"),

		LiveEvent::Follow { user } => ChatEvent::new(EventSource::TikTok, EventKind::Follow, live_user(user), "is now following!"),

		LiveEvent::Like { user, like_count } => {
			ChatEvent::new(EventSource::TikTok, EventKind::Like, live_user(user), "liked the stream! \u{2764}\u{FE0F}")
				.with_metric(*like_count)
		}

		// Join text is replaced by the grouping stage downstream.
		LiveEvent::Member { user } => ChatEvent::new(EventSource::TikTok, EventKind::Join, live_user(user), "joined the stream!"),

		LiveEvent::StreamEnd | LiveEvent::Disconnected | LiveEvent::Error(_) => return Ok(None),
	};

	Ok(Some(event))
}

fn live_user(user: &LiveUser) -> ChatUser {
	let display = user
		.nickname
		.clone()
		.or_else(|| user.unique_id.clone())
		.unwrap_or_else(|| "Unknown".to_string());
	let id = user
		.unique_id
		.clone()
		.or_else(|| user.nickname.clone())
		.unwrap_or_else(|| display.clone());

	ChatUser {
		id,
		display_name: display,
		avatar_url: user.avatar_url.clone(),
		is_moderator: false,
		is_verified: user.verified,
		is_subscriber: false,
		is_owner: false,
	}
}
