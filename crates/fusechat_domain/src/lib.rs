#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Supported event sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
	Relay,
	TikTok,
}

impl EventSource {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventSource::Relay => "relay",
			EventSource::TikTok => "tiktok",
		}
	}
}

impl fmt::Display for EventSource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseSourceError {
	#[error("empty value")]
	Empty,
	#[error("unknown source: {0}")]
	UnknownSource(String),
}

impl FromStr for EventSource {
	type Err = ParseSourceError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseSourceError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"relay" | "youtube" | "yt" => Ok(EventSource::Relay),
			"tiktok" | "tik_tok" | "tt" => Ok(EventSource::TikTok),
			other => Err(ParseSourceError::UnknownSource(other.to_string())),
		}
	}
}

/// Canonical event kinds across both sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
	Chat,
	Gift,
	SuperChat,
	Donation,
	Share,
	Follow,
	Like,
	Join,
	System,
}

impl EventKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			EventKind::Chat => "chat",
			EventKind::Gift => "gift",
			EventKind::SuperChat => "super_chat",
			EventKind::Donation => "donation",
			EventKind::Share => "share",
			EventKind::Follow => "follow",
			EventKind::Like => "like",
			EventKind::Join => "join",
			EventKind::System => "system",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Author of a chat event.
///
/// `display_name` already carries the source-specific fallback chain; an
/// event without any usable name arrives here as `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
	pub id: String,
	pub display_name: String,
	#[serde(default)]
	pub avatar_url: Option<String>,
	#[serde(default)]
	pub is_moderator: bool,
	#[serde(default)]
	pub is_verified: bool,
	#[serde(default)]
	pub is_subscriber: bool,
	#[serde(default)]
	pub is_owner: bool,
}

impl ChatUser {
	pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			display_name: display_name.into(),
			avatar_url: None,
			is_moderator: false,
			is_verified: false,
			is_subscriber: false,
			is_owner: false,
		}
	}

	/// Case-insensitive identity used for spam tracking and mute lookups.
	pub fn user_key(&self) -> String {
		self.display_name.to_lowercase()
	}
}

/// Inline emote placement within a message.
///
/// Indices are inclusive UTF-16 code-unit offsets into the message text.
/// Sources may omit either index; such spans are ignored during splicing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmoteSpan {
	#[serde(default)]
	pub start_index: Option<u32>,
	#[serde(default)]
	pub end_index: Option<u32>,
	pub image_url: String,
	pub name: String,
}

/// Normalized event from any source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
	pub id: Uuid,
	pub source: EventSource,
	pub kind: EventKind,
	pub user: ChatUser,
	pub text: String,
	#[serde(default)]
	pub emotes: Vec<EmoteSpan>,
	/// Diamonds for gifts, like counts for likes; `None` elsewhere.
	#[serde(default)]
	pub metric: Option<u64>,
	pub timestamp: DateTime<Utc>,
}

impl ChatEvent {
	pub fn new(source: EventSource, kind: EventKind, user: ChatUser, text: impl Into<String>) -> Self {
		Self {
			id: Uuid::new_v4(),
			source,
			kind,
			user,
			text: text.into(),
			emotes: Vec::new(),
			metric: None,
			timestamp: Utc::now(),
		}
	}

	pub fn with_metric(mut self, metric: u64) -> Self {
		self.metric = Some(metric);
		self
	}

	pub fn with_emotes(mut self, emotes: Vec<EmoteSpan>) -> Self {
		self.emotes = emotes;
		self
	}
}

/// One rendered piece of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSegment {
	Text(String),
	Emote { url: String, name: String },
}

/// Splice emote spans into the message text.
///
/// Spans are sorted by start index; spans missing an index, overlapping a
/// previous span, or pointing past the end of the text are skipped. Text
/// before, between and after spans is preserved verbatim.
pub fn segment_text(text: &str, emotes: &[EmoteSpan]) -> Vec<MessageSegment> {
	let mut spans: Vec<(u32, u32, &EmoteSpan)> = emotes
		.iter()
		.filter_map(|e| Some((e.start_index?, e.end_index?, e)))
		.collect();
	spans.sort_by_key(|(start, _, _)| *start);

	let mut out = Vec::new();
	let mut cursor = 0usize;

	for (start, end, emote) in spans {
		let (start, end) = (start as usize, end as usize);
		if start < cursor || end < start {
			continue;
		}
		// End index is inclusive, so the span occupies [start, end + 1).
		let (Some(start_b), Some(_)) = (byte_index_of_utf16(text, start), byte_index_of_utf16(text, end + 1)) else {
			continue;
		};
		let Some(cursor_b) = byte_index_of_utf16(text, cursor) else {
			break;
		};

		if cursor_b < start_b {
			out.push(MessageSegment::Text(text[cursor_b..start_b].to_string()));
		}
		out.push(MessageSegment::Emote {
			url: emote.image_url.clone(),
			name: emote.name.clone(),
		});
		cursor = end + 1;
	}

	if let Some(cursor_b) = byte_index_of_utf16(text, cursor)
		&& cursor_b < text.len()
	{
		out.push(MessageSegment::Text(text[cursor_b..].to_string()));
	}

	out
}

/// Map a UTF-16 code-unit offset to a byte offset.
///
/// Returns `None` when the offset is past the end of the text or lands
/// inside a surrogate pair.
fn byte_index_of_utf16(text: &str, target: usize) -> Option<usize> {
	if target == 0 {
		return Some(0);
	}

	let mut units = 0usize;
	for (byte_idx, ch) in text.char_indices() {
		if units == target {
			return Some(byte_idx);
		}
		if units > target {
			return None;
		}
		units += ch.len_utf16();
	}

	(units == target).then_some(text.len())
}
