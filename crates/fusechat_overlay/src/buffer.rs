#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::time::Duration;

use fusechat_domain::ChatEvent;
use tokio::time::Instant;
use uuid::Uuid;

use crate::sink::RenderSink;

/// Display buffer configuration.
#[derive(Debug, Clone)]
pub struct BufferSettings {
	pub max_messages: usize,
	pub auto_remove: bool,
	pub remove_after: Duration,
}

impl Default for BufferSettings {
	fn default() -> Self {
		Self {
			max_messages: 100,
			auto_remove: true,
			remove_after: Duration::from_secs(30),
		}
	}
}

/// A message currently on screen.
#[derive(Debug, Clone)]
pub struct DisplayMessage {
	pub id: Uuid,
	pub event: ChatEvent,
	pub inserted_at: Instant,
	pub expires_at: Option<Instant>,
}

/// Why a message left the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
	Capacity,
	Expired,
}

impl EvictReason {
	pub const fn as_str(self) -> &'static str {
		match self {
			EvictReason::Capacity => "capacity",
			EvictReason::Expired => "expired",
		}
	}
}

/// Bounded FIFO of on-screen messages. Every mutation notifies the sink;
/// entries leave exactly once (single ownership in the deque).
#[derive(Debug)]
pub struct MessageBuffer {
	cfg: BufferSettings,
	entries: VecDeque<DisplayMessage>,
}

impl MessageBuffer {
	pub fn new(cfg: BufferSettings) -> Self {
		Self {
			cfg,
			entries: VecDeque::new(),
		}
	}

	/// Insert a delivered event, evicting the oldest entries past capacity.
	pub fn insert(&mut self, event: ChatEvent, now: Instant, sink: &mut dyn RenderSink) {
		let expires_at = self.cfg.auto_remove.then(|| now + self.cfg.remove_after);
		let msg = DisplayMessage {
			id: event.id,
			event,
			inserted_at: now,
			expires_at,
		};

		while self.entries.len() + 1 > self.cfg.max_messages {
			let Some(oldest) = self.entries.pop_front() else {
				break;
			};
			sink.message_evicted(oldest.id, EvictReason::Capacity);
		}

		sink.message_inserted(&msg);
		self.entries.push_back(msg);
	}

	/// Earliest auto-remove deadline, if any. Entries age in insertion
	/// order, so the front holds it.
	pub fn next_expiry(&self) -> Option<Instant> {
		self.entries.front().and_then(|m| m.expires_at)
	}

	/// Evict every entry whose deadline has passed.
	pub fn expire_due(&mut self, now: Instant, sink: &mut dyn RenderSink) {
		while let Some(front) = self.entries.front() {
			match front.expires_at {
				Some(deadline) if deadline <= now => {
					let Some(expired) = self.entries.pop_front() else {
						break;
					};
					sink.message_evicted(expired.id, EvictReason::Expired);
				}
				_ => break,
			}
		}
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use fusechat_domain::{ChatUser, EventKind, EventSource};
	use tokio::time::advance;

	use super::*;
	use crate::sink::{RenderSink, SoundSettings, sound_cue};
	use fusechat_source::SourceStatus;

	#[derive(Debug, Default)]
	struct RecordingSink {
		inserted: Vec<Uuid>,
		evicted: Vec<(Uuid, EvictReason)>,
	}

	impl RenderSink for RecordingSink {
		fn message_inserted(&mut self, msg: &DisplayMessage) {
			self.inserted.push(msg.id);
		}

		fn message_evicted(&mut self, id: Uuid, reason: EvictReason) {
			self.evicted.push((id, reason));
		}

		fn status_changed(&mut self, _status: &SourceStatus) {}
	}

	fn chat(text: &str) -> ChatEvent {
		ChatEvent::new(EventSource::Relay, EventKind::Chat, ChatUser::new("u1", "Fan"), text)
	}

	fn small_buffer(max: usize) -> MessageBuffer {
		MessageBuffer::new(BufferSettings {
			max_messages: max,
			auto_remove: false,
			remove_after: Duration::from_secs(30),
		})
	}

	#[tokio::test(start_paused = true)]
	async fn overflow_evicts_exactly_the_oldest() {
		let mut buf = small_buffer(2);
		let mut sink = RecordingSink::default();
		let now = Instant::now();

		let first = chat("one");
		let first_id = first.id;
		buf.insert(first, now, &mut sink);
		buf.insert(chat("two"), now, &mut sink);
		buf.insert(chat("three"), now, &mut sink);

		assert_eq!(buf.len(), 2);
		assert_eq!(sink.inserted.len(), 3);
		assert_eq!(sink.evicted, vec![(first_id, EvictReason::Capacity)]);
	}

	#[tokio::test(start_paused = true)]
	async fn len_never_exceeds_capacity() {
		let mut buf = small_buffer(5);
		let mut sink = RecordingSink::default();
		for i in 0..50 {
			buf.insert(chat(&format!("m{i}")), Instant::now(), &mut sink);
			assert!(buf.len() <= 5);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn auto_remove_expires_in_insertion_order() {
		let mut buf = MessageBuffer::new(BufferSettings {
			max_messages: 10,
			auto_remove: true,
			remove_after: Duration::from_secs(30),
		});
		let mut sink = RecordingSink::default();

		let early = chat("early");
		let early_id = early.id;
		buf.insert(early, Instant::now(), &mut sink);

		advance(Duration::from_secs(10)).await;
		let late = chat("late");
		let late_id = late.id;
		buf.insert(late, Instant::now(), &mut sink);

		let deadline = buf.next_expiry().expect("deadline");
		advance(deadline.saturating_duration_since(Instant::now())).await;
		buf.expire_due(Instant::now(), &mut sink);

		assert_eq!(sink.evicted, vec![(early_id, EvictReason::Expired)]);
		assert_eq!(buf.len(), 1);

		advance(Duration::from_secs(10)).await;
		buf.expire_due(Instant::now(), &mut sink);
		assert_eq!(sink.evicted.last(), Some(&(late_id, EvictReason::Expired)));
		assert!(buf.is_empty());
		assert!(buf.next_expiry().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn no_expiry_when_auto_remove_is_off() {
		let mut buf = small_buffer(10);
		let mut sink = RecordingSink::default();
		buf.insert(chat("stays"), Instant::now(), &mut sink);

		assert!(buf.next_expiry().is_none());
		advance(Duration::from_secs(3600)).await;
		buf.expire_due(Instant::now(), &mut sink);
		assert_eq!(buf.len(), 1);
		assert!(sink.evicted.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn capacity_evicted_entries_cannot_expire_again() {
		let mut buf = MessageBuffer::new(BufferSettings {
			max_messages: 1,
			auto_remove: true,
			remove_after: Duration::from_secs(5),
		});
		let mut sink = RecordingSink::default();

		buf.insert(chat("one"), Instant::now(), &mut sink);
		buf.insert(chat("two"), Instant::now(), &mut sink);
		advance(Duration::from_secs(5)).await;
		buf.expire_due(Instant::now(), &mut sink);

		// "one" left by capacity, "two" by expiry; two evictions total.
		assert_eq!(sink.evicted.len(), 2);
		assert_eq!(sink.evicted[0].1, EvictReason::Capacity);
		assert_eq!(sink.evicted[1].1, EvictReason::Expired);
	}

	#[test]
	fn sink_helper_suppresses_muted_sound() {
		// Sanity check that buffer-facing sinks can reuse the cue helper.
		let sounds = SoundSettings::default();
		let ev = chat("hello");
		assert_eq!(sound_cue(&sounds, &["fan".to_string()], &ev), None);
	}
}
