#![forbid(unsafe_code)]

pub mod backoff;
pub mod normalize;
pub mod relay;
pub mod tiktok;

use std::fmt;
use std::time::SystemTime;

use fusechat_domain::{ChatEvent, EventSource};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Dispatcher → supervisor control message.
#[derive(Debug)]
pub enum SupervisorControl {
	/// Request a graceful shutdown. Cancels any pending reconnect.
	Shutdown,
}

/// Connection lifecycle of a source supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Closed,
}

impl ConnectionState {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected => "connected",
			ConnectionState::Reconnecting => "reconnecting",
			ConnectionState::Closed => "closed",
		}
	}

	/// Whether `next` is a legal successor state. `Closed` is terminal.
	pub fn can_transition_to(self, next: ConnectionState) -> bool {
		use ConnectionState::*;
		matches!(
			(self, next),
			(Disconnected, Connecting)
				| (Disconnected, Closed)
				| (Connecting, Connected)
				| (Connecting, Reconnecting)
				| (Connecting, Closed)
				| (Connected, Reconnecting)
				| (Connected, Closed)
				| (Reconnecting, Connecting)
				| (Reconnecting, Closed)
		)
	}
}

impl fmt::Display for ConnectionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Supervisor status update.
#[derive(Debug, Clone)]
pub struct SourceStatus {
	pub source: EventSource,
	pub state: ConnectionState,
	pub detail: String,
	pub last_error: Option<String>,
	pub time: SystemTime,
}

/// Supervisor → dispatcher event message.
#[derive(Debug, Clone)]
pub enum SourceEvent {
	/// Normalized event ready for the pipeline.
	Event(Box<ChatEvent>),

	/// Connection state change.
	Status(SourceStatus),
}

/// Helper types for wiring supervisors.
pub type ControlTx = mpsc::Sender<SupervisorControl>;
pub type ControlRx = mpsc::Receiver<SupervisorControl>;
pub type SourceEventTx = mpsc::Sender<SourceEvent>;
pub type SourceEventRx = mpsc::Receiver<SourceEvent>;

/// Build a standard bounded channel pair.
pub fn bounded_source_channels(control_capacity: usize, events_capacity: usize) -> (ControlTx, ControlRx, SourceEventTx, SourceEventRx) {
	let (control_tx, control_rx) = mpsc::channel(control_capacity);
	let (events_tx, events_rx) = mpsc::channel(events_capacity);
	(control_tx, control_rx, events_tx, events_rx)
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

/// Tracks the connection state machine for one supervisor and emits a
/// status update on every transition.
#[derive(Debug)]
pub struct StateReporter {
	source: EventSource,
	state: ConnectionState,
	events_tx: SourceEventTx,
}

impl StateReporter {
	/// Start in `Disconnected`.
	pub fn new(source: EventSource, events_tx: SourceEventTx) -> Self {
		Self {
			source,
			state: ConnectionState::Disconnected,
			events_tx,
		}
	}

	pub fn state(&self) -> ConnectionState {
		self.state
	}

	/// Transition to `next` and report it.
	pub fn transition(&mut self, next: ConnectionState, detail: impl Into<String>) {
		self.transition_inner(next, detail.into(), None);
	}

	/// Transition to `next` with an error attached.
	pub fn transition_error(&mut self, next: ConnectionState, detail: impl Into<String>, err: impl fmt::Display) {
		self.transition_inner(next, detail.into(), Some(err.to_string()));
	}

	fn transition_inner(&mut self, next: ConnectionState, detail: String, last_error: Option<String>) {
		if !self.state.can_transition_to(next) {
			warn!(
				source = %self.source,
				from = %self.state,
				to = %next,
				"illegal connection state transition"
			);
		}
		self.state = next;

		let _ = self.events_tx.try_send(SourceEvent::Status(SourceStatus {
			source: self.source,
			state: next,
			detail,
			last_error,
			time: SystemTime::now(),
		}));
	}
}
