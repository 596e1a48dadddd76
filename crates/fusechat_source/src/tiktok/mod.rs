#![forbid(unsafe_code)]

pub mod bridge;

use std::sync::Arc;
use std::time::Duration;

use fusechat_domain::EventSource;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::normalize::normalize_live_event;
use crate::{ConnectionState, ControlRx, SourceEvent, SourceEventTx, StateReporter, SupervisorControl};

/// User payload attached to live events. All fields are optional on the
/// wire; the normalizer applies the fallback chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveUser {
	pub unique_id: Option<String>,
	pub nickname: Option<String>,
	pub avatar_url: Option<String>,
	pub verified: bool,
}

/// Typed callback events from a live session.
#[derive(Debug, Clone)]
pub enum LiveEvent {
	Chat {
		user: LiveUser,
		comment: String,
	},
	Gift {
		user: LiveUser,
		gift_id: u64,
		/// Gift type 1 is streakable; intermediate streak events repeat.
		gift_type: Option<u32>,
		repeat_end: bool,
		repeat_count: u64,
		diamond_count: Option<u64>,
		gift_name: Option<String>,
		extended_gift_name: Option<String>,
	},
	Share {
		user: LiveUser,
	},
	Follow {
		user: LiveUser,
	},
	Like {
		user: LiveUser,
		like_count: u64,
	},
	Member {
		user: LiveUser,
	},
	/// The broadcast ended normally.
	StreamEnd,
	/// The session dropped without a stream end.
	Disconnected,
	/// Non-fatal session error.
	Error(String),
}

/// A connected live session. Dropping it detaches the event stream.
#[derive(Debug)]
pub struct LiveSession {
	pub room_id: String,
	pub events: mpsc::Receiver<LiveEvent>,
}

/// One-shot connect interface to a live source. Injectable so supervisor
/// tests stay free of I/O.
#[async_trait::async_trait]
pub trait LiveConnector: Send + Sync + 'static {
	async fn connect(&self, username: &str) -> anyhow::Result<LiveSession>;
}

/// Classification of live connect failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
	/// The target user is not currently live.
	NotLive,
	/// The room exists but cannot be fetched right now.
	RoomUnavailable,
	Other,
}

/// Classify a connect error by its message.
pub fn classify_connect_error(err: &anyhow::Error) -> ConnectFailure {
	let msg = err.to_string();
	if msg.contains("LIVE has ended") {
		ConnectFailure::NotLive
	} else if msg.contains("Unable to retrieve room") {
		ConnectFailure::RoomUnavailable
	} else {
		ConnectFailure::Other
	}
}

impl ConnectFailure {
	pub fn detail(self, username: &str) -> String {
		match self {
			ConnectFailure::NotLive => format!("@{username} is not live"),
			ConnectFailure::RoomUnavailable => format!("room for @{username} is unavailable"),
			ConnectFailure::Other => format!("failed to connect to @{username}"),
		}
	}
}

/// TikTok supervisor configuration.
#[derive(Clone)]
pub struct TikTokConfig {
	pub username: String,
	pub backoff: BackoffPolicy,
	/// Fixed delay after an expected stream end (long tier by default).
	pub stream_end_delay: Duration,
	pub connector: Arc<dyn LiveConnector>,
}

impl TikTokConfig {
	pub fn new(username: impl Into<String>, connector: Arc<dyn LiveConnector>) -> Self {
		let backoff = BackoffPolicy::default();
		Self {
			username: username.into(),
			stream_end_delay: backoff.long,
			backoff,
			connector,
		}
	}
}

impl std::fmt::Debug for TikTokConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TikTokConfig")
			.field("username", &self.username)
			.field("backoff", &self.backoff)
			.field("stream_end_delay", &self.stream_end_delay)
			.finish_non_exhaustive()
	}
}

/// Supervises one live session: connect, forward events, reconnect.
#[derive(Debug)]
pub struct TikTokSupervisor {
	cfg: TikTokConfig,
}

impl TikTokSupervisor {
	pub fn new(cfg: TikTokConfig) -> Self {
		Self { cfg }
	}

	pub async fn run(self, mut control_rx: ControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		let source = EventSource::TikTok;
		let session_id = crate::new_session_id();
		let username = self.cfg.username.clone();
		let mut reporter = StateReporter::new(source, events_tx.clone());

		info!(%source, %username, session_id, "live supervisor starting");

		let mut attempt: u32 = 0;
		// Set when the previous pass decided how long to wait before the
		// next connect (tiered for failures, fixed for stream end).
		let mut pending_delay: Option<Duration> = None;

		'outer: loop {
			if let Some(delay) = pending_delay.take() {
				debug!(%source, delay_ms = delay.as_millis() as u64, attempt, "waiting before reconnect");
				tokio::select! {
					_ = sleep(delay) => {}
					cmd = control_rx.recv() => {
						if matches!(cmd, Some(SupervisorControl::Shutdown) | None) {
							info!(%source, "shutdown during reconnect wait");
							break 'outer;
						}
					}
				}
			}

			reporter.transition(ConnectionState::Connecting, format!("connecting to @{username}"));

			let connected = tokio::select! {
				cmd = control_rx.recv() => {
					if matches!(cmd, Some(SupervisorControl::Shutdown) | None) {
						info!(%source, "shutdown while connecting");
						break 'outer;
					}
					continue;
				}
				res = self.cfg.connector.connect(&username) => res,
			};

			let mut session = match connected {
				Ok(session) => session,
				Err(e) => {
					let failure = classify_connect_error(&e);
					attempt = attempt.saturating_add(1);
					pending_delay = Some(self.cfg.backoff.delay_for(attempt));
					metrics::counter!("fusechat_reconnects_total", "source" => "tiktok").increment(1);
					warn!(%source, %username, attempt, failure = ?failure, error = %e, "live connect failed");
					reporter.transition_error(
						ConnectionState::Reconnecting,
						format!("{} (attempt={attempt})", failure.detail(&username)),
						e,
					);
					continue;
				}
			};

			attempt = 0;
			reporter.transition(
				ConnectionState::Connected,
				format!("connected to @{username} (room_id={})", session.room_id),
			);

			loop {
				tokio::select! {
					cmd = control_rx.recv() => {
						if matches!(cmd, Some(SupervisorControl::Shutdown) | None) {
							info!(%source, "live supervisor received Shutdown");
							break 'outer;
						}
					}

					ev = session.events.recv() => match ev {
						Some(LiveEvent::StreamEnd) => {
							// Expected termination: the ladder resets and the
							// retry waits a fixed long delay.
							attempt = 0;
							pending_delay = Some(self.cfg.stream_end_delay);
							reporter.transition(
								ConnectionState::Reconnecting,
								format!("stream ended; retrying in {:?}", self.cfg.stream_end_delay),
							);
							drop(session);
							continue 'outer;
						}
						Some(LiveEvent::Disconnected) | None => {
							attempt = attempt.saturating_add(1);
							pending_delay = Some(self.cfg.backoff.delay_for(attempt));
							metrics::counter!("fusechat_reconnects_total", "source" => "tiktok").increment(1);
							reporter.transition(
								ConnectionState::Reconnecting,
								format!("live session dropped (attempt={attempt})"),
							);
							drop(session);
							continue 'outer;
						}
						Some(LiveEvent::Error(msg)) => {
							warn!(%source, %username, error = %msg, "live session error");
						}
						Some(ev) => match normalize_live_event(&ev) {
							Ok(Some(event)) => {
								metrics::counter!("fusechat_events_total", "source" => "tiktok").increment(1);
								let _ = events_tx.try_send(SourceEvent::Event(Box::new(event)));
							}
							Ok(None) => {}
							Err(e) => {
								metrics::counter!("fusechat_malformed_frames_total", "source" => "tiktok").increment(1);
								warn!(%source, error = %e, "dropping malformed live event");
							}
						}
					}
				}
			}
		}

		reporter.transition(ConnectionState::Closed, "live supervisor stopped");
		Ok(())
	}
}
