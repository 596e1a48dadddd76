#![forbid(unsafe_code)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use fusechat_domain::EventSource;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use tungstenite::Message;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::normalize::normalize_relay_frame;
use crate::{ConnectionState, ControlRx, SourceEvent, SourceEventTx, StateReporter, SupervisorControl};

/// Subscription id the relay echoes back on acknowledgement frames.
pub const SUBSCRIBE_ID: &str = "sub1";

/// Event families requested from the relay on connect.
const SUBSCRIBED_EVENTS: [&str; 4] = ["Message", "SuperChat", "SuperSticker", "NewSponsor"];

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type RelayWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<RelayWs>> + Send + Sync>;

/// Relay supervisor configuration.
#[derive(Clone)]
pub struct RelayConfig {
	pub url: String,
	pub backoff: BackoffPolicy,
	/// Reconnect when no traffic arrives within this window.
	pub keepalive_timeout: Duration,
	pub ws_connector: Option<WsConnector>,
}

impl RelayConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			backoff: BackoffPolicy::new(
				Duration::from_secs(5),
				Duration::from_secs(15),
				Duration::from_secs(30),
				10,
			),
			keepalive_timeout: Duration::from_secs(60),
			ws_connector: None,
		}
	}
}

impl std::fmt::Debug for RelayConfig {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RelayConfig")
			.field("url", &self.url)
			.field("backoff", &self.backoff)
			.field("keepalive_timeout", &self.keepalive_timeout)
			.finish_non_exhaustive()
	}
}

/// The subscribe request sent after every (re)connect.
pub fn subscribe_request() -> serde_json::Value {
	serde_json::json!({
		"request": "Subscribe",
		"id": SUBSCRIBE_ID,
		"events": { "YouTube": SUBSCRIBED_EVENTS },
	})
}

/// Relay event frame, as delivered after acknowledgement filtering.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayFrame {
	#[serde(default)]
	pub data: RelayData,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayData {
	#[serde(default)]
	pub trigger_category: Option<String>,
	#[serde(default)]
	pub message: Option<String>,
	#[serde(default)]
	pub raw_input: Option<String>,
	#[serde(default)]
	pub user: Option<RelayUser>,
	#[serde(default)]
	pub emotes: Vec<RelayEmote>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayUser {
	#[serde(default)]
	pub id: Option<String>,
	#[serde(default)]
	pub display: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
	#[serde(default)]
	pub unique_id: Option<String>,
	#[serde(default)]
	pub profile_image_url: Option<String>,
	#[serde(default)]
	pub is_moderator: bool,
	#[serde(default)]
	pub is_verified: bool,
	#[serde(default)]
	pub is_subscribed: bool,
	#[serde(default)]
	pub is_owner: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEmote {
	#[serde(default)]
	pub start_index: Option<u32>,
	#[serde(default)]
	pub end_index: Option<u32>,
	#[serde(default)]
	pub image_url: Option<String>,
	#[serde(default)]
	pub name: Option<String>,
}

/// Minimal peek used to filter protocol acknowledgements.
#[derive(Debug, Default, Deserialize)]
struct FramePeek {
	#[serde(default)]
	id: Option<String>,
	#[serde(default)]
	request: Option<String>,
}

/// Whether a frame is a protocol acknowledgement (subscribe echo or
/// handshake) rather than an event.
fn is_protocol_ack(peek: &FramePeek) -> bool {
	peek.id.as_deref() == Some(SUBSCRIBE_ID) || peek.request.as_deref() == Some("Hello")
}

/// Supervises the relay socket: connect, subscribe, forward, reconnect.
#[derive(Debug)]
pub struct RelaySupervisor {
	cfg: RelayConfig,
}

impl RelaySupervisor {
	pub fn new(cfg: RelayConfig) -> Self {
		Self { cfg }
	}

	async fn connect_ws(url: Url) -> anyhow::Result<RelayWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to relay ws")?;
		Ok(ws)
	}

	fn ws_connector(&self) -> WsConnector {
		if let Some(c) = &self.cfg.ws_connector {
			return c.clone();
		}

		Arc::new(|url: Url| Box::pin(async move { Self::connect_ws(url).await }) as BoxFuture<'static, anyhow::Result<RelayWs>>)
	}

	pub async fn run(self, mut control_rx: ControlRx, events_tx: SourceEventTx) -> anyhow::Result<()> {
		let source = EventSource::Relay;
		let session_id = crate::new_session_id();
		let mut reporter = StateReporter::new(source, events_tx.clone());
		let connector = self.ws_connector();

		info!(%source, url = %self.cfg.url, session_id, "relay supervisor starting");

		let url = Url::parse(&self.cfg.url).context("parse relay url")?;
		let mut attempt: u32 = 0;

		'outer: loop {
			if attempt > 0 {
				let delay = self.cfg.backoff.delay_for(attempt);
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

			reporter.transition(ConnectionState::Connecting, format!("connecting to {}", self.cfg.url));

			let connected = tokio::select! {
				cmd = control_rx.recv() => {
					if matches!(cmd, Some(SupervisorControl::Shutdown) | None) {
						info!(%source, "shutdown while connecting");
						break 'outer;
					}
					continue;
				}
				res = connector(url.clone()) => res,
			};

			let mut ws = match connected {
				Ok(ws) => ws,
				Err(e) => {
					attempt = attempt.saturating_add(1);
					metrics::counter!("fusechat_reconnects_total", "source" => "relay").increment(1);
					reporter.transition_error(ConnectionState::Reconnecting, format!("relay connect failed (attempt={attempt})"), e);
					continue;
				}
			};

			if let Err(e) = ws.send(Message::text(subscribe_request().to_string())).await {
				attempt = attempt.saturating_add(1);
				metrics::counter!("fusechat_reconnects_total", "source" => "relay").increment(1);
				reporter.transition_error(ConnectionState::Reconnecting, format!("relay subscribe failed (attempt={attempt})"), e);
				continue;
			}

			attempt = 0;
			reporter.transition(ConnectionState::Connected, format!("relay connected (session_id={session_id})"));

			let mut last_activity = Instant::now();

			loop {
				tokio::select! {
					cmd = control_rx.recv() => {
						if matches!(cmd, Some(SupervisorControl::Shutdown) | None) {
							info!(%source, "relay supervisor received Shutdown");
							break 'outer;
						}
					}

					frame = ws.next() => match frame {
						Some(Ok(Message::Text(txt))) => {
							last_activity = Instant::now();
							handle_frame(&txt, &events_tx);
						}
						Some(Ok(Message::Ping(payload))) => {
							last_activity = Instant::now();
							let _ = ws.send(Message::Pong(payload)).await;
						}
						Some(Ok(Message::Close(_))) | None => {
							attempt = attempt.saturating_add(1);
							metrics::counter!("fusechat_reconnects_total", "source" => "relay").increment(1);
							reporter.transition(ConnectionState::Reconnecting, format!("relay closed (attempt={attempt})"));
							continue 'outer;
						}
						Some(Err(e)) => {
							attempt = attempt.saturating_add(1);
							metrics::counter!("fusechat_reconnects_total", "source" => "relay").increment(1);
							reporter.transition_error(ConnectionState::Reconnecting, format!("relay stream error (attempt={attempt})"), e);
							continue 'outer;
						}
						Some(Ok(_)) => {
							last_activity = Instant::now();
						}
					},

					_ = sleep(self.cfg.keepalive_timeout) => {
						if last_activity.elapsed() >= self.cfg.keepalive_timeout {
							attempt = attempt.saturating_add(1);
							metrics::counter!("fusechat_reconnects_total", "source" => "relay").increment(1);
							reporter.transition(
								ConnectionState::Reconnecting,
								format!("relay keepalive timeout (attempt={attempt})"),
							);
							continue 'outer;
						}
					}
				}
			}
		}

		reporter.transition(ConnectionState::Closed, "relay supervisor stopped");
		Ok(())
	}
}

/// Parse one relay text frame and forward the normalized event, if any.
///
/// Malformed frames are logged and dropped; the connection stays up.
fn handle_frame(txt: &str, events_tx: &SourceEventTx) {
	let peek: FramePeek = match serde_json::from_str(txt) {
		Ok(peek) => peek,
		Err(e) => {
			metrics::counter!("fusechat_malformed_frames_total", "source" => "relay").increment(1);
			warn!(error = %e, "dropping malformed relay frame");
			return;
		}
	};

	if is_protocol_ack(&peek) {
		debug!("ignoring relay protocol acknowledgement");
		return;
	}

	let frame: RelayFrame = match serde_json::from_str(txt) {
		Ok(frame) => frame,
		Err(e) => {
			metrics::counter!("fusechat_malformed_frames_total", "source" => "relay").increment(1);
			warn!(error = %e, "dropping undecodable relay frame");
			return;
		}
	};

	match normalize_relay_frame(&frame) {
		Ok(Some(event)) => {
			metrics::counter!("fusechat_events_total", "source" => "relay").increment(1);
			let _ = events_tx.try_send(SourceEvent::Event(Box::new(event)));
		}
		Ok(None) => {}
		Err(e) => {
			metrics::counter!("fusechat_malformed_frames_total", "source" => "relay").increment(1);
			warn!(error = %e, "dropping relay frame that failed normalization");
		}
	}
}
