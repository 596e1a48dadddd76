#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tungstenite::Message;
use url::Url;

use super::{LiveConnector, LiveEvent, LiveSession, LiveUser};

/// Capacity of the per-session event channel.
const SESSION_CHANNEL_CAPACITY: usize = 1_024;

/// Live connector backed by a local webcast bridge process speaking JSON
/// text frames over a WebSocket.
#[derive(Debug, Clone)]
pub struct WebcastBridge {
	pub url: String,
}

impl WebcastBridge {
	pub fn new(url: impl Into<String>) -> Self {
		Self { url: url.into() }
	}
}

#[async_trait::async_trait]
impl LiveConnector for WebcastBridge {
	async fn connect(&self, username: &str) -> anyhow::Result<LiveSession> {
		let url = Url::parse(&self.url).context("parse bridge url")?;
		let (mut ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect to webcast bridge")?;

		let request = serde_json::json!({ "action": "connect", "username": username });
		ws.send(Message::text(request.to_string()))
			.await
			.context("send bridge connect request")?;

		// The bridge answers with `connected` or `connectFailed` before any
		// stream events.
		let room_id = loop {
			let frame = ws.next().await.ok_or_else(|| anyhow!("bridge closed before connect ack"))??;
			let Message::Text(txt) = frame else {
				continue;
			};
			let frame: BridgeFrame = serde_json::from_str(&txt).context("parse bridge frame")?;
			match frame.event.as_str() {
				"connected" => break room_id_from(&frame.data)?,
				"connectFailed" | "error" => bail!("{}", failure_message(&frame.data)),
				other => {
					debug!(event = other, "ignoring bridge frame before connect ack");
				}
			}
		};

		let (tx, rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);

		tokio::spawn(async move {
			loop {
				let frame = match ws.next().await {
					Some(Ok(frame)) => frame,
					Some(Err(e)) => {
						warn!(error = %e, "bridge stream error");
						let _ = tx.send(LiveEvent::Disconnected).await;
						return;
					}
					None => {
						let _ = tx.send(LiveEvent::Disconnected).await;
						return;
					}
				};

				let txt = match frame {
					Message::Text(txt) => txt,
					Message::Ping(payload) => {
						let _ = ws.send(Message::Pong(payload)).await;
						continue;
					}
					Message::Close(_) => {
						let _ = tx.send(LiveEvent::Disconnected).await;
						return;
					}
					_ => continue,
				};

				match parse_bridge_event(&txt) {
					Ok(Some(ev)) => {
						// A dropped receiver means the session was torn down.
						if tx.send(ev).await.is_err() {
							return;
						}
					}
					Ok(None) => {}
					Err(e) => {
						metrics::counter!("fusechat_malformed_frames_total", "source" => "tiktok").increment(1);
						warn!(error = %e, "dropping malformed bridge frame");
					}
				}
			}
		});

		Ok(LiveSession { room_id, events: rx })
	}
}

#[derive(Debug, Default, Deserialize)]
struct BridgeFrame {
	#[serde(default)]
	event: String,
	#[serde(default)]
	data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeUser {
	#[serde(default)]
	unique_id: Option<String>,
	#[serde(default)]
	nickname: Option<String>,
	#[serde(default)]
	verified: Option<bool>,
	#[serde(default)]
	profile_picture: Option<ProfilePicture>,
}

#[derive(Debug, Default, Deserialize)]
struct ProfilePicture {
	#[serde(default)]
	url: Vec<String>,
}

impl From<BridgeUser> for LiveUser {
	fn from(u: BridgeUser) -> Self {
		let avatar_url = u.profile_picture.and_then(|p| p.url.into_iter().next());
		LiveUser {
			unique_id: u.unique_id,
			nickname: u.nickname,
			avatar_url,
			verified: u.verified.unwrap_or(false),
		}
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeChat {
	#[serde(flatten)]
	user: BridgeUser,
	#[serde(default)]
	comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeGift {
	#[serde(flatten)]
	user: BridgeUser,
	#[serde(default)]
	gift_id: Option<u64>,
	#[serde(default)]
	gift_type: Option<u32>,
	#[serde(default)]
	repeat_end: Option<bool>,
	#[serde(default)]
	repeat_count: Option<u64>,
	#[serde(default)]
	diamond_count: Option<u64>,
	#[serde(default)]
	gift_details: Option<GiftDetails>,
	#[serde(default)]
	extended_gift_info: Option<ExtendedGiftInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GiftDetails {
	#[serde(default)]
	gift_name: Option<String>,
	#[serde(default)]
	diamond_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendedGiftInfo {
	#[serde(default)]
	name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BridgeLike {
	#[serde(flatten)]
	user: BridgeUser,
	#[serde(default)]
	like_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct BridgeError {
	#[serde(default)]
	message: Option<String>,
}

fn room_id_from(data: &serde_json::Value) -> anyhow::Result<String> {
	let room = data.get("roomId").ok_or_else(|| anyhow!("connected ack without roomId"))?;
	if let Some(s) = room.as_str() {
		return Ok(s.to_string());
	}
	if let Some(n) = room.as_u64() {
		return Ok(n.to_string());
	}
	bail!("connected ack with unusable roomId: {room}")
}

fn failure_message(data: &serde_json::Value) -> String {
	BridgeError::deserialize(data)
		.ok()
		.and_then(|e| e.message)
		.unwrap_or_else(|| "bridge connect failed".to_string())
}

/// Parse one bridge text frame into a live event.
///
/// `Ok(None)` means a frame type the session does not surface.
pub(crate) fn parse_bridge_event(txt: &str) -> anyhow::Result<Option<LiveEvent>> {
	let frame: BridgeFrame = serde_json::from_str(txt).context("parse bridge frame")?;
	let data = frame.data;

	let ev = match frame.event.as_str() {
		"chat" => {
			let chat: BridgeChat = serde_json::from_value(data).context("parse chat payload")?;
			LiveEvent::Chat {
				user: chat.user.into(),
				comment: chat.comment.unwrap_or_default(),
			}
		}
		"gift" => {
			let gift: BridgeGift = serde_json::from_value(data).context("parse gift payload")?;
			let details = gift.gift_details.unwrap_or_default();
			LiveEvent::Gift {
				user: gift.user.into(),
				gift_id: gift.gift_id.unwrap_or(0),
				gift_type: gift.gift_type,
				repeat_end: gift.repeat_end.unwrap_or(false),
				repeat_count: gift.repeat_count.unwrap_or(1),
				diamond_count: gift.diamond_count.or(details.diamond_count),
				gift_name: details.gift_name,
				extended_gift_name: gift.extended_gift_info.and_then(|e| e.name),
			}
		}
		"share" => {
			let user: BridgeUser = serde_json::from_value(data).context("parse share payload")?;
			LiveEvent::Share { user: user.into() }
		}
		"follow" => {
			let user: BridgeUser = serde_json::from_value(data).context("parse follow payload")?;
			LiveEvent::Follow { user: user.into() }
		}
		"like" => {
			let like: BridgeLike = serde_json::from_value(data).context("parse like payload")?;
			LiveEvent::Like {
				user: like.user.into(),
				like_count: like.like_count.unwrap_or(0),
			}
		}
		"member" => {
			let user: BridgeUser = serde_json::from_value(data).context("parse member payload")?;
			LiveEvent::Member { user: user.into() }
		}
		"streamEnd" => LiveEvent::StreamEnd,
		"disconnected" => LiveEvent::Disconnected,
		"error" => LiveEvent::Error(failure_message(&data)),
		_ => return Ok(None),
	};

	Ok(Some(ev))
}
