#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tracing::{info, warn};

use crate::buffer::BufferSettings;
use crate::cooldown::{CooldownSettings, SpamSettings};
use crate::filter::FilterSettings;
use crate::sink::SoundSettings;

/// Default config path: `~/.fusechat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".fusechat").join("config.toml"))
}

/// Scroll direction of the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
	#[default]
	TopToBottom,
	BottomToTop,
}

impl Direction {
	pub const fn as_str(self) -> &'static str {
		match self {
			Direction::TopToBottom => "top_to_bottom",
			Direction::BottomToTop => "bottom_to_top",
		}
	}
}

impl fmt::Display for Direction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Relay source settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
	pub url: String,
}

impl Default for RelaySettings {
	fn default() -> Self {
		Self {
			url: "ws://127.0.0.1:8080/".to_string(),
		}
	}
}

/// Live source settings. `enabled` is the one runtime-mutable knob; it is
/// lifted onto the dispatcher command channel, everything else is frozen
/// at load.
#[derive(Debug, Clone)]
pub struct TikTokSettings {
	pub enabled: bool,
	pub username: String,
	pub bridge_url: String,
}

impl Default for TikTokSettings {
	fn default() -> Self {
		Self {
			enabled: false,
			username: String::new(),
			bridge_url: "ws://127.0.0.1:8912/".to_string(),
		}
	}
}

/// Overlay config, immutable after load (`Arc<OverlayConfig>`).
#[derive(Debug, Clone)]
pub struct OverlayConfig {
	pub direction: Direction,
	pub buffer: BufferSettings,
	/// Lowercase user keys whose sound cue is suppressed.
	pub muted_users: Vec<String>,
	pub reconnect_delay: Duration,
	pub emote_size: u32,
	pub relay: RelaySettings,
	pub tiktok: TikTokSettings,
	pub filters: FilterSettings,
	pub cooldown: CooldownSettings,
	pub sounds: SoundSettings,
}

/// Load the overlay config. A missing or defective file yields built-in
/// defaults; a config defect never aborts startup.
pub fn load_overlay_config() -> OverlayConfig {
	let path = match default_config_path() {
		Ok(path) => path,
		Err(e) => {
			warn!(error = %e, "no config path; using defaults");
			let mut cfg = OverlayConfig::from_file(FileConfig::default());
			apply_env_overrides(&mut cfg);
			return cfg;
		}
	};
	load_overlay_config_from_path(&path)
}

/// Same as `load_overlay_config` but with an explicit config path.
pub fn load_overlay_config_from_path(path: &Path) -> OverlayConfig {
	let file_cfg = match fs::read_to_string(path) {
		Ok(s) => match toml::from_str::<FileConfig>(&s) {
			Ok(cfg) => cfg,
			Err(e) => {
				warn!(path = %path.display(), error = %e, "config file failed to parse; using defaults");
				FileConfig::default()
			}
		},
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			info!(path = %path.display(), "no config file; using defaults");
			FileConfig::default()
		}
		Err(e) => {
			warn!(path = %path.display(), error = %e, "config file unreadable; using defaults");
			FileConfig::default()
		}
	};

	let mut cfg = OverlayConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	validate(&mut cfg);
	cfg
}

/// Parse a config document from a string (defects yield defaults for the
/// whole document, matching the file path).
pub fn overlay_config_from_str(s: &str) -> OverlayConfig {
	let file_cfg = match toml::from_str::<FileConfig>(s) {
		Ok(cfg) => cfg,
		Err(e) => {
			warn!(error = %e, "config document failed to parse; using defaults");
			FileConfig::default()
		}
	};
	let mut cfg = OverlayConfig::from_file(file_cfg);
	validate(&mut cfg);
	cfg
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	direction: Option<Direction>,
	auto_remove: Option<bool>,
	/// Seconds.
	remove_after: Option<u64>,
	max_messages: Option<usize>,
	#[serde(default)]
	blocked_users: Vec<String>,
	#[serde(default)]
	muted_users: Vec<String>,
	hide_commands: Option<bool>,
	/// Milliseconds.
	reconnect_delay: Option<u64>,
	emote_size: Option<u32>,

	#[serde(default)]
	relay: FileRelaySettings,

	#[serde(default)]
	tiktok: FileTikTokSettings,

	#[serde(default)]
	filters: FileFilterSettings,

	#[serde(default)]
	cooldown: FileCooldownSettings,

	#[serde(default)]
	sounds: FileSoundSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRelaySettings {
	url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTikTokSettings {
	enabled: Option<bool>,
	username: Option<String>,
	bridge_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileFilterSettings {
	show_chats: Option<bool>,
	show_gifts: Option<bool>,
	show_likes: Option<bool>,
	show_joins: Option<bool>,
	show_shares: Option<bool>,
	show_follows: Option<bool>,
	min_diamonds_to_show: Option<u64>,
	min_likes_to_show: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCooldownSettings {
	enabled: Option<bool>,
	/// Milliseconds.
	join_cooldown: Option<u64>,
	join_group_window: Option<u64>,
	like_cooldown: Option<u64>,

	#[serde(default)]
	spam_detection: FileSpamSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSpamSettings {
	enabled: Option<bool>,
	max_messages_per_user: Option<usize>,
	/// Milliseconds.
	time_window: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSoundSettings {
	chat: Option<String>,
	gift: Option<String>,
	super_chat: Option<String>,
	donation: Option<String>,
	follow: Option<String>,
	share: Option<String>,
}

impl OverlayConfig {
	fn from_file(file: FileConfig) -> Self {
		let buffer_defaults = BufferSettings::default();
		let filter_defaults = FilterSettings::default();
		let cooldown_defaults = CooldownSettings::default();
		let spam_defaults = SpamSettings::default();
		let sound_defaults = SoundSettings::default();

		Self {
			direction: file.direction.unwrap_or_default(),
			buffer: BufferSettings {
				max_messages: file.max_messages.unwrap_or(buffer_defaults.max_messages),
				auto_remove: file.auto_remove.unwrap_or(buffer_defaults.auto_remove),
				remove_after: file.remove_after.map(Duration::from_secs).unwrap_or(buffer_defaults.remove_after),
			},
			muted_users: file.muted_users.iter().map(|m| m.trim().to_lowercase()).collect(),
			reconnect_delay: file
				.reconnect_delay
				.map(Duration::from_millis)
				.unwrap_or(Duration::from_millis(5_000)),
			emote_size: file.emote_size.unwrap_or(28),
			relay: RelaySettings {
				url: file
					.relay
					.url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| RelaySettings::default().url),
			},
			tiktok: TikTokSettings {
				enabled: file.tiktok.enabled.unwrap_or(false),
				username: file.tiktok.username.filter(|s| !s.trim().is_empty()).unwrap_or_default(),
				bridge_url: file
					.tiktok
					.bridge_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| TikTokSettings::default().bridge_url),
			},
			filters: FilterSettings {
				blocked_users: file.blocked_users,
				hide_commands: file.hide_commands.unwrap_or(filter_defaults.hide_commands),
				show_chats: file.filters.show_chats.unwrap_or(filter_defaults.show_chats),
				show_gifts: file.filters.show_gifts.unwrap_or(filter_defaults.show_gifts),
				show_likes: file.filters.show_likes.unwrap_or(filter_defaults.show_likes),
				show_joins: file.filters.show_joins.unwrap_or(filter_defaults.show_joins),
				show_shares: file.filters.show_shares.unwrap_or(filter_defaults.show_shares),
				show_follows: file.filters.show_follows.unwrap_or(filter_defaults.show_follows),
				min_diamonds_to_show: file.filters.min_diamonds_to_show.unwrap_or(filter_defaults.min_diamonds_to_show),
				min_likes_to_show: file.filters.min_likes_to_show.unwrap_or(filter_defaults.min_likes_to_show),
			},
			cooldown: CooldownSettings {
				enabled: file.cooldown.enabled.unwrap_or(cooldown_defaults.enabled),
				join_cooldown: file
					.cooldown
					.join_cooldown
					.map(Duration::from_millis)
					.unwrap_or(cooldown_defaults.join_cooldown),
				join_group_window: file
					.cooldown
					.join_group_window
					.map(Duration::from_millis)
					.unwrap_or(cooldown_defaults.join_group_window),
				like_cooldown: file
					.cooldown
					.like_cooldown
					.map(Duration::from_millis)
					.unwrap_or(cooldown_defaults.like_cooldown),
				spam: SpamSettings {
					enabled: file.cooldown.spam_detection.enabled.unwrap_or(spam_defaults.enabled),
					max_messages_per_user: file
						.cooldown
						.spam_detection
						.max_messages_per_user
						.unwrap_or(spam_defaults.max_messages_per_user),
					time_window: file
						.cooldown
						.spam_detection
						.time_window
						.map(Duration::from_millis)
						.unwrap_or(spam_defaults.time_window),
				},
			},
			sounds: SoundSettings {
				chat: file.sounds.chat.unwrap_or(sound_defaults.chat),
				gift: file.sounds.gift.unwrap_or(sound_defaults.gift),
				super_chat: file.sounds.super_chat.unwrap_or(sound_defaults.super_chat),
				donation: file.sounds.donation.unwrap_or(sound_defaults.donation),
				follow: file.sounds.follow.unwrap_or(sound_defaults.follow),
				share: file.sounds.share.unwrap_or(sound_defaults.share),
			},
		}
	}
}

impl Default for OverlayConfig {
	/// Built-in defaults, identical to loading an empty document.
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn apply_env_overrides(cfg: &mut OverlayConfig) {
	if let Ok(v) = std::env::var("FUSECHAT_RELAY_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.relay.url = v;
			info!("relay config: url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FUSECHAT_TIKTOK_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.tiktok.enabled = enabled;
		info!(enabled, "tiktok config: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("FUSECHAT_TIKTOK_USERNAME") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.tiktok.username = v;
			info!("tiktok config: username overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FUSECHAT_TIKTOK_BRIDGE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.tiktok.bridge_url = v;
			info!("tiktok config: bridge_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("FUSECHAT_MAX_MESSAGES")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.buffer.max_messages = max;
		info!(max, "overlay config: max_messages overridden by env");
	}

	if let Ok(v) = std::env::var("FUSECHAT_RECONNECT_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.reconnect_delay = Duration::from_millis(ms);
		info!(ms, "overlay config: reconnect_delay overridden by env");
	}
}

fn validate(cfg: &mut OverlayConfig) {
	if cfg.buffer.max_messages == 0 {
		warn!("max_messages of 0 would display nothing; using 1");
		cfg.buffer.max_messages = 1;
	}

	if cfg.buffer.auto_remove && cfg.buffer.remove_after.is_zero() {
		warn!("auto_remove with remove_after of 0; using 30s");
		cfg.buffer.remove_after = Duration::from_secs(30);
	}

	if cfg.cooldown.join_group_window.is_zero() {
		warn!("join_group_window of 0; using 10s");
		cfg.cooldown.join_group_window = Duration::from_millis(10_000);
	}

	if cfg.cooldown.join_cooldown > cfg.cooldown.join_group_window {
		warn!(
			join_cooldown_ms = cfg.cooldown.join_cooldown.as_millis() as u64,
			join_group_window_ms = cfg.cooldown.join_group_window.as_millis() as u64,
			"join_cooldown exceeds join_group_window; clamping to the window"
		);
		cfg.cooldown.join_cooldown = cfg.cooldown.join_group_window;
	}

	if cfg.cooldown.spam.time_window.is_zero() {
		warn!("spam time_window of 0 disables detection");
		cfg.cooldown.spam.enabled = false;
	}

	if cfg.tiktok.enabled && cfg.tiktok.username.is_empty() {
		warn!("tiktok enabled without a username; the live source stays off");
		cfg.tiktok.enabled = false;
	}

	// A bad URL must not take the source down for the whole session.
	if url::Url::parse(&cfg.relay.url).is_err() {
		warn!(url = %cfg.relay.url, "relay url is invalid; using the default");
		cfg.relay.url = RelaySettings::default().url;
	}

	if url::Url::parse(&cfg.tiktok.bridge_url).is_err() {
		warn!(url = %cfg.tiktok.bridge_url, "tiktok bridge_url is invalid; using the default");
		cfg.tiktok.bridge_url = TikTokSettings::default().bridge_url;
	}
}
