#![forbid(unsafe_code)]

mod buffer;
mod config;
mod cooldown;
mod dispatch;
#[cfg(test)]
mod dispatch_tests;
mod filter;
mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use fusechat_source::tiktok::bridge::WebcastBridge;
use tokio::io::AsyncBufReadExt as _;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::{OverlayConfig, load_overlay_config, load_overlay_config_from_path};
use crate::dispatch::{CommandTx, Dispatcher, OverlayCommand, command_channel};
use crate::sink::LogSink;

fn init_tracing() {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_subscriber::fmt::layer())
		.init();
}

fn usage_and_exit(program: &str) -> ! {
	eprintln!("usage: {program} [--config <path>]");
	std::process::exit(2);
}

fn main() -> anyhow::Result<()> {
	init_tracing();

	let mut args = std::env::args();
	let program = args.next().unwrap_or_else(|| "fusechat_overlay".to_string());
	let mut config_path: Option<PathBuf> = None;
	while let Some(arg) = args.next() {
		match arg.as_str() {
			"--config" => match args.next() {
				Some(path) => config_path = Some(PathBuf::from(path)),
				None => usage_and_exit(&program),
			},
			"--help" | "-h" => usage_and_exit(&program),
			_ => usage_and_exit(&program),
		}
	}

	let cfg = match config_path {
		Some(path) => load_overlay_config_from_path(&path),
		None => load_overlay_config(),
	};

	info!(
		direction = %cfg.direction,
		max_messages = cfg.buffer.max_messages,
		auto_remove = cfg.buffer.auto_remove,
		emote_size = cfg.emote_size,
		relay_url = %cfg.relay.url,
		tiktok_enabled = cfg.tiktok.enabled,
		"overlay configured"
	);

	// All mutable state lives with the dispatcher on one thread.
	let runtime = tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.context("build tokio runtime")?;
	runtime.block_on(run(cfg))
}

async fn run(cfg: OverlayConfig) -> anyhow::Result<()> {
	let cfg = Arc::new(cfg);
	let sink = LogSink::new(cfg.sounds.clone(), cfg.muted_users.clone());
	let connector = Arc::new(WebcastBridge::new(cfg.tiktok.bridge_url.clone()));
	let dispatcher = Dispatcher::new(cfg, connector, Box::new(sink));

	let (command_tx, command_rx) = command_channel();
	spawn_signal_handler(command_tx.clone());
	spawn_command_reader(command_tx);

	dispatcher.run(command_rx).await
}

fn spawn_signal_handler(command_tx: CommandTx) {
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			info!("ctrl-c received; shutting down");
			let _ = command_tx.send(OverlayCommand::Shutdown).await;
		}
	});
}

/// Runtime control surface on stdin: `tiktok on`, `tiktok off`, `quit`.
fn spawn_command_reader(command_tx: CommandTx) {
	tokio::spawn(async move {
		let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
		while let Ok(Some(line)) = lines.next_line().await {
			let cmd = match line.trim() {
				"tiktok on" => OverlayCommand::SetLiveEnabled(true),
				"tiktok off" => OverlayCommand::SetLiveEnabled(false),
				"quit" | "exit" => OverlayCommand::Shutdown,
				"" => continue,
				other => {
					warn!(command = other, "unknown command");
					continue;
				}
			};
			if command_tx.send(cmd).await.is_err() {
				break;
			}
		}
	});
}
