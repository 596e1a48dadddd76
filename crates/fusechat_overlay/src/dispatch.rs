#![forbid(unsafe_code)]

use std::sync::Arc;

use fusechat_domain::ChatEvent;
use fusechat_source::backoff::BackoffPolicy;
use fusechat_source::relay::{RelayConfig, RelaySupervisor, WsConnector};
use fusechat_source::tiktok::{LiveConnector, TikTokConfig, TikTokSupervisor};
use fusechat_source::{ControlTx, SourceEvent, SourceEventRx, SourceEventTx, SupervisorControl};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::buffer::MessageBuffer;
use crate::config::OverlayConfig;
use crate::cooldown::CooldownEngine;
use crate::filter::{FilterPipeline, Verdict};
use crate::sink::RenderSink;

const EVENTS_CHANNEL_CAPACITY: usize = 4_096;
const CONTROL_CHANNEL_CAPACITY: usize = 8;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Runtime commands accepted by the dispatcher.
#[derive(Debug)]
pub enum OverlayCommand {
	/// Toggle the live source on or off. Idempotent both ways.
	SetLiveEnabled(bool),
	Shutdown,
}

pub type CommandTx = mpsc::Sender<OverlayCommand>;
pub type CommandRx = mpsc::Receiver<OverlayCommand>;

pub fn command_channel() -> (CommandTx, CommandRx) {
	mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}

/// Single-threaded owner of all mutable pipeline state. Sources talk to it
/// over channels only.
pub struct Dispatcher {
	cfg: Arc<OverlayConfig>,
	live_connector: Arc<dyn LiveConnector>,
	relay_connector: Option<WsConnector>,
	pipeline: FilterPipeline,
	buffer: MessageBuffer,
	sink: Box<dyn RenderSink>,
	events_tx: SourceEventTx,
	events_rx: SourceEventRx,
	relay_control: Option<ControlTx>,
	relay_task: Option<JoinHandle<()>>,
	live_control: Option<ControlTx>,
	live_task: Option<JoinHandle<()>>,
}

impl Dispatcher {
	pub fn new(cfg: Arc<OverlayConfig>, live_connector: Arc<dyn LiveConnector>, sink: Box<dyn RenderSink>) -> Self {
		let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAPACITY);
		let pipeline = FilterPipeline::new(cfg.filters.clone(), CooldownEngine::new(cfg.cooldown.clone()));
		let buffer = MessageBuffer::new(cfg.buffer.clone());

		Self {
			cfg,
			live_connector,
			relay_connector: None,
			pipeline,
			buffer,
			sink,
			events_tx,
			events_rx,
			relay_control: None,
			relay_task: None,
			live_control: None,
			live_task: None,
		}
	}

	/// Override the relay WebSocket connector (tests).
	pub fn set_relay_connector(&mut self, connector: WsConnector) {
		self.relay_connector = Some(connector);
	}

	/// Sender feeding the dispatcher's event loop.
	pub fn event_sender(&self) -> SourceEventTx {
		self.events_tx.clone()
	}

	pub async fn run(mut self, mut command_rx: CommandRx) -> anyhow::Result<()> {
		self.start_relay();
		if self.cfg.tiktok.enabled {
			self.start_live().await;
		}

		let mut join_flush = tokio::time::interval(self.cfg.cooldown.join_group_window);
		join_flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			let next_expiry = self.buffer.next_expiry();

			tokio::select! {
				maybe_ev = self.events_rx.recv() => match maybe_ev {
					Some(SourceEvent::Event(ev)) => self.handle_event(*ev),
					Some(SourceEvent::Status(st)) => self.sink.status_changed(&st),
					None => {
						warn!("source events channel closed; dispatcher exiting");
						break;
					}
				},

				_ = join_flush.tick() => {
					let now = Instant::now();
					if let Some(grouped) = self.pipeline.flush_joins(now) {
						self.buffer.insert(grouped, now, self.sink.as_mut());
					}
					self.pipeline.sweep(now);
				},

				_ = async {
					match next_expiry {
						Some(deadline) => tokio::time::sleep_until(deadline).await,
						None => std::future::pending().await,
					}
				} => {
					self.buffer.expire_due(Instant::now(), self.sink.as_mut());
				},

				cmd = command_rx.recv() => match cmd {
					Some(OverlayCommand::SetLiveEnabled(enabled)) => self.set_live_enabled(enabled).await,
					Some(OverlayCommand::Shutdown) | None => {
						info!("dispatcher received Shutdown");
						break;
					}
				},
			}
		}

		self.shutdown().await;
		Ok(())
	}

	fn handle_event(&mut self, event: ChatEvent) {
		let now = Instant::now();
		let user = event.user.display_name.clone();
		match self.pipeline.apply(event, now) {
			Verdict::Deliver(event) => self.buffer.insert(event, now, self.sink.as_mut()),
			Verdict::Deferred => {}
			Verdict::Drop(reason) => {
				metrics::counter!("fusechat_events_dropped_total", "reason" => reason.as_str()).increment(1);
				self.sink.event_dropped(&user, reason);
			}
		}
	}

	fn start_relay(&mut self) {
		let mut relay_cfg = RelayConfig::new(self.cfg.relay.url.clone());
		relay_cfg.backoff = BackoffPolicy::new(
			self.cfg.reconnect_delay,
			self.cfg.reconnect_delay * 3,
			self.cfg.reconnect_delay * 6,
			10,
		);
		relay_cfg.ws_connector = self.relay_connector.clone();

		let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
		let events_tx = self.events_tx.clone();
		let task = tokio::spawn(async move {
			if let Err(e) = RelaySupervisor::new(relay_cfg).run(control_rx, events_tx).await {
				warn!(error = %e, "relay supervisor exited with error");
			}
		});

		self.relay_control = Some(control_tx);
		self.relay_task = Some(task);
	}

	/// Start the live supervisor, tearing a previous one down first so no
	/// event can arrive from a stale session.
	async fn start_live(&mut self) {
		self.stop_live().await;

		if self.cfg.tiktok.username.is_empty() {
			warn!("live source requested without a username; ignoring");
			return;
		}

		let tiktok_cfg = TikTokConfig::new(self.cfg.tiktok.username.clone(), self.live_connector.clone());
		let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
		let events_tx = self.events_tx.clone();
		let task = tokio::spawn(async move {
			if let Err(e) = TikTokSupervisor::new(tiktok_cfg).run(control_rx, events_tx).await {
				warn!(error = %e, "live supervisor exited with error");
			}
		});

		self.live_control = Some(control_tx);
		self.live_task = Some(task);
	}

	/// Stop the live supervisor and wait for it to exit.
	async fn stop_live(&mut self) {
		if let Some(ctrl) = self.live_control.take() {
			let _ = ctrl.send(SupervisorControl::Shutdown).await;
		}
		if let Some(task) = self.live_task.take() {
			let _ = task.await;
		}
	}

	async fn set_live_enabled(&mut self, enabled: bool) {
		if enabled {
			info!("enabling live source");
			self.start_live().await;
		} else if self.live_control.is_some() {
			info!("disabling live source");
			self.stop_live().await;
		} else {
			debug!("live source already stopped");
		}
	}

	async fn shutdown(&mut self) {
		if let Some(ctrl) = self.relay_control.take() {
			let _ = ctrl.send(SupervisorControl::Shutdown).await;
		}
		if let Some(task) = self.relay_task.take() {
			let _ = task.await;
		}
		self.stop_live().await;
		info!("dispatcher stopped");
	}
}
