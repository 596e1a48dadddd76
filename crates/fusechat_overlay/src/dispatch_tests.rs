#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fusechat_domain::{ChatEvent, ChatUser, EventKind, EventSource};
use fusechat_source::relay::{RelayWs, WsConnector};
use fusechat_source::tiktok::{LiveConnector, LiveSession};
use fusechat_source::{SourceEvent, SourceStatus};
use tokio::sync::mpsc;
use tokio::time::{advance, timeout};
use uuid::Uuid;

use crate::buffer::{DisplayMessage, EvictReason};
use crate::config::OverlayConfig;
use crate::dispatch::{Dispatcher, OverlayCommand, command_channel};
use crate::filter::DropReason;
use crate::sink::RenderSink;

#[derive(Debug, Default)]
struct SinkLog {
	inserted: Vec<(Uuid, EventKind, String)>,
	evicted: Vec<(Uuid, EvictReason)>,
	statuses: Vec<(EventSource, String)>,
	dropped: Vec<(String, DropReason)>,
}

#[derive(Debug, Clone, Default)]
struct SharedSink(Arc<Mutex<SinkLog>>);

impl SharedSink {
	fn log(&self) -> std::sync::MutexGuard<'_, SinkLog> {
		self.0.lock().expect("sink log lock")
	}
}

impl RenderSink for SharedSink {
	fn message_inserted(&mut self, msg: &DisplayMessage) {
		self.log().inserted.push((msg.id, msg.event.kind, msg.event.text.clone()));
	}

	fn message_evicted(&mut self, id: Uuid, reason: EvictReason) {
		self.log().evicted.push((id, reason));
	}

	fn status_changed(&mut self, status: &SourceStatus) {
		self.log().statuses.push((status.source, status.state.to_string()));
	}

	fn event_dropped(&mut self, user: &str, reason: DropReason) {
		self.log().dropped.push((user.to_string(), reason));
	}
}

/// Relay connector that never completes; keeps the supervisor quiet.
fn pending_relay_connector() -> WsConnector {
	Arc::new(|_url: url::Url| {
		Box::pin(async move {
			std::future::pending::<()>().await;
			let never: anyhow::Result<RelayWs> = unreachable!();
			never
		}) as fusechat_source::relay::BoxFuture<'static, anyhow::Result<RelayWs>>
	})
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
	fn drop(&mut self) {
		self.0.store(true, Ordering::SeqCst);
	}
}

/// Relay connector that never completes; `released` flips once its
/// in-flight connect future is torn down.
fn tracked_relay_connector(released: Arc<AtomicBool>) -> WsConnector {
	Arc::new(move |_url: url::Url| {
		let guard = SetOnDrop(released.clone());
		Box::pin(async move {
			let _guard = guard;
			std::future::pending::<()>().await;
			let never: anyhow::Result<RelayWs> = unreachable!();
			never
		}) as fusechat_source::relay::BoxFuture<'static, anyhow::Result<RelayWs>>
	})
}

/// Live connector handing out sessions that stay open until dropped.
#[derive(Debug, Default)]
struct CountingConnector {
	connects: AtomicUsize,
}

#[async_trait::async_trait]
impl LiveConnector for CountingConnector {
	async fn connect(&self, _username: &str) -> anyhow::Result<LiveSession> {
		self.connects.fetch_add(1, Ordering::SeqCst);
		let (tx, rx) = mpsc::channel(8);
		// Keep the sender alive with the session so the stream stays open.
		tokio::spawn(async move {
			tx.closed().await;
		});
		Ok(LiveSession {
			room_id: "room-1".to_string(),
			events: rx,
		})
	}
}

fn chat(name: &str, text: &str) -> ChatEvent {
	ChatEvent::new(EventSource::Relay, EventKind::Chat, ChatUser::new("u1", name), text)
}

fn mk_dispatcher(mut cfg: OverlayConfig, connector: Arc<CountingConnector>) -> (Dispatcher, SharedSink) {
	cfg.tiktok.username = "streamer".to_string();
	let sink = SharedSink::default();
	let mut dispatcher = Dispatcher::new(Arc::new(cfg), connector, Box::new(sink.clone()));
	dispatcher.set_relay_connector(pending_relay_connector());
	(dispatcher, sink)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
	timeout(Duration::from_secs(5), async {
		while !check() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition within timeout");
}

#[tokio::test(start_paused = true)]
async fn delivered_events_reach_the_sink() {
	let (dispatcher, sink) = mk_dispatcher(OverlayConfig::default(), Arc::new(CountingConnector::default()));
	let events_tx = dispatcher.event_sender();
	let (_cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));

	events_tx
		.send(SourceEvent::Event(Box::new(chat("Fan", "hello"))))
		.await
		.expect("send event");

	wait_until(|| !sink.log().inserted.is_empty()).await;
	let log = sink.log();
	assert_eq!(log.inserted.len(), 1);
	assert_eq!(log.inserted[0].2, "hello");
}

#[tokio::test(start_paused = true)]
async fn policy_drops_never_reach_the_sink() {
	let mut cfg = OverlayConfig::default();
	cfg.filters.blocked_users = vec!["Troll".to_string()];
	let (dispatcher, sink) = mk_dispatcher(cfg, Arc::new(CountingConnector::default()));
	let events_tx = dispatcher.event_sender();
	let (_cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));

	events_tx
		.send(SourceEvent::Event(Box::new(chat("Troll", "dropped"))))
		.await
		.expect("send event");
	events_tx
		.send(SourceEvent::Event(Box::new(chat("Fan", "shown"))))
		.await
		.expect("send event");

	wait_until(|| !sink.log().inserted.is_empty()).await;
	let log = sink.log();
	assert_eq!(log.inserted.len(), 1);
	assert_eq!(log.inserted[0].2, "shown");
	assert_eq!(log.dropped, vec![("Troll".to_string(), DropReason::Blocked)]);
}

#[tokio::test(start_paused = true)]
async fn auto_remove_expires_messages() {
	let mut cfg = OverlayConfig::default();
	cfg.buffer.auto_remove = true;
	cfg.buffer.remove_after = Duration::from_secs(2);
	let (dispatcher, sink) = mk_dispatcher(cfg, Arc::new(CountingConnector::default()));
	let events_tx = dispatcher.event_sender();
	let (_cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));

	events_tx
		.send(SourceEvent::Event(Box::new(chat("Fan", "short-lived"))))
		.await
		.expect("send event");

	wait_until(|| !sink.log().inserted.is_empty()).await;
	wait_until(|| sink.log().evicted.first().is_some_and(|(_, r)| *r == EvictReason::Expired)).await;
}

#[tokio::test(start_paused = true)]
async fn joins_surface_as_one_grouped_message() {
	let (dispatcher, sink) = mk_dispatcher(OverlayConfig::default(), Arc::new(CountingConnector::default()));
	let events_tx = dispatcher.event_sender();
	let (_cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));
	tokio::task::yield_now().await;

	// Keep the joins well inside the group window of the next flush tick.
	advance(Duration::from_secs(4)).await;
	for name in ["A", "B"] {
		let join = ChatEvent::new(EventSource::TikTok, EventKind::Join, ChatUser::new("u", name), "joined the stream!");
		events_tx.send(SourceEvent::Event(Box::new(join))).await.expect("send join");
	}

	// Nothing shows until the group window ticks.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(sink.log().inserted.is_empty());

	advance(Duration::from_secs(6)).await;
	wait_until(|| !sink.log().inserted.is_empty()).await;
	let log = sink.log();
	assert_eq!(log.inserted.len(), 1);
	assert_eq!(log.inserted[0].1, EventKind::System);
	assert!(log.inserted[0].2.contains("2 users joined"), "text: {}", log.inserted[0].2);
}

#[tokio::test(start_paused = true)]
async fn live_toggle_is_idempotent_and_restarts() {
	let connector = Arc::new(CountingConnector::default());
	let mut cfg = OverlayConfig::default();
	cfg.tiktok.enabled = false;
	let (dispatcher, sink) = mk_dispatcher(cfg, connector.clone());
	let (cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));

	// Off at startup; no connect attempts.
	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(connector.connects.load(Ordering::SeqCst), 0);

	cmd_tx.send(OverlayCommand::SetLiveEnabled(true)).await.expect("send");
	wait_until(|| connector.connects.load(Ordering::SeqCst) == 1).await;
	wait_until(|| sink.log().statuses.iter().any(|(s, st)| *s == EventSource::TikTok && st == "connected")).await;

	// Enabling again tears down and reconnects.
	cmd_tx.send(OverlayCommand::SetLiveEnabled(true)).await.expect("send");
	wait_until(|| connector.connects.load(Ordering::SeqCst) == 2).await;

	// Disabling twice is a no-op the second time.
	cmd_tx.send(OverlayCommand::SetLiveEnabled(false)).await.expect("send");
	wait_until(|| sink.log().statuses.iter().any(|(s, st)| *s == EventSource::TikTok && st == "closed")).await;
	cmd_tx.send(OverlayCommand::SetLiveEnabled(false)).await.expect("send");

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_command_stops_the_dispatcher() {
	let (dispatcher, _sink) = mk_dispatcher(OverlayConfig::default(), Arc::new(CountingConnector::default()));
	let (cmd_tx, cmd_rx) = command_channel();
	let handle = tokio::spawn(dispatcher.run(cmd_rx));

	cmd_tx.send(OverlayCommand::Shutdown).await.expect("send shutdown");
	timeout(Duration::from_secs(5), handle)
		.await
		.expect("dispatcher exits")
		.expect("join")
		.expect("run ok");
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_the_relay_supervisor() {
	let released = Arc::new(AtomicBool::new(false));
	let sink = SharedSink::default();
	let mut dispatcher = Dispatcher::new(
		Arc::new(OverlayConfig::default()),
		Arc::new(CountingConnector::default()),
		Box::new(sink.clone()),
	);
	dispatcher.set_relay_connector(tracked_relay_connector(released.clone()));

	let (cmd_tx, cmd_rx) = command_channel();
	let handle = tokio::spawn(dispatcher.run(cmd_rx));

	cmd_tx.send(OverlayCommand::Shutdown).await.expect("send shutdown");
	timeout(Duration::from_secs(5), handle)
		.await
		.expect("dispatcher exits")
		.expect("join")
		.expect("run ok");

	// The relay task was awaited, so its connect future is already gone.
	assert!(released.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn buffer_capacity_holds_under_load() {
	let mut cfg = OverlayConfig::default();
	cfg.buffer.max_messages = 3;
	cfg.buffer.auto_remove = false;
	cfg.cooldown.spam.enabled = false;
	let (dispatcher, sink) = mk_dispatcher(cfg, Arc::new(CountingConnector::default()));
	let events_tx = dispatcher.event_sender();
	let (_cmd_tx, cmd_rx) = command_channel();
	tokio::spawn(dispatcher.run(cmd_rx));

	for i in 0..10 {
		// Distinct users so spam detection is not the thing under test.
		events_tx
			.send(SourceEvent::Event(Box::new(chat(&format!("Fan{i}"), &format!("m{i}")))))
			.await
			.expect("send event");
	}

	wait_until(|| sink.log().inserted.len() == 10).await;
	let log = sink.log();
	assert_eq!(log.evicted.len(), 7);
	assert!(log.evicted.iter().all(|(_, r)| *r == EvictReason::Capacity));
	// The oldest entries left in insertion order.
	assert_eq!(log.evicted[0].0, log.inserted[0].0);
}
