//! WebSocket channel to the matchmaking relay, with bounded auto-reconnect.
//!
//! The adapter owns the socket on a background task. Inbound frames are
//! decoded, tagged with their [`Epoch`] in the relay stream and queued for
//! the coordinator; outbound messages are written as they arrive. Nothing
//! is retried individually: a message written while the socket is down is
//! lost, and messages queued before a reconnect are discarded because they
//! were addressed under the previous identity.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::errors::PairchatError;
use crate::protocol::{ClientMessage, RelayEvent};

/// Position of a frame in the relay stream.
///
/// Every reopen and every frame that starts a pairing scope (`connect`,
/// `waiting`, `paired`) opens a new epoch; chat, signal, media and
/// partner-left frames belong to the epoch of the scope frame before them.
/// The relay delivers in order, so the epoch tells which pairing a frame
/// was sent for no matter how long it sat in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// A channel event and the epoch it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInput {
    pub epoch: Epoch,
    pub event: ChannelEvent,
}

/// Assigns epochs in arrival order.
#[derive(Debug, Default)]
pub struct FrameSequencer {
    epoch: Epoch,
}

impl FrameSequencer {
    pub fn current(&self) -> Epoch {
        self.epoch
    }

    pub fn tag(&mut self, event: ChannelEvent) -> ChannelInput {
        let opens_scope = match &event {
            ChannelEvent::Opened => true,
            ChannelEvent::Relay(relay) => relay.opens_scope(),
            _ => false,
        };
        if opens_scope {
            self.epoch = Epoch(self.epoch.0 + 1);
        }
        ChannelInput {
            epoch: self.epoch,
            event,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// About to dial; `attempt` counts from 1 since the last successful open.
    Connecting { attempt: u32 },
    Opened,
    Relay(RelayEvent),
    /// An open channel went away.
    Dropped { reason: String },
    /// A dial attempt failed.
    ConnectFailed { reason: String },
    /// Retry budget exhausted; the adapter has stopped.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed dials tolerated before giving up.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(15),
            max_attempts: 8,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `failures`-th consecutive failed dial, or `None`
    /// once the budget is spent.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures >= self.max_attempts {
            return None;
        }
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self
            .initial_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay);
        if !self.jitter {
            return Some(delay);
        }
        let spread = delay.as_millis() as u64 / 4;
        let cut = rand::thread_rng().gen_range(0..=spread);
        Some(delay - Duration::from_millis(cut))
    }
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub display_name: Option<String>,
    pub backoff: BackoffPolicy,
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    /// Validated dial URL, with the display name passed as `name`.
    pub fn connect_url(&self) -> Result<String, PairchatError> {
        let mut url = url::Url::parse(self.url.trim())
            .map_err(|e| PairchatError::InvalidUrl(format!("{}: {e}", self.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PairchatError::InvalidUrl(format!(
                "expected ws:// or wss://, got '{}'",
                url.scheme()
            )));
        }
        url.set_fragment(None);

        let mut out = url.to_string();
        if let Some(name) = self.display_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            let sep = if url.query().is_some() { '&' } else { '?' };
            out.push_str(&format!("{sep}name={}", urlencoding::encode(name)));
        }
        Ok(out)
    }
}

/// Sink for client-originated messages.
pub trait Outbound: Send {
    fn send(&self, msg: ClientMessage) -> Result<(), PairchatError>;
}

#[derive(Debug, Clone)]
pub struct ChannelHandle {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl Outbound for ChannelHandle {
    fn send(&self, msg: ClientMessage) -> Result<(), PairchatError> {
        self.tx
            .send(msg)
            .map_err(|_| PairchatError::Channel("channel adapter stopped".into()))
    }
}

pub struct ChannelAdapter {
    handle: ChannelHandle,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ChannelAdapter {
    /// Spawn the connection task. Must be called inside a tokio runtime.
    pub fn start(
        config: ChannelConfig,
    ) -> Result<(Self, mpsc::Receiver<ChannelInput>), PairchatError> {
        let url = config.connect_url()?;
        let (event_tx, event_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(connection_loop(
            url,
            config,
            event_tx,
            out_rx,
            shutdown_rx,
        ));

        let adapter = Self {
            handle: ChannelHandle { tx: out_tx },
            shutdown_tx,
            task,
        };
        Ok((adapter, event_rx))
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// Close the socket and wait for the connection task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "channel task ended abnormally");
        }
    }
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

struct Pipes {
    sequencer: FrameSequencer,
    event_tx: mpsc::Sender<ChannelInput>,
    out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Pipes {
    /// False once the coordinator stopped listening.
    async fn emit(&mut self, event: ChannelEvent) -> bool {
        let input = self.sequencer.tag(event);
        self.event_tx.send(input).await.is_ok()
    }
}

async fn connection_loop(
    url: String,
    config: ChannelConfig,
    event_tx: mpsc::Sender<ChannelInput>,
    out_rx: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let mut pipes = Pipes {
        sequencer: FrameSequencer::default(),
        event_tx,
        out_rx,
        shutdown_rx,
    };
    let mut attempt: u32 = 0;
    let log_url = url.split('?').next().unwrap_or("").to_string();

    loop {
        attempt += 1;
        if !pipes.emit(ChannelEvent::Connecting { attempt }).await {
            return;
        }
        info!(url = %log_url, attempt, "connecting to relay");

        let dial = tokio::time::timeout(
            config.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let dialed = tokio::select! {
            res = dial => res,
            _ = pipes.shutdown_rx.changed() => return,
        };

        let delay = match dialed {
            Ok(Ok((ws, _))) => {
                attempt = 0;
                let mut stale = 0usize;
                while pipes.out_rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(stale, "discarded messages queued while disconnected");
                }
                if !pipes.emit(ChannelEvent::Opened).await {
                    return;
                }
                info!("relay channel open");

                match run_connection(ws, &mut pipes).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Dropped(reason) => {
                        let epoch = pipes.sequencer.current().value();
                        warn!(%reason, epoch, "relay channel dropped");
                        if !pipes.emit(ChannelEvent::Dropped { reason }).await {
                            return;
                        }
                    }
                }
                config.backoff.initial_delay
            }
            Ok(Err(e)) => {
                warn!(error = %e, attempt, "failed to connect to relay");
                let reason = e.to_string();
                if !pipes.emit(ChannelEvent::ConnectFailed { reason }).await {
                    return;
                }
                match config.backoff.delay_for(attempt) {
                    Some(delay) => delay,
                    None => {
                        let _ = pipes.emit(ChannelEvent::GaveUp { attempts: attempt }).await;
                        return;
                    }
                }
            }
            Err(_elapsed) => {
                warn!(attempt, "relay connection timed out");
                let reason = format!("timed out after {:?}", config.connect_timeout);
                if !pipes.emit(ChannelEvent::ConnectFailed { reason }).await {
                    return;
                }
                match config.backoff.delay_for(attempt) {
                    Some(delay) => delay,
                    None => {
                        let _ = pipes.emit(ChannelEvent::GaveUp { attempts: attempt }).await;
                        return;
                    }
                }
            }
        };

        info!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = pipes.shutdown_rx.changed() => return,
        }
    }
}

async fn run_connection<S>(ws: S, pipes: &mut Pipes) -> SessionEnd
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage>
        + Unpin,
    <S as futures_util::Sink<WsMessage>>::Error: std::fmt::Display,
{
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = pipes.shutdown_rx.changed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            Some(msg) = pipes.out_rx.recv() => {
                debug!(event = msg.event_name(), "sending to relay");
                if let Err(e) = write.send(WsMessage::Text(msg.encode().into())).await {
                    return SessionEnd::Dropped(format!("write failed: {e}"));
                }
            }
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match RelayEvent::decode(text.as_str()) {
                    Ok(RelayEvent::Disconnect(reason)) => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        return SessionEnd::Dropped(reason);
                    }
                    Ok(event) => {
                        if !pipes.emit(ChannelEvent::Relay(event)).await {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(e) => debug!(error = %e, "ignoring relay frame"),
                },
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by relay".to_string());
                    return SessionEnd::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                None => return SessionEnd::Dropped("stream ended".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InboundChat, SessionIdentity};
    use tokio::net::TcpListener;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts,
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(p.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(p.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(p.delay_for(5), Some(Duration::from_millis(1000)));
        assert_eq!(p.delay_for(9), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn backoff_is_bounded() {
        let p = policy(3);
        assert!(p.delay_for(2).is_some());
        assert_eq!(p.delay_for(3), None);
        assert_eq!(p.delay_for(30), None);
    }

    #[test]
    fn jitter_never_exceeds_base_delay() {
        let p = BackoffPolicy {
            jitter: true,
            ..policy(10)
        };
        for _ in 0..50 {
            let d = p.delay_for(2).unwrap();
            assert!(d <= Duration::from_millis(200));
            assert!(d >= Duration::from_millis(150));
        }
    }

    fn config(url: String, max_attempts: u32) -> ChannelConfig {
        ChannelConfig {
            url,
            display_name: None,
            backoff: policy(max_attempts),
            connect_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn connect_url_appends_encoded_name() {
        let mut c = config("ws://relay.example/ws".into(), 1);
        c.display_name = Some("Ada Lovelace".into());
        assert_eq!(
            c.connect_url().unwrap(),
            "ws://relay.example/ws?name=Ada%20Lovelace"
        );

        c.url = "wss://relay.example/ws?room=lobby".into();
        assert_eq!(
            c.connect_url().unwrap(),
            "wss://relay.example/ws?room=lobby&name=Ada%20Lovelace"
        );
    }

    #[test]
    fn connect_url_rejects_other_schemes() {
        let c = config("https://relay.example/".into(), 1);
        assert!(matches!(c.connect_url(), Err(PairchatError::InvalidUrl(_))));
        let c = config("not a url".into(), 1);
        assert!(matches!(c.connect_url(), Err(PairchatError::InvalidUrl(_))));
    }

    async fn next_input(rx: &mut mpsc::Receiver<ChannelInput>) -> ChannelInput {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("channel closed")
    }

    async fn next(rx: &mut mpsc::Receiver<ChannelInput>) -> ChannelEvent {
        next_input(rx).await.event
    }

    #[test]
    fn scope_frames_open_a_new_epoch() {
        let mut seq = FrameSequencer::default();
        let opened = seq.tag(ChannelEvent::Opened).epoch;
        let connect = seq
            .tag(ChannelEvent::Relay(RelayEvent::Connect(SessionIdentity::new("me"))))
            .epoch;
        assert!(connect > opened);

        let chat = seq
            .tag(ChannelEvent::Relay(RelayEvent::Chat(InboundChat {
                text: "hi".into(),
                sender_id: None,
                sender_name: None,
            })))
            .epoch;
        assert_eq!(chat, connect);
        let left = seq.tag(ChannelEvent::Relay(RelayEvent::PartnerLeft)).epoch;
        assert_eq!(left, connect);

        let waiting = seq.tag(ChannelEvent::Relay(RelayEvent::Waiting)).epoch;
        assert!(waiting > left);
        let dropped = seq
            .tag(ChannelEvent::Dropped {
                reason: "gone".into(),
            })
            .epoch;
        assert_eq!(dropped, waiting);
        assert_eq!(seq.current(), waiting);
    }

    #[tokio::test]
    async fn relays_frames_both_ways_and_reports_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"event":"connect","data":"abc"}"#.into()))
                .await
                .unwrap();
            ws.send(WsMessage::Text("garbage".into())).await.unwrap();
            ws.send(WsMessage::Text(r#"{"event":"waiting"}"#.into()))
                .await
                .unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Text(t))) => break t.as_str().to_string(),
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {other:?}"),
                }
            };
            ws.close(None).await.unwrap();
            received
        });

        let (adapter, mut rx) = ChannelAdapter::start(config(format!("ws://{addr}/"), 1)).unwrap();

        assert_eq!(next(&mut rx).await, ChannelEvent::Connecting { attempt: 1 });
        assert_eq!(next(&mut rx).await, ChannelEvent::Opened);
        let connect = next_input(&mut rx).await;
        assert_eq!(
            connect.event,
            ChannelEvent::Relay(RelayEvent::Connect(SessionIdentity::new("abc")))
        );
        // The malformed frame is skipped.
        let waiting = next_input(&mut rx).await;
        assert_eq!(waiting.event, ChannelEvent::Relay(RelayEvent::Waiting));
        assert!(waiting.epoch > connect.epoch);

        adapter.handle().send(ClientMessage::Chat("hi".into())).unwrap();
        let received = server.await.unwrap();
        let json: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(json, serde_json::json!({"event": "chat", "data": "hi"}));

        assert!(matches!(next(&mut rx).await, ChannelEvent::Dropped { .. }));

        // The listener is gone: one failed redial exhausts a budget of one.
        assert_eq!(next(&mut rx).await, ChannelEvent::Connecting { attempt: 1 });
        assert!(matches!(next(&mut rx).await, ChannelEvent::ConnectFailed { .. }));
        assert_eq!(next(&mut rx).await, ChannelEvent::GaveUp { attempts: 1 });

        adapter.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_dialing() {
        // Reserve a port, then free it so dials are refused.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (adapter, mut rx) = ChannelAdapter::start(config(format!("ws://{addr}/"), 100)).unwrap();
        assert_eq!(next(&mut rx).await, ChannelEvent::Connecting { attempt: 1 });

        tokio::time::timeout(Duration::from_secs(5), adapter.shutdown())
            .await
            .expect("shutdown hung");
    }

    #[tokio::test]
    async fn outbound_send_fails_after_shutdown() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (adapter, _rx) = ChannelAdapter::start(config(format!("ws://{addr}/"), 100)).unwrap();
        let handle = adapter.handle();
        adapter.shutdown().await;
        // The task dropped its receiver; only the adapter's own clone went with it.
        assert!(handle.send(ClientMessage::FindNewPartner).is_err());
    }
}
