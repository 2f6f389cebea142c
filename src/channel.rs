use crate::config::ChannelConfig;
use crate::error::{ChannelError, ProtocolError};
use crate::protocol::{parse_server_message, ClientMessage, ServerMessage};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Connection state of a channel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// Discrete events a channel surfaces to its owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Transport reestablished after an unexpected closure.
    Open,
    /// A parsed inbound protocol message.
    Message(ServerMessage),
    /// The transport closed and will not be reopened.
    Closed { graceful: bool },
    /// Reconnection attempts are exhausted; the channel is unusable.
    Fatal(ChannelError),
}

/// Transport abstraction for the persistent bidirectional backend channel.
///
/// Implementations own the reconnection policy: transient transport failures
/// are retried internally with bounded backoff and only surfaced as
/// [`ChannelEvent::Fatal`] once retries are exhausted. A server-initiated
/// graceful close is not a failure and is reported as
/// [`ChannelEvent::Closed`] without any reconnect attempt.
#[async_trait]
pub trait ChannelAdapter: Send {
    /// Establish the transport. Resolves once the channel is open, or with a
    /// [`ChannelError`] after the configured attempts are exhausted.
    async fn connect(&mut self) -> Result<(), ChannelError>;

    /// Transmit one protocol message. Silently drops the message when the
    /// channel is not open; callers must tolerate that.
    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError>;

    /// Next inbound event. Returns `None` once the channel is fully closed
    /// and drained. Cancel-safe: dropping the future loses no events.
    async fn recv(&mut self) -> Option<ChannelEvent>;

    /// Current transport state.
    fn state(&self) -> ChannelState;

    /// Tear down the transport. Idempotent; safe when never connected.
    async fn close(&mut self);
}

/// Bounded exponential backoff for reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Maximum number of connect attempts before giving up
    pub max_retries: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Delay before the attempt following `retry_count` failures.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay_ms = self.base_delay.as_millis() as u64 * 2_u64.pow(retry_count.min(16));
        let delay = Duration::from_millis(delay_ms);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedState = Arc<parking_lot::Mutex<ChannelState>>;

/// WebSocket implementation of [`ChannelAdapter`].
///
/// The auth token is attached as a `token` query parameter on the endpoint
/// URL. A connection task owns the socket: it forwards outbound messages,
/// parses inbound frames (malformed payloads are logged and dropped), and
/// runs the reconnect policy when the transport drops unexpectedly.
pub struct WebSocketChannel {
    url: String,
    auth_token: Option<String>,
    policy: ReconnectPolicy,
    state: SharedState,
    outbound: Option<mpsc::Sender<String>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WebSocketChannel {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            url: config.url.clone(),
            auth_token: config.auth_token.clone(),
            policy: ReconnectPolicy::from_config(config),
            state: Arc::new(parking_lot::Mutex::new(ChannelState::Disconnected)),
            outbound: None,
            events: None,
            task: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Endpoint URL with the auth token appended, when configured.
    fn request_url(&self) -> String {
        match &self.auth_token {
            Some(token) => {
                let separator = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, separator, token)
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for WebSocketChannel {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        if *self.state.lock() == ChannelState::Open {
            debug!("Channel already open");
            return Ok(());
        }

        let stream = dial(&self.request_url(), &self.url, &self.policy, &self.state).await?;

        let (out_tx, out_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(32);
        let shutdown = CancellationToken::new();

        self.task = Some(tokio::spawn(connection_task(ConnectionTask {
            stream,
            request_url: self.request_url(),
            display_url: self.url.clone(),
            policy: self.policy.clone(),
            state: Arc::clone(&self.state),
            out_rx,
            event_tx,
            shutdown: shutdown.clone(),
        })));

        self.outbound = Some(out_tx);
        self.events = Some(event_rx);
        self.shutdown = shutdown;
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        if *self.state.lock() != ChannelState::Open {
            debug!("Channel not open, dropping outbound message");
            return Ok(());
        }

        let text = serde_json::to_string(message).map_err(|e| ChannelError::Send {
            details: e.to_string(),
        })?;

        if let Some(outbound) = &self.outbound {
            if outbound.send(text).await.is_err() {
                // Connection task has ended; recv() will surface the closure.
                debug!("Channel connection task gone, dropping outbound message");
            }
        }

        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn close(&mut self) {
        *self.state.lock() = ChannelState::Closing;
        self.shutdown.cancel();
        self.outbound = None;
        // Dropping the receiver unblocks any in-flight event delivery, so
        // the connection task can always observe the shutdown promptly.
        self.events = None;

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }

        *self.state.lock() = ChannelState::Disconnected;
        debug!("Channel closed");
    }
}

/// Connect with bounded exponential backoff.
async fn dial(
    request_url: &str,
    display_url: &str,
    policy: &ReconnectPolicy,
    state: &SharedState,
) -> Result<WsStream, ChannelError> {
    *state.lock() = ChannelState::Connecting;
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!(
            "Connecting to {} (attempt {}/{})",
            display_url, attempt, policy.max_retries
        );

        match connect_async(request_url).await {
            Ok((stream, _response)) => {
                info!("Channel connected to {}", display_url);
                *state.lock() = ChannelState::Open;
                return Ok(stream);
            }
            Err(e) => {
                warn!(
                    "Connect to {} failed (attempt {}/{}): {}",
                    display_url, attempt, policy.max_retries, e
                );

                if attempt >= policy.max_retries {
                    *state.lock() = ChannelState::Disconnected;
                    return Err(ChannelError::RetriesExhausted { attempts: attempt });
                }

                sleep(policy.delay_for(attempt - 1)).await;
            }
        }
    }
}

struct ConnectionTask {
    stream: WsStream,
    request_url: String,
    display_url: String,
    policy: ReconnectPolicy,
    state: SharedState,
    out_rx: mpsc::Receiver<String>,
    event_tx: mpsc::Sender<ChannelEvent>,
    shutdown: CancellationToken,
}

enum DriveEnd {
    Shutdown,
    GracefulClose,
    Lost,
}

/// Owns the socket for the lifetime of the channel: forwards outbound text,
/// parses inbound frames, and reconnects on unexpected closure.
async fn connection_task(task: ConnectionTask) {
    let ConnectionTask {
        stream,
        request_url,
        display_url,
        policy,
        state,
        mut out_rx,
        event_tx,
        shutdown,
    } = task;

    let (mut sink, mut read) = stream.split();

    loop {
        match drive(&mut sink, &mut read, &mut out_rx, &event_tx, &shutdown).await {
            DriveEnd::Shutdown => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                *state.lock() = ChannelState::Disconnected;
                return;
            }
            DriveEnd::GracefulClose => {
                info!("Channel closed by server");
                *state.lock() = ChannelState::Disconnected;
                let _ = event_tx.send(ChannelEvent::Closed { graceful: true }).await;
                return;
            }
            DriveEnd::Lost => {
                warn!("Channel closed unexpectedly, attempting reconnect");
                let redial = tokio::select! {
                    _ = shutdown.cancelled() => None,
                    result = dial(&request_url, &display_url, &policy, &state) => Some(result),
                };
                match redial {
                    None => {
                        *state.lock() = ChannelState::Disconnected;
                        return;
                    }
                    Some(Ok(stream)) => {
                        let (new_sink, new_read) = stream.split();
                        sink = new_sink;
                        read = new_read;
                        let _ = event_tx.send(ChannelEvent::Open).await;
                    }
                    Some(Err(e)) => {
                        let _ = event_tx.send(ChannelEvent::Fatal(e)).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn drive(
    sink: &mut SplitSink<WsStream, Message>,
    read: &mut SplitStream<WsStream>,
    out_rx: &mut mpsc::Receiver<String>,
    event_tx: &mpsc::Sender<ChannelEvent>,
    shutdown: &CancellationToken,
) -> DriveEnd {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return DriveEnd::Shutdown,
            outbound = out_rx.recv() => match outbound {
                Some(text) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!("Channel send failed: {}", e);
                        return DriveEnd::Lost;
                    }
                }
                // Adapter dropped its sender half
                None => return DriveEnd::Shutdown,
            },
            inbound = read.next() => match inbound {
                Some(Ok(Message::Text(text))) => match parse_server_message(&text) {
                    Ok(message) => {
                        if event_tx.send(ChannelEvent::Message(message)).await.is_err() {
                            return DriveEnd::Shutdown;
                        }
                    }
                    Err(ProtocolError::Malformed { details }) => {
                        warn!("Ignoring malformed inbound message: {}", details);
                    }
                },
                Some(Ok(Message::Close(_))) => return DriveEnd::GracefulClose,
                Some(Ok(_)) => {} // ping/pong/binary carry no protocol traffic
                Some(Err(e)) => {
                    warn!("Channel read error: {}", e);
                    return DriveEnd::Lost;
                }
                None => return DriveEnd::Lost,
            },
        }
    }
}

/// One step of a [`ScriptedChannel`] playback.
#[derive(Debug)]
pub enum ScriptItem {
    Event(ChannelEvent),
    Wait(Duration),
}

/// Deterministic in-process channel: plays back a scripted sequence of
/// inbound events and records every outbound message. Used by tests and
/// offline demos. When the script is exhausted the channel behaves like an
/// idle open connection.
pub struct ScriptedChannel {
    script: VecDeque<ScriptItem>,
    sent: Arc<parking_lot::Mutex<Vec<ClientMessage>>>,
    state: ChannelState,
    connect_error: Option<ChannelError>,
    simulated_attempts: u32,
    attempts: Arc<AtomicU32>,
    // Absolute deadline of an in-progress Wait item, so a recv() dropped
    // mid-wait resumes instead of skipping the remainder (cancel safety).
    wait_until: Option<tokio::time::Instant>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            script: VecDeque::new(),
            sent: Arc::new(parking_lot::Mutex::new(Vec::new())),
            state: ChannelState::Disconnected,
            connect_error: None,
            simulated_attempts: 1,
            attempts: Arc::new(AtomicU32::new(0)),
            wait_until: None,
        }
    }

    /// A channel whose connect fails after simulating `attempts` internal
    /// tries, mirroring an exhausted reconnect policy.
    pub fn failing(attempts: u32) -> Self {
        let mut channel = Self::new();
        channel.connect_error = Some(ChannelError::RetriesExhausted { attempts });
        channel.simulated_attempts = attempts;
        channel
    }

    /// Append an inbound event to the playback script.
    pub fn event(mut self, event: ChannelEvent) -> Self {
        self.script.push_back(ScriptItem::Event(event));
        self
    }

    /// Append an inbound protocol message to the playback script.
    pub fn message(self, message: ServerMessage) -> Self {
        self.event(ChannelEvent::Message(message))
    }

    /// Append a pause before the next scripted event.
    pub fn wait(mut self, duration: Duration) -> Self {
        self.script.push_back(ScriptItem::Wait(duration));
        self
    }

    /// Handle for inspecting messages sent through this channel.
    pub fn sent_handle(&self) -> Arc<parking_lot::Mutex<Vec<ClientMessage>>> {
        Arc::clone(&self.sent)
    }

    /// Handle for inspecting how many connect attempts were made.
    pub fn attempts_handle(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.attempts)
    }
}

impl Default for ScriptedChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedChannel {
    async fn connect(&mut self) -> Result<(), ChannelError> {
        self.attempts
            .fetch_add(self.simulated_attempts, Ordering::SeqCst);

        match &self.connect_error {
            Some(error) => {
                self.state = ChannelState::Disconnected;
                Err(error.clone())
            }
            None => {
                self.state = ChannelState::Open;
                Ok(())
            }
        }
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        if self.state != ChannelState::Open {
            debug!("Scripted channel not open, dropping outbound message");
            return Ok(());
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            if let Some(deadline) = self.wait_until {
                tokio::time::sleep_until(deadline).await;
                self.wait_until = None;
            }

            match self.script.pop_front() {
                Some(ScriptItem::Event(event)) => return Some(event),
                Some(ScriptItem::Wait(duration)) => {
                    self.wait_until = Some(tokio::time::Instant::now() + duration);
                }
                None => {
                    // Script exhausted: behave like an idle open channel
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    fn state(&self) -> ChannelState {
        self.state
    }

    async fn close(&mut self) {
        self.state = ChannelState::Disconnected;
        self.script.clear();
        self.wait_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn test_channel_config(url: String) -> ChannelConfig {
        ChannelConfig {
            url,
            auth_token: None,
            max_retries: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
        }
    }

    #[test]
    fn test_reconnect_policy_backoff() {
        let policy = ReconnectPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        // Capped at max_delay
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(4));
    }

    #[test]
    fn test_request_url_token_attachment() {
        let mut config = test_channel_config("ws://example.com/ws".to_string());
        config.auth_token = Some("secret".to_string());
        let channel = WebSocketChannel::new(&config);
        assert_eq!(channel.request_url(), "ws://example.com/ws?token=secret");

        let mut config = test_channel_config("ws://example.com/ws?v=2".to_string());
        config.auth_token = Some("secret".to_string());
        let channel = WebSocketChannel::new(&config);
        assert_eq!(channel.request_url(), "ws://example.com/ws?v=2&token=secret");

        let config = test_channel_config("ws://example.com/ws".to_string());
        let channel = WebSocketChannel::new(&config);
        assert_eq!(channel.request_url(), "ws://example.com/ws");
    }

    #[tokio::test]
    async fn test_scripted_channel_playback_and_recording() {
        let mut channel = ScriptedChannel::new().message(ServerMessage::Marked {
            message: "X present".to_string(),
            student_id: None,
        });
        let sent = channel.sent_handle();

        // Dropped silently while disconnected
        channel
            .send(&ClientMessage::EndSession {
                session_id: "abc".to_string(),
            })
            .await
            .unwrap();
        assert!(sent.lock().is_empty());

        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        channel
            .send(&ClientMessage::EndSession {
                session_id: "abc".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(sent.lock().len(), 1);

        match channel.recv().await {
            Some(ChannelEvent::Message(ServerMessage::Marked { message, .. })) => {
                assert_eq!(message, "X present");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_channel_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let inbound = ws.next().await.unwrap().unwrap();
            assert!(inbound.into_text().unwrap().contains("start_session"));

            ws.send(Message::Text(
                r#"{"type":"session_started","session_id":"abc","student_count":42}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.close(None).await.unwrap();
        });

        let config = test_channel_config(format!("ws://{}", addr));
        let mut channel = WebSocketChannel::new(&config);

        channel.connect().await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        channel
            .send(&ClientMessage::StartSession {
                class_id: 7,
                user_id: 3,
                group_id: None,
                session_topic: None,
            })
            .await
            .unwrap();

        match timeout(Duration::from_secs(5), channel.recv()).await.unwrap() {
            Some(ChannelEvent::Message(ServerMessage::SessionStarted {
                session_id,
                student_count,
                ..
            })) => {
                assert_eq!(session_id, "abc");
                assert_eq!(student_count, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        match timeout(Duration::from_secs(5), channel.recv()).await.unwrap() {
            Some(ChannelEvent::Closed { graceful: true }) => {}
            other => panic!("unexpected event: {:?}", other),
        }

        channel.close().await;
        channel.close().await; // idempotent
        assert_eq!(channel.state(), ChannelState::Disconnected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_channel_malformed_inbound_ignored() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            ws.send(Message::Text("{garbage".to_string())).await.unwrap();
            ws.send(Message::Text(
                r#"{"type":"celebrate","message":"confetti"}"#.to_string(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"type":"error","message":"boom"}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let config = test_channel_config(format!("ws://{}", addr));
        let mut channel = WebSocketChannel::new(&config);
        channel.connect().await.unwrap();

        // The two unparseable payloads are dropped; the valid event arrives.
        match timeout(Duration::from_secs(5), channel.recv()).await.unwrap() {
            Some(ChannelEvent::Message(ServerMessage::Error { message })) => {
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        channel.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_channel_reconnects_after_abrupt_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First connection: drop the socket without a close handshake.
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            drop(ws);

            // Second connection: greet and close cleanly.
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"error","message":"back"}"#.to_string()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let config = test_channel_config(format!("ws://{}", addr));
        let mut channel = WebSocketChannel::new(&config);
        channel.connect().await.unwrap();

        // The reconnect surfaces as an Open event, then traffic resumes.
        let mut reopened = false;
        loop {
            match timeout(Duration::from_secs(5), channel.recv()).await.unwrap() {
                Some(ChannelEvent::Open) => reopened = true,
                Some(ChannelEvent::Message(ServerMessage::Error { message })) => {
                    assert_eq!(message, "back");
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(reopened);

        channel.close().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_websocket_connect_retries_are_bounded() {
        // Grab a free port, then close the listener so connects are refused.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = test_channel_config(format!("ws://{}", addr));
        let mut channel = WebSocketChannel::new(&config);

        match channel.connect().await {
            Err(ChannelError::RetriesExhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected exhausted retries, got: {:?}", other),
        }
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
