use crate::camera::{default_source_factory, CameraGuard, SourceFactory};
use crate::capture::CaptureLoop;
use crate::channel::{ChannelAdapter, ChannelEvent, ChannelState, WebSocketChannel};
use crate::config::AttendcamConfig;
use crate::error::{AttendcamError, ChannelError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::reconcile::{reconcile, Disposition, Indicator, OutcomeKind};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of one attendance session. `Closed` is terminal for that
/// session value; a subsequent `start` allocates a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Ending,
    Closed,
}

/// Caller-supplied identifiers the backend needs to open a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub class_id: i64,
    pub user_id: i64,
    pub group_id: Option<i64>,
    pub session_topic: Option<String>,
}

/// One bounded window of live attendance capture. The id is assigned by the
/// backend on acknowledgment and absent before that.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Option<String>,
    pub subject: SessionParams,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

/// Snapshot pushed to status observers on every state or outcome transition.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: SessionState,
    pub text: String,
    pub outcome: Option<OutcomeKind>,
    pub indicator: Option<Indicator>,
}

type StatusObserver = Box<dyn Fn(&StatusUpdate) + Send + Sync>;

/// Creates the channel for each new session. Injected so tests and embedders
/// can substitute transports.
pub type ChannelFactory = Box<dyn Fn() -> Box<dyn ChannelAdapter> + Send + Sync>;

/// Shared observation surface between the controller handle and the session
/// task. Observers are invoked synchronously, in registration order.
struct StatusHub {
    state_tx: watch::Sender<SessionState>,
    observers: parking_lot::Mutex<Vec<StatusObserver>>,
    last_text: parking_lot::Mutex<String>,
    session_id: parking_lot::Mutex<Option<String>>,
    indicator_seq: AtomicU64,
}

impl StatusHub {
    fn new() -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new(Self {
            state_tx,
            observers: parking_lot::Mutex::new(Vec::new()),
            last_text: parking_lot::Mutex::new(String::new()),
            session_id: parking_lot::Mutex::new(None),
            indicator_seq: AtomicU64::new(0),
        })
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn set_session_id(&self, id: Option<String>) {
        *self.session_id.lock() = id;
    }

    fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn notify(
        &self,
        state: SessionState,
        text: impl Into<String>,
        outcome: Option<OutcomeKind>,
        indicator: Option<Indicator>,
    ) {
        let text = text.into();
        self.state_tx.send_replace(state);
        *self.last_text.lock() = text.clone();

        let update = StatusUpdate {
            state,
            text,
            outcome,
            indicator,
        };
        let observers = self.observers.lock();
        for observer in observers.iter() {
            observer(&update);
        }
    }

    /// Begin a new transient indicator; returns its generation.
    fn flash(&self) -> u64 {
        self.indicator_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clear the indicator of generation `seq` unless a newer one replaced
    /// it or the session left Active meanwhile.
    fn clear_indicator(&self, seq: u64) {
        if self.indicator_seq.load(Ordering::SeqCst) != seq {
            return;
        }
        if self.state() != SessionState::Active {
            return;
        }
        let text = self.last_text.lock().clone();
        self.notify(SessionState::Active, text, None, None);
    }
}

/// Drives one live attendance session: owns the state machine, the camera
/// guard, the channel, and the capture loop. The embedding UI talks only to
/// this type: [`start`](Self::start), [`stop`](Self::stop),
/// [`on_status_change`](Self::on_status_change).
pub struct SessionController {
    config: AttendcamConfig,
    channel_factory: ChannelFactory,
    source_factory: SourceFactory,
    hub: Arc<StatusHub>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionController {
    /// Controller with the platform-default camera and WebSocket channel.
    pub fn new(config: AttendcamConfig) -> Self {
        SessionControllerBuilder::new(config).build()
    }

    pub fn builder(config: AttendcamConfig) -> SessionControllerBuilder {
        SessionControllerBuilder::new(config)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.hub.state()
    }

    /// Backend-assigned id of the current session, once acknowledged.
    pub fn session_id(&self) -> Option<String> {
        self.hub.session_id()
    }

    /// Watch session state transitions without registering a callback.
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.hub.subscribe()
    }

    /// Register a status observer. Observers are appended and invoked in
    /// FIFO order on every state or outcome transition.
    pub fn on_status_change(&self, observer: impl Fn(&StatusUpdate) + Send + Sync + 'static) {
        self.hub.observers.lock().push(Box::new(observer));
    }

    /// Start a new session. Valid only from `Idle` or `Closed`.
    ///
    /// Acquires the camera, connects the channel, and sends the
    /// start-session control message. Device-acquisition and channel
    /// failures are fatal: the controller lands in `Closed` with a single
    /// fatal status update and no partial state is observable.
    pub async fn start(&mut self, params: SessionParams) -> Result<()> {
        match self.state() {
            SessionState::Idle | SessionState::Closed => {}
            state => {
                return Err(AttendcamError::session(format!(
                    "start is only valid from Idle or Closed, current state: {:?}",
                    state
                )));
            }
        }

        // Clear out the previous session's finished task, if any.
        self.task = None;
        self.cancel = CancellationToken::new();
        self.hub.set_session_id(None);

        info!("Starting attendance session for class {}", params.class_id);
        self.hub
            .notify(SessionState::Starting, "Starting session", None, None);

        let mut guard = CameraGuard::new(self.config.camera.clone());
        if let Err(e) = guard.acquire_with(&self.source_factory) {
            warn!("Camera acquisition failed: {}", e);
            self.hub.notify(
                SessionState::Closed,
                format!("Camera unavailable: {}", e),
                None,
                None,
            );
            return Err(e.into());
        }

        let mut channel = (self.channel_factory)();
        if let Err(e) = channel.connect().await {
            warn!("Channel connect failed: {}", e);
            guard.release();
            self.hub.notify(
                SessionState::Closed,
                format!("Connection failed: {}", e),
                None,
                None,
            );
            return Err(e.into());
        }

        let start_message = ClientMessage::StartSession {
            class_id: params.class_id,
            user_id: params.user_id,
            group_id: params.group_id,
            session_topic: params.session_topic.clone(),
        };
        if let Err(e) = channel.send(&start_message).await {
            warn!("Failed to send start-session message: {}", e);
            channel.close().await;
            guard.release();
            self.hub.notify(
                SessionState::Closed,
                format!("Connection failed: {}", e),
                None,
                None,
            );
            return Err(e.into());
        }

        let session = Session {
            id: None,
            subject: params,
            state: SessionState::Starting,
            started_at: Utc::now(),
        };

        let task = SessionTask {
            hub: Arc::clone(&self.hub),
            cancel: self.cancel.clone(),
            guard,
            channel,
            capture: CaptureLoop::new(&self.config.capture),
            session,
            indicator_hold: Duration::from_millis(self.config.session.indicator_hold_ms),
            drain_window: Duration::from_millis(self.config.session.drain_window_ms),
        };
        self.task = Some(tokio::spawn(task.run()));

        Ok(())
    }

    /// Stop the current session. Idempotent: calling it again while already
    /// ending or closed, or before the start acknowledgment arrived, is a
    /// no-op. The camera is released and the channel closed on every path.
    pub async fn stop(&mut self) -> Result<()> {
        match self.state() {
            SessionState::Idle | SessionState::Closed => {
                debug!("stop() with no running session");
                return Ok(());
            }
            _ => {}
        }

        info!("Stop requested");
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            if task.await.is_err() {
                warn!("Session task ended abnormally");
            }
        }

        // The task normally transitions to Closed itself; backstop in case
        // it died without completing teardown (the camera guard still
        // released on drop).
        if self.state() != SessionState::Closed {
            self.hub
                .notify(SessionState::Closed, "Session ended", None, None);
        }

        Ok(())
    }

    /// Wait until the running session reaches `Closed` (e.g., ended by the
    /// backend). Returns immediately when no session is running.
    pub async fn wait_closed(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        // The session task owns the camera and tears down on cancellation.
        self.cancel.cancel();
    }
}

/// Builder wiring a [`SessionController`] with injectable camera and channel
/// factories.
pub struct SessionControllerBuilder {
    config: AttendcamConfig,
    channel_factory: Option<ChannelFactory>,
    source_factory: Option<SourceFactory>,
}

impl SessionControllerBuilder {
    pub fn new(config: AttendcamConfig) -> Self {
        Self {
            config,
            channel_factory: None,
            source_factory: None,
        }
    }

    pub fn channel_factory(mut self, factory: ChannelFactory) -> Self {
        self.channel_factory = Some(factory);
        self
    }

    pub fn source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = Some(factory);
        self
    }

    pub fn build(self) -> SessionController {
        let channel_config = self.config.channel.clone();
        let channel_factory = self.channel_factory.unwrap_or_else(|| {
            Box::new(move || {
                Box::new(WebSocketChannel::new(&channel_config)) as Box<dyn ChannelAdapter>
            })
        });

        SessionController {
            config: self.config,
            channel_factory,
            source_factory: self.source_factory.unwrap_or_else(default_source_factory),
            hub: StatusHub::new(),
            cancel: CancellationToken::new(),
            task: None,
        }
    }
}

/// Why a session task is tearing down.
enum EndCause {
    ClientStop,
    BackendEnded { status: String },
    ChannelFatal(ChannelError),
    ChannelClosed { graceful: bool },
}

/// The per-session event loop. Owns the camera guard and the channel
/// exclusively; all state transitions happen on this task, so every
/// continuation naturally re-checks state after a suspension point.
struct SessionTask {
    hub: Arc<StatusHub>,
    cancel: CancellationToken,
    guard: CameraGuard,
    channel: Box<dyn ChannelAdapter>,
    capture: CaptureLoop,
    session: Session,
    indicator_hold: Duration,
    drain_window: Duration,
}

impl SessionTask {
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut ticker = self.capture.ticker();

        enum Step {
            Cancelled,
            Inbound(Option<ChannelEvent>),
            Tick,
        }

        let cause = loop {
            let active = self.session.state == SessionState::Active;

            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Cancelled,
                event = self.channel.recv() => Step::Inbound(event),
                _ = ticker.tick(), if active => Step::Tick,
            };

            match step {
                Step::Cancelled => break EndCause::ClientStop,
                Step::Inbound(Some(event)) => {
                    if let Some(cause) = self.handle_event(event) {
                        break cause;
                    }
                }
                Step::Inbound(None) => break EndCause::ChannelClosed { graceful: false },
                Step::Tick => self.capture_and_send().await,
            }
        };

        self.teardown(cause).await;
    }

    fn handle_event(&mut self, event: ChannelEvent) -> Option<EndCause> {
        match event {
            ChannelEvent::Open => {
                debug!("Channel reestablished");
                None
            }
            ChannelEvent::Message(message) => self.handle_message(message),
            ChannelEvent::Fatal(e) => {
                warn!("Channel failed: {}", e);
                Some(EndCause::ChannelFatal(e))
            }
            ChannelEvent::Closed { graceful } => Some(EndCause::ChannelClosed { graceful }),
        }
    }

    fn handle_message(&mut self, message: ServerMessage) -> Option<EndCause> {
        match message {
            ServerMessage::SessionStarted {
                session_id,
                student_count,
                message,
            } => {
                if self.session.state != SessionState::Starting {
                    debug!(
                        "Discarding session acknowledgment in state {:?}",
                        self.session.state
                    );
                    return None;
                }

                info!(
                    "Session {} started with {} students",
                    session_id, student_count
                );
                self.session.id = Some(session_id.clone());
                self.session.state = SessionState::Active;
                self.hub.set_session_id(Some(session_id));

                let text = message.unwrap_or_else(|| {
                    format!("Session started - {} students in class", student_count)
                });
                self.hub.notify(SessionState::Active, text, None, None);
                None
            }
            other => {
                let disposition = reconcile(&other)?;

                if !disposition.continues {
                    return Some(EndCause::BackendEnded {
                        status: disposition.outcome.message,
                    });
                }

                if self.session.state != SessionState::Active {
                    debug!(
                        "Discarding {:?} outcome in state {:?}",
                        disposition.outcome.kind, self.session.state
                    );
                    return None;
                }

                self.apply_outcome(disposition);
                None
            }
        }
    }

    fn apply_outcome(&mut self, disposition: Disposition) {
        let Disposition {
            outcome, indicator, ..
        } = disposition;

        debug!("Outcome {:?}: {}", outcome.kind, outcome.message);
        self.hub.notify(
            SessionState::Active,
            outcome.message,
            Some(outcome.kind),
            indicator,
        );

        if indicator.is_some() {
            let seq = self.hub.flash();
            let hub = Arc::clone(&self.hub);
            let cancel = self.cancel.clone();
            let hold = self.indicator_hold;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(hold) => hub.clear_indicator(seq),
                }
            });
        }
    }

    async fn capture_and_send(&mut self) {
        if self.channel.state() != ChannelState::Open {
            debug!("Skipping frame, channel not open");
            return;
        }
        let Some(session_id) = self.session.id.clone() else {
            debug!("Skipping frame, no session id assigned yet");
            return;
        };

        match self.capture.produce(&mut self.guard).await {
            Ok(frame) => {
                // stop() may have landed while the capture was in flight;
                // the completed frame is discarded, not sent.
                if self.cancel.is_cancelled() {
                    debug!("Discarding frame {} captured during shutdown", frame.sequence);
                    return;
                }

                let message = ClientMessage::Frame {
                    session_id,
                    image: frame.image,
                };
                if let Err(e) = self.channel.send(&message).await {
                    warn!("Frame send failed: {}", e);
                }
            }
            Err(e) => warn!("Frame capture failed: {}", e),
        }
    }

    async fn teardown(mut self, cause: EndCause) {
        self.session.state = SessionState::Ending;
        self.hub
            .notify(SessionState::Ending, "Ending session", None, None);

        // The backend already ended the session; re-sending end-session
        // would be answered with an error.
        let backend_ended = matches!(&cause, EndCause::BackendEnded { .. });
        if !backend_ended && self.channel.state() == ChannelState::Open {
            match self.session.id.clone() {
                Some(session_id) => {
                    let message = ClientMessage::EndSession { session_id };
                    if let Err(e) = self.channel.send(&message).await {
                        warn!("Failed to send end-session message: {}", e);
                    }
                }
                None => debug!("No session id assigned, skipping end-session message"),
            }
        }

        // Give outcomes for frames already in flight a short window to land.
        if matches!(&cause, EndCause::ClientStop) && self.channel.state() == ChannelState::Open {
            self.drain_outcomes().await;
        }

        self.channel.close().await;
        self.guard.release();

        self.session.state = SessionState::Closed;
        let (text, outcome) = match cause {
            EndCause::ClientStop => ("Session ended".to_string(), None),
            EndCause::BackendEnded { status } => (status, Some(OutcomeKind::Ended)),
            EndCause::ChannelFatal(e) => (format!("Connection lost: {}", e), None),
            EndCause::ChannelClosed { graceful: true } => {
                ("Session ended - connection closed".to_string(), None)
            }
            EndCause::ChannelClosed { graceful: false } => ("Connection lost".to_string(), None),
        };
        info!("Session closed: {}", text);
        self.hub.notify(SessionState::Closed, text, outcome, None);
    }

    async fn drain_outcomes(&mut self) {
        let deadline = tokio::time::Instant::now() + self.drain_window;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.channel.recv()).await {
                Ok(event) => event,
                Err(_) => return, // drain window elapsed
            };

            match event {
                Some(ChannelEvent::Message(message)) => {
                    let Some(disposition) = reconcile(&message) else {
                        continue;
                    };
                    if !disposition.continues {
                        return;
                    }
                    debug!("Late outcome during drain: {}", disposition.outcome.message);
                    self.hub.notify(
                        SessionState::Ending,
                        disposition.outcome.message,
                        Some(disposition.outcome.kind),
                        None,
                    );
                }
                _ => return,
            }
        }
    }
}
