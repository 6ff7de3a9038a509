//! One gateway connection's full protocol state machine.
//!
//! A shard connects, handshakes, identifies or resumes, heartbeats, and
//! tracks guild availability until ready. It runs as a single task; a
//! heartbeat task and a socket writer task are spawned per connection
//! and torn down with it. Session state survives across runs so the
//! cluster can re-offer the shard for a resume.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use crate::compression::TransportInflater;
use crate::config::ClusterConfig;
use crate::error::GatewayError;
use crate::events::{DispatchEvent, DispatchKind, ShardSignal};
use crate::protocol::{
    self, CloseDisposition, GatewayPayload, HelloPayload, ReadyPayload, close_disposition, opcode,
};

/// Timeout for receiving Hello after the socket opens.
const HELLO_TIMEOUT: Duration = Duration::from_secs(20);

/// Outbound send quota: frames per window.
const SEND_LIMIT: u32 = 120;

/// Outbound send quota window.
const SEND_WINDOW: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsReader = SplitStream<WsStream>;
type WsWriter = SplitSink<WsStream, Message>;

// ── Status ───────────────────────────────────────────────────

/// Lifecycle states of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Created, never connected.
    Idle = 0,
    /// First connection attempt in progress.
    Connecting = 1,
    /// Reconnection attempt in progress (session held).
    Reconnecting = 2,
    /// Socket open, waiting for Hello.
    Handshaking = 3,
    /// Identify sent, waiting for Ready.
    Identifying = 4,
    /// Resume sent, waiting for Resumed.
    Resuming = 5,
    /// Ready received, draining the expected-guilds set.
    WaitingForGuilds = 6,
    /// Fully operational.
    Ready = 7,
    /// Socket closed.
    Disconnected = 8,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Reconnecting,
            3 => Self::Handshaking,
            4 => Self::Identifying,
            5 => Self::Resuming,
            6 => Self::WaitingForGuilds,
            7 => Self::Ready,
            8 => Self::Disconnected,
            _ => Self::Idle,
        }
    }

    /// States in which one slow heartbeat ack is tolerated instead of
    /// declaring the connection a zombie.
    fn tolerates_slow_ack(self) -> bool {
        matches!(
            self,
            Self::Identifying | Self::Resuming | Self::WaitingForGuilds
        )
    }
}

// ── Commands and outcomes ────────────────────────────────────

/// Commands the cluster sends into a running shard.
#[derive(Debug)]
pub(crate) enum ShardCommand {
    /// Queue a payload on the outbound send queue.
    Send(GatewayPayload),
    /// Tear the shard down.
    Destroy,
}

/// Why one run of the shard ended. Fatal conditions are returned as
/// errors instead.
#[derive(Debug)]
pub(crate) enum RunOutcome {
    /// The server closed the socket with a recoverable code.
    Closed {
        /// Close code from the server.
        code: u16,
    },
    /// Heartbeat acks stopped; session preserved for a resume.
    Zombie,
    /// The server requested a reconnect (op 7).
    ReconnectRequested,
    /// No Hello arrived in time; session reset.
    HelloTimeout,
    /// The socket stream ended without a close frame.
    StreamEnded,
    /// Torn down on command.
    Destroyed,
}

// ── Send queue ───────────────────────────────────────────────

/// Outbound queue with a fixed send quota per window.
///
/// Urgent control frames (heartbeat, identify, resume) are inserted at
/// the front, bypassing ordinary FIFO order.
#[derive(Clone)]
pub(crate) struct SendQueue {
    inner: Arc<SendQueueInner>,
}

struct SendQueueInner {
    queue: std::sync::Mutex<VecDeque<GatewayPayload>>,
    wake: Notify,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            inner: Arc::new(SendQueueInner {
                queue: std::sync::Mutex::new(VecDeque::new()),
                wake: Notify::new(),
            }),
        }
    }

    pub(crate) fn push(&self, payload: GatewayPayload, urgent: bool) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            if urgent {
                queue.push_front(payload);
            } else {
                queue.push_back(payload);
            }
        }
        self.inner.wake.notify_one();
    }

    fn pop(&self) -> Option<GatewayPayload> {
        self.inner.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    async fn next(&self) -> GatewayPayload {
        loop {
            if let Some(payload) = self.pop() {
                return payload;
            }
            self.inner.wake.notified().await;
        }
    }
}

/// Drains the send queue onto the socket, honoring the send quota.
async fn run_writer(queue: SendQueue, mut writer: WsWriter, shard_id: u32) {
    let mut window_start = Instant::now();
    let mut sent: u32 = 0;

    loop {
        let payload = queue.next().await;

        if window_start.elapsed() >= SEND_WINDOW {
            window_start = Instant::now();
            sent = 0;
        }
        if sent >= SEND_LIMIT {
            let resume_at = window_start + SEND_WINDOW;
            debug!(
                shard = shard_id,
                wait_ms = resume_at.saturating_duration_since(Instant::now()).as_millis(),
                "Send quota exhausted, deferring"
            );
            tokio::time::sleep_until(resume_at).await;
            window_start = Instant::now();
            sent = 0;
        }

        let json = match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(e) => {
                warn!(shard = shard_id, error = %e, "Failed to serialize payload");
                continue;
            },
        };
        if let Err(e) = writer.send(Message::Text(json.into())).await {
            debug!(shard = shard_id, error = %e, "Writer task: send failed");
            return;
        }
        sent = sent.saturating_add(1);
    }
}

// ── Heartbeat ────────────────────────────────────────────────

/// Tracks heartbeat health for zombie detection.
struct HeartbeatHealth {
    /// Whether the last sent heartbeat was acknowledged.
    last_ack: bool,
    /// When the pending heartbeat was sent.
    sent_at: Option<Instant>,
    /// Whether one slow ack has already been tolerated this cycle.
    tolerated: bool,
}

impl HeartbeatHealth {
    fn new() -> Self {
        Self {
            last_ack: true,
            sent_at: None,
            tolerated: false,
        }
    }

    /// Record an ack; returns the measured round trip.
    fn ack(&mut self) -> Option<Duration> {
        self.last_ack = true;
        self.tolerated = false;
        self.sent_at.take().map(|sent| sent.elapsed())
    }
}

/// Runs the heartbeat loop for one connection.
///
/// The first beat fires after `interval * jitter` to spread load;
/// subsequent beats fire at exactly the interval. A missed ack is a
/// zombie unless the shard is mid-handshake, where one slow ack is
/// tolerated.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
async fn run_heartbeat(
    shard_id: u32,
    interval_ms: u64,
    sequence: Arc<Mutex<Option<u64>>>,
    health: Arc<Mutex<HeartbeatHealth>>,
    status: Arc<AtomicU8>,
    queue: SendQueue,
    zombie_tx: oneshot::Sender<()>,
) {
    let jitter = f64::from(fastrand::u32(0..1000)) / 1000.0;
    let first_delay = Duration::from_millis((interval_ms as f64 * jitter) as u64);
    debug!(
        shard = shard_id,
        interval_ms,
        first_delay_ms = first_delay.as_millis(),
        "Heartbeat task started"
    );
    tokio::time::sleep(first_delay).await;

    send_beat(&sequence, &health, &queue).await;

    let interval = Duration::from_millis(interval_ms);
    loop {
        tokio::time::sleep(interval).await;

        {
            let mut h = health.lock().await;
            if !h.last_ack {
                let state = Status::from_u8(status.load(Ordering::Acquire));
                if state.tolerates_slow_ack() && !h.tolerated {
                    h.tolerated = true;
                    warn!(shard = shard_id, status = ?state, "Slow heartbeat ack tolerated");
                } else {
                    warn!(shard = shard_id, "Heartbeat ack missed, zombie connection");
                    let _ = zombie_tx.send(());
                    return;
                }
            }
        }

        send_beat(&sequence, &health, &queue).await;
    }
}

/// Send one heartbeat with the current sequence, marking it pending.
async fn send_beat(
    sequence: &Arc<Mutex<Option<u64>>>,
    health: &Arc<Mutex<HeartbeatHealth>>,
    queue: &SendQueue,
) {
    let seq = *sequence.lock().await;
    {
        let mut h = health.lock().await;
        if h.last_ack {
            h.last_ack = false;
            h.sent_at = Some(Instant::now());
        }
    }
    trace!(seq = ?seq, "Sending heartbeat");
    queue.push(protocol::build_heartbeat(seq), true);
}

// ── Shard ────────────────────────────────────────────────────

/// One gateway connection, identified by its shard index.
pub(crate) struct Shard {
    id: u32,
    total: u32,
    config: Arc<ClusterConfig>,
    session_id: Option<String>,
    sequence: Arc<Mutex<Option<u64>>>,
    close_sequence: Option<u64>,
    status: Arc<AtomicU8>,
    ping_ms: Arc<AtomicU64>,
    signals: mpsc::UnboundedSender<(u32, ShardSignal)>,
}

impl Shard {
    pub(crate) fn new(
        id: u32,
        total: u32,
        config: Arc<ClusterConfig>,
        signals: mpsc::UnboundedSender<(u32, ShardSignal)>,
    ) -> Self {
        Self {
            id,
            total,
            config,
            session_id: None,
            sequence: Arc::new(Mutex::new(None)),
            close_sequence: None,
            status: Arc::new(AtomicU8::new(Status::Idle as u8)),
            ping_ms: Arc::new(AtomicU64::new(0)),
            signals,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Shared handle to this shard's measured heartbeat round trip.
    pub(crate) fn ping_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.ping_ms)
    }

    /// Forget the session so the next run identifies fresh. Waits for
    /// the sequence lock so the reset cannot be skipped while the
    /// heartbeat task holds it.
    pub(crate) async fn clear_session(&mut self) {
        self.session_id = None;
        self.close_sequence = None;
        *self.sequence.lock().await = None;
    }

    fn can_resume(&self) -> bool {
        self.session_id.is_some()
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
        trace!(shard = self.id, status = ?status, "Status change");
    }

    fn signal(&self, signal: ShardSignal) {
        let _ = self.signals.send((self.id, signal));
    }

    /// Run one connection lifecycle: connect, handshake, event loop.
    ///
    /// Returns how the run ended; fatal conditions (bad token,
    /// unrecoverable close codes) are errors. Session state is preserved
    /// on the shard unless the server invalidated it.
    pub(crate) async fn run(
        &mut self,
        url: &str,
        mut commands: mpsc::UnboundedReceiver<ShardCommand>,
    ) -> Result<RunOutcome, GatewayError> {
        self.set_status(if self.can_resume() {
            Status::Reconnecting
        } else {
            Status::Connecting
        });
        info!(shard = self.id, resuming = self.can_resume(), "Connecting to gateway");

        let (ws, _response) = connect_async(url).await?;
        let (writer, mut reader) = ws.split();
        self.set_status(Status::Handshaking);

        let mut inflater = TransportInflater::new();
        let hello = match tokio::time::timeout(
            HELLO_TIMEOUT,
            wait_for_hello(&mut reader, &mut inflater),
        )
        .await
        {
            Ok(Ok(hello)) => hello,
            Ok(Err(GatewayError::Closed(code))) => {
                return self.close_outcome(code).await;
            },
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(shard = self.id, "No Hello within 20s, resetting session");
                self.clear_session().await;
                return Ok(RunOutcome::HelloTimeout);
            },
        };

        let queue = SendQueue::new();
        let writer_handle = tokio::spawn(run_writer(queue.clone(), writer, self.id));

        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let (zombie_tx, zombie_rx) = oneshot::channel();
        let heartbeat_handle = tokio::spawn(run_heartbeat(
            self.id,
            hello.heartbeat_interval,
            Arc::clone(&self.sequence),
            Arc::clone(&health),
            Arc::clone(&self.status),
            queue.clone(),
            zombie_tx,
        ));

        self.send_auth(&queue).await;

        let outcome = self
            .event_loop(&mut reader, &mut inflater, &mut commands, &queue, &health, zombie_rx)
            .await;

        heartbeat_handle.abort();
        writer_handle.abort();
        self.set_status(Status::Disconnected);
        outcome
    }

    /// Send Identify (fresh session) or Resume (held session), urgently.
    async fn send_auth(&self, queue: &SendQueue) {
        if let Some(session_id) = &self.session_id {
            let seq = match self.close_sequence {
                Some(seq) => seq,
                None => self.sequence.lock().await.unwrap_or(0),
            };
            info!(shard = self.id, seq, "Resuming session");
            self.set_status(Status::Resuming);
            queue.push(
                protocol::build_resume(&self.config.token, session_id, seq),
                true,
            );
        } else {
            info!(shard = self.id, "Identifying");
            self.set_status(Status::Identifying);
            queue.push(
                protocol::build_identify(
                    &self.config.token,
                    self.config.intents,
                    self.id,
                    self.total,
                ),
                true,
            );
        }
    }

    /// Main event loop after the handshake.
    async fn event_loop(
        &mut self,
        reader: &mut WsReader,
        inflater: &mut TransportInflater,
        commands: &mut mpsc::UnboundedReceiver<ShardCommand>,
        queue: &SendQueue,
        health: &Arc<Mutex<HeartbeatHealth>>,
        mut zombie_rx: oneshot::Receiver<()>,
    ) -> Result<RunOutcome, GatewayError> {
        let mut expected_guilds: HashSet<String> = HashSet::new();
        let mut ready_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => {
                    match cmd {
                        Some(ShardCommand::Send(payload)) => queue.push(payload, false),
                        Some(ShardCommand::Destroy) | None => {
                            info!(shard = self.id, "Shard destroyed");
                            self.signal(ShardSignal::Destroyed);
                            return Ok(RunOutcome::Destroyed);
                        },
                    }
                }

                _ = &mut zombie_rx => {
                    // Session intact: the next run resumes.
                    return Ok(RunOutcome::Zombie);
                }

                () = async {
                    if let Some(deadline) = ready_deadline {
                        tokio::time::sleep_until(deadline).await;
                    }
                }, if ready_deadline.is_some() => {
                    let unavailable: Vec<String> = expected_guilds.drain().collect();
                    warn!(
                        shard = self.id,
                        unavailable = unavailable.len(),
                        "Guild sync timed out, forcing readiness"
                    );
                    ready_deadline = None;
                    self.set_status(Status::Ready);
                    self.signal(ShardSignal::AllReady { unavailable });
                }

                msg = reader.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match inflater.push(&data) {
                                Ok(Some(bytes)) => {
                                    match serde_json::from_slice::<GatewayPayload>(&bytes) {
                                        Ok(payload) => {
                                            if let Some(outcome) = self
                                                .handle_payload(
                                                    payload,
                                                    queue,
                                                    health,
                                                    &mut expected_guilds,
                                                    &mut ready_deadline,
                                                )
                                                .await
                                            {
                                                return Ok(outcome);
                                            }
                                        },
                                        Err(e) => {
                                            warn!(shard = self.id, error = %e, "Undecodable frame");
                                        },
                                    }
                                },
                                Ok(None) => {},
                                Err(e) => {
                                    warn!(shard = self.id, error = %e, "Inflate failure");
                                },
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<GatewayPayload>(&text) {
                                Ok(payload) => {
                                    if let Some(outcome) = self
                                        .handle_payload(
                                            payload,
                                            queue,
                                            health,
                                            &mut expected_guilds,
                                            &mut ready_deadline,
                                        )
                                        .await
                                    {
                                        return Ok(outcome);
                                    }
                                },
                                Err(e) => {
                                    warn!(shard = self.id, error = %e, "Undecodable frame");
                                },
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map_or(1000, |f| f.code.into());
                            return self.close_outcome(code).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(shard = self.id, error = %e, "Socket read error");
                            return Ok(RunOutcome::StreamEnded);
                        }
                        None => {
                            warn!(shard = self.id, "Socket stream ended");
                            return Ok(RunOutcome::StreamEnded);
                        }
                    }
                }
            }
        }
    }

    /// Handle one decoded payload. Returns `Some` when the run ends.
    async fn handle_payload(
        &mut self,
        payload: GatewayPayload,
        queue: &SendQueue,
        health: &Arc<Mutex<HeartbeatHealth>>,
        expected_guilds: &mut HashSet<String>,
        ready_deadline: &mut Option<Instant>,
    ) -> Option<RunOutcome> {
        match payload.op {
            opcode::DISPATCH => {
                self.handle_dispatch(payload, queue, expected_guilds, ready_deadline)
                    .await;
                None
            },
            opcode::HEARTBEAT => {
                // The server may demand an immediate beat.
                let seq = *self.sequence.lock().await;
                queue.push(protocol::build_heartbeat(seq), true);
                None
            },
            opcode::HEARTBEAT_ACK => {
                if let Some(rtt) = health.lock().await.ack() {
                    let ping = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX);
                    self.ping_ms.store(ping, Ordering::Release);
                    trace!(shard = self.id, ping_ms = ping, "Heartbeat ack");
                }
                None
            },
            opcode::RECONNECT => {
                info!(shard = self.id, "Server requested reconnect");
                Some(RunOutcome::ReconnectRequested)
            },
            opcode::INVALID_SESSION => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                self.signal(ShardSignal::InvalidSession { resumable });
                self.handle_invalid_session(resumable, queue).await;
                None
            },
            opcode::HELLO => {
                warn!(shard = self.id, "Unexpected Hello mid-session");
                None
            },
            _ => {
                debug!(shard = self.id, op = payload.op, "Unknown opcode");
                None
            },
        }
    }

    /// Handle a dispatch event (op 0).
    async fn handle_dispatch(
        &mut self,
        payload: GatewayPayload,
        queue: &SendQueue,
        expected_guilds: &mut HashSet<String>,
        ready_deadline: &mut Option<Instant>,
    ) {
        if let Some(seq) = payload.s {
            *self.sequence.lock().await = Some(seq);
        }

        let name = payload.t.unwrap_or_default();
        let kind = DispatchKind::from_name(&name);

        match kind {
            DispatchKind::Ready => {
                self.handle_ready(payload.d.as_ref(), queue, expected_guilds, ready_deadline);
            },
            DispatchKind::Resumed => {
                let replayed = match (self.close_sequence, *self.sequence.lock().await) {
                    (Some(closed), Some(current)) => current.saturating_sub(closed),
                    _ => 0,
                };
                info!(shard = self.id, replayed, "Session resumed");
                self.close_sequence = None;
                self.set_status(Status::Ready);
                self.signal(ShardSignal::AllReady {
                    unavailable: Vec::new(),
                });
            },
            DispatchKind::GuildCreate | DispatchKind::GuildDelete => {
                self.note_guild_availability(payload.d.as_ref(), expected_guilds, ready_deadline);
            },
            _ => {},
        }

        self.signal(ShardSignal::Dispatch(DispatchEvent {
            kind,
            name,
            data: payload.d,
            sequence: payload.s,
        }));
    }

    /// Handle the Ready dispatch: record the session, collect expected
    /// guilds, and prove liveness with an immediate heartbeat.
    fn handle_ready(
        &mut self,
        data: Option<&serde_json::Value>,
        queue: &SendQueue,
        expected_guilds: &mut HashSet<String>,
        ready_deadline: &mut Option<Instant>,
    ) {
        let Some(data) = data else {
            warn!(shard = self.id, "Ready event missing data");
            return;
        };
        let ready: ReadyPayload = match serde_json::from_value(data.clone()) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(shard = self.id, error = %e, "Undecodable Ready payload");
                return;
            },
        };

        info!(
            shard = self.id,
            session_id = %ready.session_id,
            guilds = ready.guilds.len(),
            "Session established"
        );
        self.session_id = Some(ready.session_id);
        self.close_sequence = None;
        *expected_guilds = ready.guilds.into_iter().map(|g| g.id).collect();

        queue.push(protocol::build_heartbeat(None), true);

        if expected_guilds.is_empty() {
            self.set_status(Status::Ready);
            self.signal(ShardSignal::AllReady {
                unavailable: Vec::new(),
            });
        } else {
            self.set_status(Status::WaitingForGuilds);
            *ready_deadline =
                Some(Instant::now() + Duration::from_millis(self.config.guild_ready_timeout_ms));
        }
    }

    /// Drain the expected-guilds set as availability events arrive.
    fn note_guild_availability(
        &mut self,
        data: Option<&serde_json::Value>,
        expected_guilds: &mut HashSet<String>,
        ready_deadline: &mut Option<Instant>,
    ) {
        if Status::from_u8(self.status.load(Ordering::Acquire)) != Status::WaitingForGuilds {
            return;
        }
        let Some(id) = data
            .and_then(|d| d.get("id"))
            .and_then(serde_json::Value::as_str)
        else {
            return;
        };
        expected_guilds.remove(id);
        trace!(shard = self.id, guild = id, remaining = expected_guilds.len(), "Guild confirmed");
        if expected_guilds.is_empty() {
            *ready_deadline = None;
            self.set_status(Status::Ready);
            self.signal(ShardSignal::AllReady {
                unavailable: Vec::new(),
            });
        }
    }

    /// Handle an invalid-session notice (op 9) on the live socket.
    async fn handle_invalid_session(&mut self, resumable: bool, queue: &SendQueue) {
        if resumable && self.can_resume() {
            info!(shard = self.id, "Invalid session (resumable), resuming");
            self.send_auth(queue).await;
            return;
        }

        info!(shard = self.id, "Invalid session, identifying fresh");
        self.clear_session().await;
        self.set_status(Status::Identifying);
        // The server asks for a randomized wait before re-identifying.
        let payload =
            protocol::build_identify(&self.config.token, self.config.intents, self.id, self.total);
        let queue = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(1000..5000))).await;
            queue.push(payload, true);
        });
    }

    /// Capture the close sequence and classify the close code.
    async fn close_outcome(&mut self, code: u16) -> Result<RunOutcome, GatewayError> {
        self.close_sequence = *self.sequence.lock().await;
        match close_disposition(code) {
            CloseDisposition::Unrecoverable => {
                if code == 4004 {
                    Err(GatewayError::AuthenticationFailed)
                } else {
                    Err(GatewayError::UnrecoverableClose(code))
                }
            },
            CloseDisposition::Unresumable => {
                info!(shard = self.id, code, "Closed, session invalidated");
                self.clear_session().await;
                self.signal(ShardSignal::Close { code });
                Ok(RunOutcome::Closed { code })
            },
            CloseDisposition::Resumable => {
                warn!(shard = self.id, code, "Closed, will attempt resume");
                self.signal(ShardSignal::Close { code });
                Ok(RunOutcome::Closed { code })
            },
        }
    }
}

/// Wait for the Hello payload on a fresh socket, inflating as needed.
async fn wait_for_hello(
    reader: &mut WsReader,
    inflater: &mut TransportInflater,
) -> Result<HelloPayload, GatewayError> {
    loop {
        match reader.next().await {
            Some(Ok(Message::Binary(data))) => {
                if let Some(bytes) = inflater.push(&data)? {
                    let payload: GatewayPayload = serde_json::from_slice(&bytes)?;
                    if let Some(hello) = parse_hello(payload)? {
                        return Ok(hello);
                    }
                }
            },
            Some(Ok(Message::Text(text))) => {
                let payload: GatewayPayload = serde_json::from_str(&text)?;
                if let Some(hello) = parse_hello(payload)? {
                    return Ok(hello);
                }
            },
            Some(Ok(Message::Close(frame))) => {
                let code = frame.as_ref().map_or(1000, |f| f.code.into());
                return Err(GatewayError::Closed(code));
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(GatewayError::Protocol(
                    "connection closed before Hello".into(),
                ));
            },
        }
    }
}

fn parse_hello(payload: GatewayPayload) -> Result<Option<HelloPayload>, GatewayError> {
    if payload.op != opcode::HELLO {
        return Ok(None);
    }
    let data = payload
        .d
        .ok_or_else(|| GatewayError::Protocol("Hello missing data".into()))?;
    Ok(Some(serde_json::from_value(data)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_shard() -> (Shard, mpsc::UnboundedReceiver<(u32, ShardSignal)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(ClusterConfig::new("test-token", 4609));
        (Shard::new(0, 1, config, tx), rx)
    }

    // ── Status ───────────────────────────────────────────────

    #[test]
    fn status_round_trips_through_u8() {
        for status in [
            Status::Idle,
            Status::Connecting,
            Status::Reconnecting,
            Status::Handshaking,
            Status::Identifying,
            Status::Resuming,
            Status::WaitingForGuilds,
            Status::Ready,
            Status::Disconnected,
        ] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
    }

    #[test]
    fn handshake_states_tolerate_slow_acks() {
        assert!(Status::Identifying.tolerates_slow_ack());
        assert!(Status::Resuming.tolerates_slow_ack());
        assert!(Status::WaitingForGuilds.tolerates_slow_ack());
        assert!(!Status::Ready.tolerates_slow_ack());
        assert!(!Status::Handshaking.tolerates_slow_ack());
    }

    // ── SendQueue ────────────────────────────────────────────

    #[test]
    fn send_queue_is_fifo_with_urgent_front_insert() {
        let queue = SendQueue::new();
        queue.push(protocol::build_heartbeat(Some(1)), false);
        queue.push(protocol::build_heartbeat(Some(2)), false);
        queue.push(protocol::build_resume("t", "s", 3), true);

        assert_eq!(queue.pop().unwrap().op, opcode::RESUME);
        assert_eq!(queue.pop().unwrap().d, Some(serde_json::Value::from(1)));
        assert_eq!(queue.pop().unwrap().d, Some(serde_json::Value::from(2)));
        assert!(queue.pop().is_none());
    }

    // ── Heartbeat ────────────────────────────────────────────

    #[tokio::test]
    async fn missed_ack_in_ready_state_is_a_zombie() {
        let sequence = Arc::new(Mutex::new(Some(1u64)));
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        health.lock().await.last_ack = false;
        let status = Arc::new(AtomicU8::new(Status::Ready as u8));
        let queue = SendQueue::new();
        let (zombie_tx, zombie_rx) = oneshot::channel();

        let handle = tokio::spawn(run_heartbeat(
            0,
            20,
            sequence,
            health,
            status,
            queue,
            zombie_tx,
        ));

        tokio::time::timeout(Duration::from_secs(2), zombie_rx)
            .await
            .expect("zombie detected")
            .expect("signal delivered");
        let _ = handle.await;
    }

    #[tokio::test]
    async fn missed_ack_during_handshake_is_tolerated_once() {
        let sequence = Arc::new(Mutex::new(None));
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let status = Arc::new(AtomicU8::new(Status::Identifying as u8));
        let queue = SendQueue::new();
        let (zombie_tx, zombie_rx) = oneshot::channel();

        // First beat marks the ack pending; no ack ever arrives. One
        // slow interval is tolerated, the second is not.
        let handle = tokio::spawn(run_heartbeat(
            0,
            30,
            sequence,
            Arc::clone(&health),
            status,
            queue,
            zombie_tx,
        ));

        let detected = tokio::time::timeout(Duration::from_secs(2), zombie_rx).await;
        assert!(detected.is_ok(), "zombie still fires after the grace beat");
        assert!(health.lock().await.tolerated);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn heartbeat_pushes_beats_with_current_sequence() {
        let sequence = Arc::new(Mutex::new(Some(7u64)));
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let queue = SendQueue::new();

        send_beat(&sequence, &health, &queue).await;

        let beat = queue.pop().expect("heartbeat queued");
        assert_eq!(beat.op, opcode::HEARTBEAT);
        assert_eq!(beat.d, Some(serde_json::Value::from(7)));
        assert!(!health.lock().await.last_ack);
        assert!(health.lock().await.sent_at.is_some());
    }

    #[tokio::test]
    async fn ack_measures_round_trip_and_clears_pending() {
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        {
            let mut h = health.lock().await;
            h.last_ack = false;
            h.sent_at = Some(Instant::now() - Duration::from_millis(50));
        }
        let rtt = health.lock().await.ack().expect("round trip measured");
        assert!(rtt >= Duration::from_millis(50));
        assert!(health.lock().await.last_ack);
        assert!(health.lock().await.sent_at.is_none());
    }

    // ── Dispatch handling ────────────────────────────────────

    #[tokio::test]
    async fn ready_with_guilds_waits_for_confirmation() {
        let (mut shard, mut signals) = test_shard();
        let queue = SendQueue::new();
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: 0,
            d: Some(serde_json::json!({
                "session_id": "sess-1",
                "guilds": [{ "id": "g1" }, { "id": "g2" }, { "id": "g3" }],
            })),
            s: Some(1),
            t: Some("READY".into()),
        };
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert_eq!(expected.len(), 3);
        assert!(deadline.is_some());
        assert_eq!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::WaitingForGuilds
        );
        assert_eq!(shard.session_id.as_deref(), Some("sess-1"));
        // Immediate liveness heartbeat.
        assert_eq!(queue.pop().unwrap().op, opcode::HEARTBEAT);

        // Confirm the guilds one at a time; readiness fires on the last.
        for (i, guild) in ["g1", "g2"].iter().enumerate() {
            let payload = GatewayPayload {
                op: 0,
                d: Some(serde_json::json!({ "id": guild })),
                s: Some(2 + i as u64),
                t: Some("GUILD_CREATE".into()),
            };
            shard
                .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
                .await;
        }
        assert_eq!(expected.len(), 1);
        assert_ne!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::Ready
        );

        let payload = GatewayPayload {
            op: 0,
            d: Some(serde_json::json!({ "id": "g3" })),
            s: Some(4),
            t: Some("GUILD_CREATE".into()),
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert!(expected.is_empty());
        assert!(deadline.is_none());
        assert_eq!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::Ready
        );

        // Dispatch signals for every event, plus exactly one AllReady
        // with an empty unavailable set.
        let mut all_ready = 0;
        while let Ok((_, signal)) = signals.try_recv() {
            if let ShardSignal::AllReady { unavailable } = signal {
                assert!(unavailable.is_empty());
                all_ready += 1;
            }
        }
        assert_eq!(all_ready, 1);
    }

    #[tokio::test]
    async fn ready_without_guilds_is_immediately_ready() {
        let (mut shard, mut signals) = test_shard();
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: 0,
            d: Some(serde_json::json!({ "session_id": "sess-2", "guilds": [] })),
            s: Some(1),
            t: Some("READY".into()),
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert!(deadline.is_none());
        assert_eq!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::Ready
        );
        assert!(matches!(
            signals.try_recv(),
            Ok((0, ShardSignal::AllReady { .. }))
        ));
    }

    #[tokio::test]
    async fn resumed_logs_replay_and_goes_ready() {
        let (mut shard, mut signals) = test_shard();
        shard.session_id = Some("sess".into());
        shard.close_sequence = Some(10);
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: 0,
            d: None,
            s: Some(25),
            t: Some("RESUMED".into()),
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert_eq!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::Ready
        );
        assert!(shard.close_sequence.is_none());
        assert!(matches!(
            signals.try_recv(),
            Ok((0, ShardSignal::AllReady { .. }))
        ));
    }

    #[tokio::test]
    async fn reconnect_opcode_ends_the_run() {
        let (mut shard, _signals) = test_shard();
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: opcode::RECONNECT,
            d: None,
            s: None,
            t: None,
        };
        let outcome = shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;
        assert!(matches!(outcome, Some(RunOutcome::ReconnectRequested)));
    }

    #[tokio::test]
    async fn server_heartbeat_request_queues_immediate_beat() {
        let (mut shard, _signals) = test_shard();
        *shard.sequence.lock().await = Some(55);
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: opcode::HEARTBEAT,
            d: None,
            s: None,
            t: None,
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        let beat = queue.pop().expect("beat queued");
        assert_eq!(beat.op, opcode::HEARTBEAT);
        assert_eq!(beat.d, Some(serde_json::Value::from(55)));
    }

    #[tokio::test]
    async fn resumable_invalid_session_resumes_on_the_live_socket() {
        let (mut shard, mut signals) = test_shard();
        shard.session_id = Some("sess".into());
        shard.close_sequence = Some(40);
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: opcode::INVALID_SESSION,
            d: Some(serde_json::Value::Bool(true)),
            s: None,
            t: None,
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert!(matches!(
            signals.try_recv(),
            Ok((0, ShardSignal::InvalidSession { resumable: true }))
        ));
        let resume = queue.pop().expect("resume queued");
        assert_eq!(resume.op, opcode::RESUME);
        assert_eq!(resume.d.unwrap()["seq"], 40);
        assert_eq!(
            Status::from_u8(shard.status.load(Ordering::Acquire)),
            Status::Resuming
        );
    }

    #[tokio::test]
    async fn unresumable_invalid_session_clears_state_and_reidentifies() {
        let (mut shard, _signals) = test_shard();
        shard.session_id = Some("sess".into());
        *shard.sequence.lock().await = Some(40);
        let queue = SendQueue::new();
        let health = Arc::new(Mutex::new(HeartbeatHealth::new()));
        let mut expected = HashSet::new();
        let mut deadline = None;

        let payload = GatewayPayload {
            op: opcode::INVALID_SESSION,
            d: Some(serde_json::Value::Bool(false)),
            s: None,
            t: None,
        };
        shard
            .handle_payload(payload, &queue, &health, &mut expected, &mut deadline)
            .await;

        assert!(shard.session_id.is_none());
        assert!(shard.sequence.lock().await.is_none());
        // The identify is queued after the server-mandated delay.
        let identify = tokio::time::timeout(Duration::from_secs(6), queue.next())
            .await
            .expect("identify queued");
        assert_eq!(identify.op, opcode::IDENTIFY);
    }

    // ── Close classification ─────────────────────────────────

    #[tokio::test]
    async fn auth_close_is_fatal() {
        let (mut shard, _signals) = test_shard();
        let result = shard.close_outcome(4004).await;
        assert!(matches!(result, Err(GatewayError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn unrecoverable_close_is_fatal() {
        let (mut shard, _signals) = test_shard();
        for code in [4010, 4011, 4012, 4013, 4014] {
            let result = shard.close_outcome(code).await;
            assert!(matches!(
                result,
                Err(GatewayError::UnrecoverableClose(c)) if c == code
            ));
        }
    }

    #[tokio::test]
    async fn unresumable_close_clears_session() {
        let (mut shard, _signals) = test_shard();
        shard.session_id = Some("sess".into());
        *shard.sequence.lock().await = Some(9);

        let outcome = shard.close_outcome(4009).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Closed { code: 4009 }));
        assert!(shard.session_id.is_none());
    }

    #[tokio::test]
    async fn resumable_close_captures_close_sequence() {
        let (mut shard, _signals) = test_shard();
        shard.session_id = Some("sess".into());
        *shard.sequence.lock().await = Some(17);

        let outcome = shard.close_outcome(4000).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Closed { code: 4000 }));
        assert_eq!(shard.session_id.as_deref(), Some("sess"));
        assert_eq!(shard.close_sequence, Some(17));
    }

    #[tokio::test]
    async fn clear_session_forgets_everything() {
        let (mut shard, _signals) = test_shard();
        shard.session_id = Some("sess".into());
        shard.close_sequence = Some(3);
        *shard.sequence.lock().await = Some(12);
        shard.clear_session().await;
        assert!(!shard.can_resume());
        assert!(shard.close_sequence.is_none());
        assert!(shard.sequence.lock().await.is_none());
    }

    #[tokio::test]
    async fn clear_session_waits_for_the_sequence_lock() {
        let (mut shard, _signals) = test_shard();
        shard.session_id = Some("sess".into());
        *shard.sequence.lock().await = Some(12);

        // Hold the lock the way the heartbeat task does mid-beat.
        let sequence = Arc::clone(&shard.sequence);
        let holder = tokio::spawn(async move {
            let guard = sequence.lock().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        shard.clear_session().await;
        assert!(shard.sequence.lock().await.is_none());
        let _ = holder.await;
    }
}
