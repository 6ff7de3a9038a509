//! Orchestration of a fleet of shards.
//!
//! The cluster fetches the gateway endpoint and session-start quota,
//! spawns shards one at a time with a stagger, aggregates per-shard
//! readiness into cluster readiness, and buffers most events until the
//! whole fleet is ready. Recoverable shard failures are re-queued;
//! unrecoverable ones fail fast during the initial spawn and are
//! reported (without touching siblings) afterwards.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use concord_rest::{Method, RequestDispatcher};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::error::GatewayError;
use crate::events::{ClusterEvent, DispatchEvent, ShardSignal};
use crate::protocol::{GatewayBot, GatewayPayload};
use crate::shard::{RunOutcome, Shard, ShardCommand};

type ShardTask = (Shard, Result<RunOutcome, GatewayError>);

/// Commands sent into a running cluster through its handle.
#[derive(Debug)]
enum ClusterCommand {
    /// Send a payload to every connected shard.
    Broadcast(GatewayPayload),
    /// Tear down every shard and stop.
    Destroy,
}

/// Control handle for a running [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterHandle {
    commands: mpsc::UnboundedSender<ClusterCommand>,
}

impl ClusterHandle {
    /// Queue a payload on every connected shard's send queue.
    pub fn broadcast(&self, payload: GatewayPayload) {
        let _ = self.commands.send(ClusterCommand::Broadcast(payload));
    }

    /// Tear down every shard and stop the cluster.
    pub fn destroy(&self) {
        let _ = self.commands.send(ClusterCommand::Destroy);
    }
}

/// Owns N shards and drives their lifecycles.
pub struct Cluster {
    config: Arc<ClusterConfig>,
    rest: Arc<RequestDispatcher>,
    events: mpsc::UnboundedSender<ClusterEvent>,
    commands: mpsc::UnboundedReceiver<ClusterCommand>,
}

impl Cluster {
    /// Build a cluster. Returns the cluster itself (drive it with
    /// [`Cluster::run`]), a control handle, and the event stream.
    #[must_use]
    pub fn new(
        config: ClusterConfig,
        rest: Arc<RequestDispatcher>,
    ) -> (Self, ClusterHandle, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            Self {
                config: Arc::new(config),
                rest,
                events: events_tx,
                commands: commands_rx,
            },
            ClusterHandle {
                commands: commands_tx,
            },
            events_rx,
        )
    }

    /// Connect and run until destroyed.
    ///
    /// Fetches the gateway endpoint, queues every shard, and drives the
    /// spawn/reconnect loop.
    ///
    /// # Errors
    ///
    /// Fails fast on authentication failure or an unrecoverable close
    /// during the initial spawn phase. After the cluster is ready, a
    /// single shard's terminal failure is reported as an event instead.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let bot = self.fetch_gateway().await?;
        let total = self.config.shard_count.unwrap_or(bot.shards).max(1);
        let quota = &bot.session_start_limit;
        info!(
            shards = total,
            sessions_remaining = quota.remaining,
            sessions_total = quota.total,
            max_concurrency = quota.max_concurrency,
            "Gateway endpoint resolved"
        );
        if quota.remaining < total {
            warn!(
                shards = total,
                sessions_remaining = quota.remaining,
                reset_after_ms = quota.reset_after,
                "Session-start quota below shard count"
            );
        }

        let url = format!("{}/?v=9&encoding=json&compress=zlib-stream", bot.url);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
        let mut fleet = FleetState::new(
            total,
            url,
            Duration::from_millis(self.config.spawn_stagger_ms),
        );
        for id in 0..total {
            fleet.spawn_queue.push_back(Shard::new(
                id,
                total,
                Arc::clone(&self.config),
                signal_tx.clone(),
            ));
        }
        let mut tasks: JoinSet<ShardTask> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ClusterCommand::Broadcast(payload)) => fleet.broadcast(payload),
                        Some(ClusterCommand::Destroy) | None => {
                            info!("Destroying cluster");
                            fleet.destroy_all();
                            tasks.shutdown().await;
                            return Ok(());
                        },
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.handle_shard_exit(&mut fleet, joined)?;
                }

                Some((shard_id, signal)) = signal_rx.recv() => {
                    self.handle_signal(&mut fleet, shard_id, signal)?;
                }

                () = tokio::time::sleep_until(fleet.next_spawn_at),
                    if fleet.spawning.is_none() && !fleet.spawn_queue.is_empty() =>
                {
                    fleet.spawn_next(&mut tasks);
                }

                () = std::future::ready(()), if fleet.ready && !fleet.buffer.is_empty() => {
                    if let Some((shard, event)) = fleet.buffer.pop_front() {
                        self.emit(ClusterEvent::Dispatch { shard, event })?;
                    }
                    // One event per pass so release never blocks inbound
                    // traffic.
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Resolve the gateway endpoint and session-start quota.
    async fn fetch_gateway(&self) -> Result<GatewayBot, GatewayError> {
        let body = self
            .rest
            .request(Method::GET, "/gateway/bot", true, None)
            .await
            .map_err(|e| {
                if e.status() == Some(401) {
                    GatewayError::AuthenticationFailed
                } else {
                    GatewayError::Rest(e)
                }
            })?;
        let json = body
            .into_json()
            .ok_or_else(|| GatewayError::Protocol("gateway info response was not JSON".into()))?;
        Ok(serde_json::from_value(json)?)
    }

    /// Process the end of one shard task.
    fn handle_shard_exit(
        &self,
        fleet: &mut FleetState,
        joined: Result<ShardTask, JoinError>,
    ) -> Result<(), GatewayError> {
        let (shard, outcome) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Shard task failed");
                return Ok(());
            },
        };
        let id = shard.id();
        fleet.running.remove(&id);
        if fleet.spawning == Some(id) {
            fleet.spawning = None;
            fleet.next_spawn_at = Instant::now() + fleet.stagger;
        }

        match outcome {
            Ok(RunOutcome::Destroyed) => {
                debug!(shard = id, "Shard destroyed");
                Ok(())
            },
            Ok(outcome) => {
                debug!(shard = id, outcome = ?outcome, "Shard dropped, re-queueing");
                fleet.ready_shards.remove(&id);
                self.emit(ClusterEvent::ShardReconnecting { shard: id })?;
                fleet.spawn_queue.push_back(shard);
                Ok(())
            },
            Err(e) if e.is_fatal() => {
                if fleet.ready {
                    // Siblings and in-flight REST calls are unaffected.
                    error!(shard = id, error = %e, "Shard terminally disconnected");
                    fleet.ready_shards.remove(&id);
                    let code = match e {
                        GatewayError::UnrecoverableClose(code) => Some(code),
                        GatewayError::AuthenticationFailed => Some(4004),
                        _ => None,
                    };
                    self.emit(ClusterEvent::ShardDisconnected { shard: id, code })
                } else {
                    error!(shard = id, error = %e, "Fatal failure during spawn");
                    Err(e)
                }
            },
            Err(e) => {
                warn!(shard = id, error = %e, "Shard connection error, re-queueing");
                fleet.ready_shards.remove(&id);
                self.emit(ClusterEvent::ShardReconnecting { shard: id })?;
                fleet.spawn_queue.push_back(shard);
                Ok(())
            },
        }
    }

    /// Process a lifecycle signal from a running shard.
    fn handle_signal(
        &self,
        fleet: &mut FleetState,
        shard_id: u32,
        signal: ShardSignal,
    ) -> Result<(), GatewayError> {
        match signal {
            ShardSignal::AllReady { unavailable } => {
                if !unavailable.is_empty() {
                    warn!(
                        shard = shard_id,
                        unavailable = unavailable.len(),
                        "Shard ready with unconfirmed guilds"
                    );
                }
                fleet.ready_shards.insert(shard_id);
                self.emit(ClusterEvent::ShardReady { shard: shard_id })?;
                if fleet.spawning == Some(shard_id) {
                    fleet.spawning = None;
                    fleet.next_spawn_at = Instant::now() + fleet.stagger;
                }
                if !fleet.ready && fleet.ready_shards.len() == fleet.total as usize {
                    fleet.ready = true;
                    info!(
                        shards = fleet.total,
                        mean_ping_ms = fleet.mean_ping(),
                        buffered = fleet.buffer.len(),
                        "Cluster ready"
                    );
                    self.emit(ClusterEvent::Ready)?;
                }
                Ok(())
            },
            ShardSignal::Dispatch(event) => {
                if fleet.ready || !event.kind.buffered_before_ready() {
                    self.emit(ClusterEvent::Dispatch {
                        shard: shard_id,
                        event,
                    })
                } else {
                    fleet.buffer.push_back((shard_id, event));
                    Ok(())
                }
            },
            ShardSignal::Close { code } => {
                debug!(shard = shard_id, code, "Shard reported close");
                Ok(())
            },
            ShardSignal::InvalidSession { resumable } => {
                debug!(shard = shard_id, resumable, "Shard reported invalid session");
                Ok(())
            },
            ShardSignal::Destroyed => Ok(()),
        }
    }

    fn emit(&self, event: ClusterEvent) -> Result<(), GatewayError> {
        self.events.send(event).map_err(|_| GatewayError::Shutdown)
    }
}

// ── Fleet state ──────────────────────────────────────────────

/// Mutable bookkeeping for the running fleet.
struct FleetState {
    total: u32,
    url: String,
    stagger: Duration,
    /// Shards waiting to be (re)spawned, in order.
    spawn_queue: VecDeque<Shard>,
    /// Command pipes into currently running shards.
    running: HashMap<u32, mpsc::UnboundedSender<ShardCommand>>,
    /// Per-shard heartbeat round-trip handles.
    pings: HashMap<u32, Arc<AtomicU64>>,
    ready_shards: HashSet<u32>,
    ready: bool,
    /// Events withheld until the fleet is ready.
    buffer: VecDeque<(u32, DispatchEvent)>,
    /// Shard currently working through its connect handshake, if any.
    spawning: Option<u32>,
    next_spawn_at: Instant,
}

impl FleetState {
    fn new(total: u32, url: String, stagger: Duration) -> Self {
        Self {
            total,
            url,
            stagger,
            spawn_queue: VecDeque::new(),
            running: HashMap::new(),
            pings: HashMap::new(),
            ready_shards: HashSet::new(),
            ready: false,
            buffer: VecDeque::new(),
            spawning: None,
            next_spawn_at: Instant::now(),
        }
    }

    /// Launch the next queued shard. Spawning stays serialized: the next
    /// launch waits for this shard's connect outcome plus the stagger.
    fn spawn_next(&mut self, tasks: &mut JoinSet<ShardTask>) {
        let Some(shard) = self.spawn_queue.pop_front() else {
            return;
        };
        let id = shard.id();
        info!(shard = id, "Spawning shard");
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.running.insert(id, commands_tx);
        self.pings.insert(id, shard.ping_handle());
        self.spawning = Some(id);
        let url = self.url.clone();
        tasks.spawn(async move {
            let mut shard = shard;
            let outcome = shard.run(&url, commands_rx).await;
            (shard, outcome)
        });
    }

    fn broadcast(&self, payload: GatewayPayload) {
        for commands in self.running.values() {
            let _ = commands.send(ShardCommand::Send(payload.clone()));
        }
    }

    fn destroy_all(&self) {
        for commands in self.running.values() {
            let _ = commands.send(ShardCommand::Destroy);
        }
    }

    /// Mean heartbeat round trip across shards that have measured one.
    fn mean_ping(&self) -> u64 {
        let samples: Vec<u64> = self
            .pings
            .values()
            .map(|p| p.load(Ordering::Acquire))
            .filter(|&p| p > 0)
            .collect();
        if samples.is_empty() {
            return 0;
        }
        samples.iter().sum::<u64>() / samples.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchKind;
    use concord_rest::RestConfig;

    fn test_cluster(base_url: String) -> (Cluster, mpsc::UnboundedReceiver<ClusterEvent>) {
        let mut rest_config = RestConfig::new("Bot test-token");
        rest_config.base_url = base_url;
        let rest = Arc::new(RequestDispatcher::new(rest_config).expect("client"));
        let (cluster, _handle, events) = Cluster::new(ClusterConfig::new("test-token", 0), rest);
        (cluster, events)
    }

    fn dispatch(kind: DispatchKind, name: &str) -> ShardSignal {
        ShardSignal::Dispatch(DispatchEvent {
            kind,
            name: name.to_owned(),
            data: None,
            sequence: Some(1),
        })
    }

    // ── fetch_gateway ────────────────────────────────────────

    #[tokio::test]
    async fn fetch_gateway_parses_endpoint_and_quota() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/gateway/bot"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(
                serde_json::json!({
                    "url": "wss://gateway.example",
                    "shards": 2,
                    "session_start_limit": {
                        "total": 1000,
                        "remaining": 998,
                        "reset_after": 14400000,
                        "max_concurrency": 1
                    }
                }),
            ))
            .mount(&server)
            .await;

        let (cluster, _events) = test_cluster(server.uri());
        let bot = cluster.fetch_gateway().await.expect("gateway info");
        assert_eq!(bot.url, "wss://gateway.example");
        assert_eq!(bot.shards, 2);
        assert_eq!(bot.session_start_limit.remaining, 998);
    }

    #[tokio::test]
    async fn unauthorized_gateway_fetch_fails_fast() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/gateway/bot"))
            .respond_with(wiremock::ResponseTemplate::new(401).set_body_json(
                serde_json::json!({ "code": 0, "message": "401: Unauthorized" }),
            ))
            .mount(&server)
            .await;

        let (cluster, _events) = test_cluster(server.uri());
        let err = cluster.fetch_gateway().await.expect_err("must fail");
        assert!(matches!(err, GatewayError::AuthenticationFailed));
    }

    // ── Buffering and readiness ──────────────────────────────

    #[tokio::test]
    async fn pre_ready_events_are_buffered_unless_whitelisted() {
        let (cluster, mut events) = test_cluster("http://unused".into());
        let mut fleet = FleetState::new(2, String::new(), Duration::from_secs(5));

        cluster
            .handle_signal(&mut fleet, 0, dispatch(DispatchKind::Unknown, "MESSAGE_CREATE"))
            .unwrap();
        assert_eq!(fleet.buffer.len(), 1);
        assert!(events.try_recv().is_err(), "buffered event must not emit");

        cluster
            .handle_signal(
                &mut fleet,
                0,
                dispatch(DispatchKind::GuildCreate, "GUILD_CREATE"),
            )
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(ClusterEvent::Dispatch { shard: 0, .. })
        ));
        assert_eq!(fleet.buffer.len(), 1);
    }

    #[tokio::test]
    async fn post_ready_events_pass_straight_through() {
        let (cluster, mut events) = test_cluster("http://unused".into());
        let mut fleet = FleetState::new(1, String::new(), Duration::from_secs(5));
        fleet.ready = true;

        cluster
            .handle_signal(&mut fleet, 0, dispatch(DispatchKind::Unknown, "MESSAGE_CREATE"))
            .unwrap();
        assert!(fleet.buffer.is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(ClusterEvent::Dispatch { shard: 0, .. })
        ));
    }

    #[tokio::test]
    async fn cluster_ready_fires_when_every_shard_reports() {
        let (cluster, mut events) = test_cluster("http://unused".into());
        let mut fleet = FleetState::new(2, String::new(), Duration::from_secs(5));

        cluster
            .handle_signal(
                &mut fleet,
                0,
                ShardSignal::AllReady {
                    unavailable: Vec::new(),
                },
            )
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(ClusterEvent::ShardReady { shard: 0 })
        ));
        assert!(!fleet.ready);

        cluster
            .handle_signal(
                &mut fleet,
                1,
                ShardSignal::AllReady {
                    unavailable: Vec::new(),
                },
            )
            .unwrap();
        assert!(matches!(
            events.try_recv(),
            Ok(ClusterEvent::ShardReady { shard: 1 })
        ));
        assert!(matches!(events.try_recv(), Ok(ClusterEvent::Ready)));
        assert!(fleet.ready);
    }

    #[tokio::test]
    async fn shard_ready_releases_the_spawn_stagger() {
        let (cluster, _events) = test_cluster("http://unused".into());
        let mut fleet = FleetState::new(2, String::new(), Duration::from_secs(5));
        fleet.spawning = Some(0);

        let before = Instant::now();
        cluster
            .handle_signal(
                &mut fleet,
                0,
                ShardSignal::AllReady {
                    unavailable: Vec::new(),
                },
            )
            .unwrap();
        assert!(fleet.spawning.is_none());
        assert!(fleet.next_spawn_at >= before + Duration::from_secs(4));
    }

    // ── mean ping ────────────────────────────────────────────

    #[test]
    fn mean_ping_ignores_unmeasured_shards() {
        let mut fleet = FleetState::new(3, String::new(), Duration::from_secs(5));
        fleet.pings.insert(0, Arc::new(AtomicU64::new(40)));
        fleet.pings.insert(1, Arc::new(AtomicU64::new(60)));
        fleet.pings.insert(2, Arc::new(AtomicU64::new(0)));
        assert_eq!(fleet.mean_ping(), 50);
    }

    #[test]
    fn mean_ping_is_zero_without_samples() {
        let fleet = FleetState::new(1, String::new(), Duration::from_secs(5));
        assert_eq!(fleet.mean_ping(), 0);
    }
}
