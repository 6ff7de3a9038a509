//! Cluster configuration.

/// Immutable configuration for the connection cluster, constructed once
/// at startup and shared by reference with every shard.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Bot token used for identify/resume.
    pub token: String,
    /// Gateway intents bitmask.
    pub intents: u32,
    /// Shard count override. `None` uses the server's recommendation.
    pub shard_count: Option<u32>,
    /// Delay between shard spawn attempts (milliseconds).
    pub spawn_stagger_ms: u64,
    /// Bounded wait for the initial guild sync before forcing readiness
    /// (milliseconds).
    pub guild_ready_timeout_ms: u64,
}

impl ClusterConfig {
    /// Configuration with default timings for the given token and
    /// intents.
    #[must_use]
    pub fn new(token: impl Into<String>, intents: u32) -> Self {
        Self {
            token: token.into(),
            intents,
            shard_count: None,
            spawn_stagger_ms: 5000,
            guild_ready_timeout_ms: 15_000,
        }
    }
}
