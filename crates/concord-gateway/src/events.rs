//! Decoded events and lifecycle signals flowing out of shards.

use serde_json::Value;

/// Dispatch event names the core itself consumes.
///
/// Everything else passes through as [`DispatchKind::Unknown`] with the
/// raw name preserved on the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Session established; carries session id and the guild list.
    Ready,
    /// Session resumed after a reconnect.
    Resumed,
    /// Guild became available (or was joined).
    GuildCreate,
    /// Guild became unavailable (or was left).
    GuildDelete,
    /// Chunk of requested guild members.
    GuildMembersChunk,
    /// Member joined a guild.
    GuildMemberAdd,
    /// Member left a guild.
    GuildMemberRemove,
    /// Any event the core does not interpret.
    Unknown,
}

impl DispatchKind {
    /// Map a wire event name to its kind.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "READY" => Self::Ready,
            "RESUMED" => Self::Resumed,
            "GUILD_CREATE" => Self::GuildCreate,
            "GUILD_DELETE" => Self::GuildDelete,
            "GUILD_MEMBERS_CHUNK" => Self::GuildMembersChunk,
            "GUILD_MEMBER_ADD" => Self::GuildMemberAdd,
            "GUILD_MEMBER_REMOVE" => Self::GuildMemberRemove,
            _ => Self::Unknown,
        }
    }

    /// Whether the cluster withholds this event until the whole fleet is
    /// ready. Session and guild bookkeeping events always pass through.
    #[must_use]
    pub fn buffered_before_ready(self) -> bool {
        !matches!(
            self,
            Self::Ready
                | Self::Resumed
                | Self::GuildCreate
                | Self::GuildDelete
                | Self::GuildMembersChunk
                | Self::GuildMemberAdd
                | Self::GuildMemberRemove
        )
    }
}

/// One decoded dispatch event from the gateway.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    /// Interpreted event kind.
    pub kind: DispatchKind,
    /// Raw wire event name.
    pub name: String,
    /// Opaque event payload.
    pub data: Option<Value>,
    /// Sequence number the event arrived with.
    pub sequence: Option<u64>,
}

/// Lifecycle signals a shard reports to its cluster.
#[derive(Debug)]
pub(crate) enum ShardSignal {
    /// The shard finished its guild handshake. `unavailable` holds the
    /// guild ids that never confirmed before the fallback fired.
    AllReady {
        /// Guild ids still unconfirmed at readiness.
        unavailable: Vec<String>,
    },
    /// The socket closed with a code.
    Close {
        /// Close code from the server (or 1000 for a bare close).
        code: u16,
    },
    /// The server invalidated the session.
    InvalidSession {
        /// Whether the server allows a resume.
        resumable: bool,
    },
    /// The shard was torn down on request.
    Destroyed,
    /// A decoded dispatch event.
    Dispatch(DispatchEvent),
}

/// Events the cluster emits to its consumer.
#[derive(Debug)]
pub enum ClusterEvent {
    /// One shard finished its handshake and guild sync.
    ShardReady {
        /// Shard index.
        shard: u32,
    },
    /// One shard dropped its connection and was re-queued.
    ShardReconnecting {
        /// Shard index.
        shard: u32,
    },
    /// One shard disconnected terminally. Siblings are unaffected.
    ShardDisconnected {
        /// Shard index.
        shard: u32,
        /// Close code, when the disconnect came from a close frame.
        code: Option<u16>,
    },
    /// Every shard is ready; buffered events will now drain.
    Ready,
    /// A dispatch event, tagged with its originating shard.
    Dispatch {
        /// Originating shard index.
        shard: u32,
        /// The decoded event.
        event: DispatchEvent,
    },
}
