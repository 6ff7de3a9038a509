//! Gateway protocol types, opcodes, and close-code classification.
//!
//! Only the opcodes and envelope fields the state machine needs are
//! modelled; dispatch event payloads are forwarded as opaque
//! `serde_json::Value`.

use serde::{Deserialize, Serialize};

// ── Opcodes ──────────────────────────────────────────────────

/// Gateway opcodes.
pub(crate) mod opcode {
    /// Event dispatch (receive only).
    pub(crate) const DISPATCH: u8 = 0;
    /// Heartbeat (bidirectional).
    pub(crate) const HEARTBEAT: u8 = 1;
    /// Identify (send only).
    pub(crate) const IDENTIFY: u8 = 2;
    /// Resume (send only).
    pub(crate) const RESUME: u8 = 6;
    /// Server requests reconnect (receive only).
    pub(crate) const RECONNECT: u8 = 7;
    /// Invalid session (receive only).
    pub(crate) const INVALID_SESSION: u8 = 9;
    /// Hello, carries the heartbeat interval (receive only).
    pub(crate) const HELLO: u8 = 10;
    /// Heartbeat ACK (receive only).
    pub(crate) const HEARTBEAT_ACK: u8 = 11;
}

// ── Close-code classification ────────────────────────────────

/// What a close code means for the shard's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseDisposition {
    /// Terminal. No reconnect attempt.
    Unrecoverable,
    /// Reconnect, but the session is gone: clear it and identify fresh.
    Unresumable,
    /// Reconnect and resume if a session is held.
    Resumable,
}

/// Classify a close code against the documented gateway close-code
/// table.
pub(crate) fn close_disposition(code: u16) -> CloseDisposition {
    match code {
        // Bad token, sharding errors, invalid or disallowed intents.
        4004 | 4010 | 4011 | 4012 | 4013 | 4014 => CloseDisposition::Unrecoverable,
        // Normal closes and session-invalidating codes.
        1000 | 1001 | 4007 | 4009 => CloseDisposition::Unresumable,
        _ => CloseDisposition::Resumable,
    }
}

// ── Wire types ───────────────────────────────────────────────

/// Raw gateway payload as received/sent over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode for the payload.
    pub op: u8,
    /// Event data (opcode-dependent).
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    /// Sequence number (only for `op=0` dispatch events).
    #[serde(default)]
    pub s: Option<u64>,
    /// Event name (only for `op=0` dispatch events).
    #[serde(default)]
    pub t: Option<String>,
}

/// Hello payload (`op=10`).
#[derive(Debug, Deserialize)]
pub(crate) struct HelloPayload {
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
}

/// Ready event data (`t="READY"`).
#[derive(Debug, Deserialize)]
pub(crate) struct ReadyPayload {
    /// Session ID for resuming.
    pub session_id: String,
    /// Guilds the session belongs to, initially unavailable.
    #[serde(default)]
    pub guilds: Vec<GuildStub>,
}

/// Minimal guild reference from the READY guild list.
#[derive(Debug, Deserialize)]
pub(crate) struct GuildStub {
    /// Guild snowflake id.
    pub id: String,
}

/// Response from `GET /gateway/bot`.
#[derive(Debug, Deserialize)]
pub struct GatewayBot {
    /// Gateway `WebSocket` URL.
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    /// Session-start quota for this account.
    pub session_start_limit: SessionStartLimit,
}

/// Session-start quota from `GET /gateway/bot`.
#[derive(Debug, Deserialize)]
pub struct SessionStartLimit {
    /// Total session starts allowed per window.
    pub total: u32,
    /// Session starts remaining in the current window.
    pub remaining: u32,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
    /// How many shards may identify concurrently.
    pub max_concurrency: u32,
}

// ── Payload builders ─────────────────────────────────────────

/// Build an Identify payload (`op=2`) for one shard of `total`.
pub(crate) fn build_identify(
    token: &str,
    intents: u32,
    shard_id: u32,
    shard_total: u32,
) -> GatewayPayload {
    GatewayPayload {
        op: opcode::IDENTIFY,
        d: Some(serde_json::json!({
            "token": token,
            "intents": intents,
            "shard": [shard_id, shard_total],
            "properties": {
                "os": std::env::consts::OS,
                "browser": "concord",
                "device": "concord",
            },
        })),
        s: None,
        t: None,
    }
}

/// Build a Resume payload (`op=6`).
pub(crate) fn build_resume(token: &str, session_id: &str, sequence: u64) -> GatewayPayload {
    GatewayPayload {
        op: opcode::RESUME,
        d: Some(serde_json::json!({
            "token": token,
            "session_id": session_id,
            "seq": sequence,
        })),
        s: None,
        t: None,
    }
}

/// Build a Heartbeat payload (`op=1`).
pub(crate) fn build_heartbeat(sequence: Option<u64>) -> GatewayPayload {
    GatewayPayload {
        op: opcode::HEARTBEAT,
        d: sequence.map(serde_json::Value::from),
        s: None,
        t: None,
    }
}
