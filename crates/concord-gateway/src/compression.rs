//! Streaming zlib inflater for the compressed gateway transport.
//!
//! The gateway sends one continuous zlib stream chopped into socket
//! frames. A logical message is complete only when a frame ends with the
//! 4-byte sync-flush marker; partial frames accumulate until then. The
//! inflater's dictionary persists across messages, so one instance lives
//! for the duration of a connection.

use flate2::{Decompress, FlushDecompress, Status};

use crate::error::GatewayError;

/// Tail marker of a complete compressed message (zlib sync flush).
const FLUSH_MARKER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Inflate chunk size.
const INFLATE_BUF: usize = 16 * 1024;

/// Stateful inflater for one connection's compressed stream.
pub(crate) struct TransportInflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl TransportInflater {
    pub(crate) fn new() -> Self {
        Self {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Feed one socket frame.
    ///
    /// Returns the inflated message once the flush marker completes it,
    /// `None` while the message is still accumulating.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Protocol`] when the stream is corrupt. The
    /// caller logs and continues; a decode failure never closes the
    /// socket.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() < FLUSH_MARKER.len() || !self.pending.ends_with(&FLUSH_MARKER) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.pending.len().saturating_mul(4));
        let mut buf = [0u8; INFLATE_BUF];
        let mut offset = 0usize;
        // zlib can still hold inflated output after the last input byte
        // is consumed, so drain until the context makes no progress.
        loop {
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let result =
                self.decompress
                    .decompress(&self.pending[offset..], &mut buf, FlushDecompress::Sync);
            let status = match result {
                Ok(status) => status,
                Err(e) => {
                    // A hard error poisons the context; start a fresh
                    // one. The shared dictionary is lost either way.
                    self.pending.clear();
                    self.decompress = Decompress::new(true);
                    return Err(GatewayError::Protocol(format!("inflate failed: {e}")));
                },
            };
            let consumed = usize::try_from(self.decompress.total_in().saturating_sub(in_before))
                .unwrap_or(usize::MAX);
            let produced = usize::try_from(self.decompress.total_out().saturating_sub(out_before))
                .unwrap_or(0);
            offset = offset.saturating_add(consumed);
            out.extend_from_slice(&buf[..produced.min(INFLATE_BUF)]);
            if consumed == 0 && produced == 0 {
                break;
            }
            if status == Status::StreamEnd {
                break;
            }
        }

        self.pending.clear();
        Ok(Some(out))
    }
}
