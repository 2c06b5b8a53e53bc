//! Reassembly of messages split into `CHUNK` frames.

use std::collections::{BTreeMap, HashMap, VecDeque};

use weft_engine::Error;

/// Bounds on what one connection may keep half-assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Largest `total` a message may declare
    pub max_chunks: usize,
    /// Partial messages kept at once; the oldest is dropped past this
    pub max_pending: usize,
    /// Bytes of chunk data buffered across all partial messages
    pub max_bytes: usize,
}

impl Default for ChunkLimits {
    fn default() -> Self {
        Self {
            max_chunks: 1024,
            max_pending: 16,
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
struct PartialMessage {
    total: usize,
    parts: BTreeMap<usize, String>,
    bytes: usize,
}

/// Collects chunk pieces by message id until every index has arrived.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    limits: ChunkLimits,
    pending: HashMap<String, PartialMessage>,
    /// Message ids, oldest first
    arrival: VecDeque<String>,
    buffered: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(limits: ChunkLimits) -> Self {
        Self {
            limits,
            ..Self::default()
        }
    }

    /// Add one piece. Returns the full text once all `total` pieces are in,
    /// concatenated by index regardless of arrival order.
    ///
    /// Any error discards what was buffered for `id`.
    pub fn accept(
        &mut self,
        id: &str,
        index: usize,
        total: usize,
        data: String,
    ) -> Result<Option<String>, Error> {
        if total == 0 || index >= total {
            self.discard(id);
            return Err(malformed(format!(
                "chunk {} of {} for '{}' is out of range",
                index, total, id
            )));
        }
        if total > self.limits.max_chunks {
            self.discard(id);
            return Err(malformed(format!(
                "chunk total {} for '{}' exceeds the limit of {}",
                total, id, self.limits.max_chunks
            )));
        }

        if !self.pending.contains_key(id) {
            while self.pending.len() >= self.limits.max_pending.max(1) {
                let Some(oldest) = self.arrival.front().cloned() else {
                    break;
                };
                tracing::warn!(chunk_id = %oldest, "Dropping unfinished chunked message");
                self.discard(&oldest);
            }
            self.pending.insert(
                id.to_string(),
                PartialMessage {
                    total,
                    parts: BTreeMap::new(),
                    bytes: 0,
                },
            );
            self.arrival.push_back(id.to_string());
        }

        let (previous_total, replaced) = match self.pending.get(id) {
            Some(partial) => (
                partial.total,
                partial.parts.get(&index).map_or(0, String::len),
            ),
            None => return Ok(None),
        };
        if previous_total != total {
            self.discard(id);
            return Err(malformed(format!(
                "chunk total for '{}' changed to {}",
                id, total
            )));
        }
        if self.buffered - replaced + data.len() > self.limits.max_bytes {
            self.discard(id);
            return Err(malformed(format!(
                "chunked message '{}' exceeds the buffer limit of {} bytes",
                id, self.limits.max_bytes
            )));
        }

        self.buffered = self.buffered - replaced + data.len();
        let Some(partial) = self.pending.get_mut(id) else {
            return Ok(None);
        };
        partial.bytes = partial.bytes - replaced + data.len();
        partial.parts.insert(index, data);
        if partial.parts.len() < partial.total {
            return Ok(None);
        }

        Ok(self
            .discard(id)
            .map(|partial| partial.parts.into_values().collect()))
    }

    fn discard(&mut self, id: &str) -> Option<PartialMessage> {
        let partial = self.pending.remove(id)?;
        self.arrival.retain(|pending| pending != id);
        self.buffered -= partial.bytes;
        Some(partial)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bytes of chunk data currently held.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.arrival.clear();
        self.buffered = 0;
    }
}

fn malformed(message: String) -> Error {
    Error::MalformedMessagePayload(message)
}
