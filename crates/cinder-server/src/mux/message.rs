//! Queued message representation and payload chunking.

use bytes::Bytes;

use cinder_core::time;

/// Delivery priority of an outbound payload. Within a slot, all HIGH
/// messages drain before any NORMAL, and all NORMAL before any LOW;
/// within one priority the order is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Position of a chunk within a logical payload that was split for
/// exceeding the configured chunk size. Internal bookkeeping only:
/// nothing is added to the bytes on the wire; chunks of one payload
/// are simply written back-to-back on the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Shared id of the logical payload the chunk belongs to.
    pub message_id: u64,
    /// 0-based position of this chunk.
    pub index: u32,
    /// Total chunks in the logical payload.
    pub count: u32,
}

/// One entry in a slot queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Bytes,
    pub priority: Priority,
    /// Monotonic ms when the message entered the queue.
    pub queued_at_ms: u64,
    /// Size of the logical payload this entry came from (equals
    /// `payload.len()` for unchunked messages).
    pub original_len: usize,
    pub chunk: Option<ChunkInfo>,
}

impl QueuedMessage {
    fn new(payload: Bytes, priority: Priority, original_len: usize, chunk: Option<ChunkInfo>) -> Self {
        Self {
            payload,
            priority,
            queued_at_ms: time::now_ms(),
            original_len,
            chunk,
        }
    }
}

/// Splits `payload` into queue entries no larger than `max_chunk_size`
/// each. Payloads at or under the limit become a single unchunked
/// entry. Chunk slices are zero-copy views into the original buffer
/// and must stay in returned order.
pub fn split_payload(
    payload: Bytes,
    priority: Priority,
    max_chunk_size: usize,
    message_id: u64,
) -> Vec<QueuedMessage> {
    let total_len = payload.len();
    if total_len <= max_chunk_size {
        return vec![QueuedMessage::new(payload, priority, total_len, None)];
    }

    let count = total_len.div_ceil(max_chunk_size) as u32;
    let mut chunks = Vec::with_capacity(count as usize);
    let mut offset = 0;
    let mut index = 0;
    while offset < total_len {
        let end = (offset + max_chunk_size).min(total_len);
        chunks.push(QueuedMessage::new(
            payload.slice(offset..end),
            priority,
            total_len,
            Some(ChunkInfo {
                message_id,
                index,
                count,
            }),
        ));
        offset = end;
        index += 1;
    }
    chunks
}
