//! In-order delivery of sequenced stream frames.

use std::collections::BTreeMap;

use bzero_types::StreamMessage;

/// Reorder buffer for one inbound direction.
///
/// Sequence numbers start at 0. Frames arriving ahead of `expected` are
/// held; frames at or below an already-delivered sequence are duplicates
/// and dropped, so every sequence is delivered exactly once and never
/// skipped.
#[derive(Debug, Default)]
pub struct OrderedBuffer {
    expected: u64,
    pending: BTreeMap<u64, StreamMessage>,
}

impl OrderedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a frame; returns every frame now deliverable, in order.
    pub fn push(&mut self, msg: StreamMessage) -> Vec<StreamMessage> {
        if msg.sequence_number < self.expected {
            tracing::debug!(
                sequence = msg.sequence_number,
                expected = self.expected,
                "dropping duplicate stream frame"
            );
            return Vec::new();
        }
        self.pending.insert(msg.sequence_number, msg);

        let mut ready = Vec::new();
        while let Some(msg) = self.pending.remove(&self.expected) {
            self.expected += 1;
            ready.push(msg);
        }
        ready
    }

    /// Count of frames held waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
