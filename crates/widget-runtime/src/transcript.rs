use sbw_core::Message;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    /// Sequence of the send this entry belongs to; `0` for the welcome message.
    pub seq: u64,
    pub message: Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Applied,
    /// A newer send already received its reply.
    Stale,
}

/// Ordered conversation view. Replies are last-write-wins by sequence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    latest_reply: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_welcome(&mut self, message: Message) {
        self.entries.push(TranscriptEntry { seq: 0, message });
    }

    pub fn push_customer(&mut self, seq: u64, message: Message) {
        self.entries.push(TranscriptEntry { seq, message });
    }

    pub fn apply_reply(&mut self, seq: u64, message: Message) -> ReplyOutcome {
        if seq < self.latest_reply {
            return ReplyOutcome::Stale;
        }
        self.latest_reply = seq;
        self.entries.push(TranscriptEntry { seq, message });
        ReplyOutcome::Applied
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn latest_reply_seq(&self) -> u64 {
        self.latest_reply
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.latest_reply = 0;
    }
}
