// realtime/timeline.rs
use std::collections::BTreeMap;

use crate::dtos::chatdtos::ServerFrame;

/// Local copy of one conversation, ordered by server sequence. Replays after a
/// reconnect overlap with what was already seen, so inserts are deduplicated.
#[derive(Debug, Default, Clone)]
pub struct ConversationTimeline {
    frames: BTreeMap<i64, ServerFrame>,
}

impl ConversationTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the sequence was already present.
    pub fn insert(&mut self, frame: ServerFrame) -> bool {
        if self.frames.contains_key(&frame.sequence) {
            return false;
        }
        self.frames.insert(frame.sequence, frame);
        true
    }

    /// Resume cursor for the next connection.
    pub fn last_sequence(&self) -> i64 {
        self.frames.keys().next_back().copied().unwrap_or(0)
    }

    pub fn frames(&self) -> impl Iterator<Item = &ServerFrame> {
        self.frames.values()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::chatmodels::MessageType;
    use chrono::Utc;
    use uuid::Uuid;

    fn frame(sequence: i64) -> ServerFrame {
        ServerFrame {
            frame_type: MessageType::Text,
            message: format!("m{}", sequence),
            sender_id: Some(Uuid::new_v4()),
            sender_name: "Ana".into(),
            created_at: Utc::now(),
            message_id: Uuid::new_v4(),
            sequence,
        }
    }

    #[test]
    fn orders_by_sequence_and_drops_duplicates() {
        let mut timeline = ConversationTimeline::new();
        assert!(timeline.insert(frame(3)));
        assert!(timeline.insert(frame(1)));
        assert!(timeline.insert(frame(2)));
        assert!(!timeline.insert(frame(2)));

        let order: Vec<i64> = timeline.frames().map(|f| f.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(timeline.last_sequence(), 3);
        assert_eq!(timeline.len(), 3);
    }
}
