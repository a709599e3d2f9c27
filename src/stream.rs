use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

use crate::ui_stream::{UiStreamEvent, DONE};

const MAX_HISTORY_LINES: usize = 10_000;

struct ChatStream {
    tx: broadcast::Sender<String>,
    history: VecDeque<String>,
    ended: bool,
    // history before this index holds no mergeable delta pair
    merge_from: usize,
}

impl ChatStream {
    /// Shrinks history by one line, joining the oldest pair of adjacent
    /// deltas of the same block so replay still opens every block it fills.
    fn compact(&mut self) {
        while self.merge_from + 1 < self.history.len() {
            let i = self.merge_from;
            if let Some(merged) = merge_deltas(&self.history[i], &self.history[i + 1]) {
                self.history[i] = merged;
                self.history.remove(i + 1);
                return;
            }
            self.merge_from += 1;
        }
        log::warn!("Stream history has nothing to merge, dropping its oldest line");
        self.history.pop_front();
        self.merge_from = self.merge_from.saturating_sub(1);
    }
}

fn merge_deltas(first: &str, second: &str) -> Option<String> {
    let first = serde_json::from_str::<UiStreamEvent>(first).ok()?;
    let second = serde_json::from_str::<UiStreamEvent>(second).ok()?;
    let merged = match (first, second) {
        (UiStreamEvent::TextDelta { id, delta }, UiStreamEvent::TextDelta { id: next_id, delta: more })
            if id == next_id =>
        {
            UiStreamEvent::TextDelta { id, delta: delta + &more }
        }
        (UiStreamEvent::ReasoningDelta { id, delta }, UiStreamEvent::ReasoningDelta { id: next_id, delta: more })
            if id == next_id =>
        {
            UiStreamEvent::ReasoningDelta { id, delta: delta + &more }
        }
        _ => return None,
    };
    Some(merged.to_line())
}

/// Replay buffer for in-flight assistant responses.
///
/// The generation task pushes every SSE line here; clients subscribe to get
/// history replay + live tail, so a reload mid-response can reattach.
pub struct StreamManager {
    streams: Mutex<HashMap<String, ChatStream>>,
}

impl StreamManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Begin a stream (resets any prior state under the same id).
    pub async fn start(&self, stream_id: &str) {
        let (tx, _) = broadcast::channel(512);
        let mut map = self.streams.lock().await;
        map.insert(
            stream_id.to_string(),
            ChatStream {
                tx,
                history: VecDeque::new(),
                ended: false,
                merge_from: 0,
            },
        );
        log::debug!("Started stream {}", stream_id);
    }

    pub async fn push(&self, stream_id: &str, line: String) {
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(stream_id) {
            if s.ended {
                log::warn!("Dropping line pushed to ended stream {}", stream_id);
                return;
            }
            // no live subscribers is fine, history still records it
            let _ = s.tx.send(line.clone());
            s.history.push_back(line);
            if s.history.len() > MAX_HISTORY_LINES {
                s.compact();
            }
        }
    }

    /// Sends the `[DONE]` terminator and marks the stream ended (keeps history).
    pub async fn end(&self, stream_id: &str) {
        self.push(stream_id, DONE.to_string()).await;
        let mut map = self.streams.lock().await;
        if let Some(s) = map.get_mut(stream_id) {
            s.ended = true;
        }
    }

    /// Returns (history_snapshot, live_receiver), or `None` for an unknown id.
    /// The receiver is `None` once the stream has ended.
    pub async fn subscribe(&self, stream_id: &str) -> Option<(Vec<String>, Option<broadcast::Receiver<String>>)> {
        let map = self.streams.lock().await;
        map.get(stream_id).map(|s| {
            let history: Vec<String> = s.history.iter().cloned().collect();
            let rx = if !s.ended { Some(s.tx.subscribe()) } else { None };
            (history, rx)
        })
    }

    /// Runs `on_active` under the stream lock if the stream is still live.
    /// `end` and `remove` cannot interleave with it.
    pub async fn if_active<F: FnOnce()>(&self, stream_id: &str, on_active: F) -> bool {
        let map = self.streams.lock().await;
        match map.get(stream_id) {
            Some(s) if !s.ended => {
                on_active();
                true
            }
            _ => false,
        }
    }

    pub async fn remove(&self, stream_id: &str) {
        let mut map = self.streams.lock().await;
        if map.remove(stream_id).is_some() {
            log::debug!("Removed stream {}", stream_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_gets_history_then_live_tail() {
        let streams = StreamManager::new();
        streams.start("s1").await;
        streams.push("s1", "a".into()).await;
        streams.push("s1", "b".into()).await;

        let (history, rx) = streams.subscribe("s1").await.unwrap();
        assert_eq!(history, ["a", "b"]);
        let mut rx = rx.unwrap();

        streams.push("s1", "c".into()).await;
        streams.end("s1").await;
        assert_eq!(rx.recv().await.unwrap(), "c");
        assert_eq!(rx.recv().await.unwrap(), DONE);
    }

    #[tokio::test]
    async fn ended_stream_has_no_live_receiver() {
        let streams = StreamManager::new();
        streams.start("s1").await;
        assert!(streams.if_active("s1", || ()).await);
        streams.push("s1", "a".into()).await;
        streams.end("s1").await;
        assert!(!streams.if_active("s1", || ()).await);

        let (history, rx) = streams.subscribe("s1").await.unwrap();
        assert_eq!(history, ["a", DONE]);
        assert!(rx.is_none());

        streams.push("s1", "late".into()).await;
        assert_eq!(streams.subscribe("s1").await.unwrap().0.len(), 2);
    }

    #[tokio::test]
    async fn unknown_and_removed_streams() {
        let streams = StreamManager::new();
        assert!(streams.subscribe("nope").await.is_none());
        streams.start("s1").await;
        streams.remove("s1").await;
        assert!(streams.subscribe("s1").await.is_none());
        assert!(!streams.if_active("s1", || ()).await);
    }

    #[tokio::test]
    async fn long_answers_keep_their_preamble() {
        let streams = StreamManager::new();
        streams.start("s1").await;
        let start = UiStreamEvent::Start {
            message_id: "m1".into(),
            message_metadata: None,
        };
        streams.push("s1", start.to_line()).await;
        streams.push("s1", UiStreamEvent::TextStart { id: "text-0".into() }.to_line()).await;
        let mut expected = String::new();
        for i in 0..(MAX_HISTORY_LINES + 3) {
            let delta = format!("w{} ", i);
            expected.push_str(&delta);
            let event = UiStreamEvent::TextDelta {
                id: "text-0".into(),
                delta,
            };
            streams.push("s1", event.to_line()).await;
        }

        let (history, _) = streams.subscribe("s1").await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY_LINES);
        assert_eq!(history[0], start.to_line());
        assert!(history[1].contains("text-start"));
        let replayed: String = history[2..]
            .iter()
            .map(|line| match serde_json::from_str::<UiStreamEvent>(line).unwrap() {
                UiStreamEvent::TextDelta { delta, .. } => delta,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn deltas_of_different_blocks_are_not_merged() {
        let reasoning = UiStreamEvent::ReasoningDelta {
            id: "reasoning-0".into(),
            delta: "a".into(),
        };
        let text = UiStreamEvent::TextDelta {
            id: "text-0".into(),
            delta: "b".into(),
        };
        let other_text = UiStreamEvent::TextDelta {
            id: "text-1".into(),
            delta: "c".into(),
        };
        assert!(merge_deltas(&reasoning.to_line(), &text.to_line()).is_none());
        assert!(merge_deltas(&text.to_line(), &other_text.to_line()).is_none());
        let merged = merge_deltas(&text.to_line(), &text.to_line()).unwrap();
        assert_eq!(
            serde_json::from_str::<UiStreamEvent>(&merged).unwrap(),
            UiStreamEvent::TextDelta {
                id: "text-0".into(),
                delta: "bb".into(),
            }
        );
    }

    #[tokio::test]
    async fn if_active_skips_ended_and_removed_streams() {
        let streams = StreamManager::new();
        streams.start("s1").await;
        let mut hits = 0;
        assert!(streams.if_active("s1", || hits += 1).await);
        streams.end("s1").await;
        assert!(!streams.if_active("s1", || hits += 1).await);
        streams.remove("s1").await;
        assert!(!streams.if_active("s1", || hits += 1).await);
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let streams = StreamManager::new();
        streams.start("s1").await;
        for i in 0..(MAX_HISTORY_LINES + 5) {
            streams.push("s1", i.to_string()).await;
        }
        let (history, _) = streams.subscribe("s1").await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY_LINES);
        assert_eq!(history[0], "5");
    }
}
