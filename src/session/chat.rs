//! Bounded conversation log

use crate::events::ChatMessage;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Append-only log keeping the most recent `capacity` messages.
pub struct ChatLog {
    capacity: usize,
    entries: Mutex<VecDeque<ChatMessage>>,
    added: broadcast::Sender<ChatMessage>,
}

impl ChatLog {
    pub fn new(capacity: usize) -> Self {
        let (added, _) = broadcast::channel(capacity.max(1));
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            added,
        }
    }

    /// Append a message, evicting the oldest once full.
    pub fn push(&self, message: ChatMessage) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            while entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(message.clone());
        }
        let _ = self.added.send(message);
    }

    /// Snapshot, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChatMessage> {
        self.added.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_never_exceeds_capacity() {
        let log = ChatLog::new(100);
        for i in 0..100 {
            log.push(ChatMessage::user(format!("message {}", i)));
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.messages()[0].text, "message 0");

        log.push(ChatMessage::assistant("message 100"));
        let messages = log.messages();
        assert_eq!(messages.len(), 100);
        assert_eq!(messages[0].text, "message 1");
        assert_eq!(messages[99].text, "message 100");
        assert!(!messages[99].is_user);
    }

    #[tokio::test]
    async fn test_subscribers_see_new_messages_only() {
        let log = ChatLog::new(10);
        log.push(ChatMessage::user("before"));
        let mut rx = log.subscribe();
        log.push(ChatMessage::assistant("after"));
        assert_eq!(rx.recv().await.unwrap().text, "after");
        assert!(rx.try_recv().is_err());
    }
}
