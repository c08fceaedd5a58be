//! External systems the notifier activities call, plus in-memory stand-ins.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::runtime::activity::ActivityError;

/// Sends one message to the notification queue.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, body: &str) -> Result<(), ActivityError>;
}

/// Reaches an administrator (SMS, voice call, email).
#[async_trait]
pub trait AdminNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), ActivityError>;
}

/// A message handed out under a peek-lock. Invisible to other receivers until
/// completed or abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub lock_token: String,
    pub body: String,
    /// 1 on first delivery, incremented on every redelivery after abandon.
    pub delivery_count: u32,
}

/// Receive / acknowledge / abandon contract of the notification queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Lock and return up to `max` visible messages. Empty when the queue is drained.
    async fn receive_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>, ActivityError>;

    /// Remove a locked message for good.
    async fn complete(&self, lock_token: &str) -> Result<(), ActivityError>;

    /// Release the lock; the message becomes visible again at the head of the queue.
    async fn abandon(&self, lock_token: &str) -> Result<(), ActivityError>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    body: String,
    delivery_count: u32,
}

/// In-process queue with peek-lock semantics. Implements both the publisher
/// and the consumer side.
#[derive(Default)]
pub struct InMemoryQueue {
    visible: Mutex<VecDeque<QueuedMessage>>,
    // token -> message; invisible until complete/abandon
    locked: Mutex<HashMap<String, QueuedMessage>>,
    completed: Mutex<Vec<String>>,
    publish_failures: Mutex<VecDeque<ActivityError>>,
    next_token: AtomicU64,
}

impl InMemoryQueue {
    /// Make the next publishes fail with `errors`, in order.
    pub async fn fail_next_publishes(&self, errors: Vec<ActivityError>) {
        self.publish_failures.lock().await.extend(errors);
    }

    /// Messages waiting to be received.
    pub async fn visible_len(&self) -> usize {
        self.visible.lock().await.len()
    }

    /// Messages received but neither completed nor abandoned.
    pub async fn locked_len(&self) -> usize {
        self.locked.lock().await.len()
    }

    /// Bodies of completed messages, in completion order.
    pub async fn completed(&self) -> Vec<String> {
        self.completed.lock().await.clone()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryQueue {
    async fn publish(&self, body: &str) -> Result<(), ActivityError> {
        if let Some(err) = self.publish_failures.lock().await.pop_front() {
            return Err(err);
        }
        self.visible.lock().await.push_back(QueuedMessage {
            body: body.to_string(),
            delivery_count: 0,
        });
        Ok(())
    }
}

#[async_trait]
impl QueueConsumer for InMemoryQueue {
    async fn receive_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>, ActivityError> {
        let mut visible = self.visible.lock().await;
        let mut locked = self.locked.lock().await;
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut msg) = visible.pop_front() else {
                break;
            };
            msg.delivery_count += 1;
            let token = format!("q:{}", self.next_token.fetch_add(1, Ordering::Relaxed));
            batch.push(ReceivedMessage {
                lock_token: token.clone(),
                body: msg.body.clone(),
                delivery_count: msg.delivery_count,
            });
            locked.insert(token, msg);
        }
        Ok(batch)
    }

    async fn complete(&self, lock_token: &str) -> Result<(), ActivityError> {
        match self.locked.lock().await.remove(lock_token) {
            Some(msg) => {
                self.completed.lock().await.push(msg.body);
                Ok(())
            }
            None => Err(ActivityError::permanent(format!("unknown lock token: {lock_token}"))),
        }
    }

    async fn abandon(&self, lock_token: &str) -> Result<(), ActivityError> {
        let msg = self.locked.lock().await.remove(lock_token);
        match msg {
            Some(msg) => {
                self.visible.lock().await.push_front(msg);
                Ok(())
            }
            None => Err(ActivityError::permanent(format!("unknown lock token: {lock_token}"))),
        }
    }
}

/// Admin notifier that records every message. Scripted failures are returned
/// first, in order.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ActivityError>>,
}

impl RecordingNotifier {
    pub fn failing_with(errors: Vec<ActivityError>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures: Mutex::new(errors.into()),
        }
    }

    pub async fn sent(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl AdminNotifier for RecordingNotifier {
    async fn notify(&self, message: &str) -> Result<(), ActivityError> {
        if let Some(err) = self.failures.lock().await.pop_front() {
            return Err(err);
        }
        self.sent.lock().await.push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locked_messages_are_invisible_until_abandoned() {
        let q = InMemoryQueue::default();
        q.publish("a").await.unwrap();
        q.publish("b").await.unwrap();

        let first = q.receive_batch(1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].body, "a");
        assert_eq!(q.visible_len().await, 1);
        assert_eq!(q.locked_len().await, 1);

        q.abandon(&first[0].lock_token).await.unwrap();
        let again = q.receive_batch(10).await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[0].body, "a");
        assert_eq!(again[0].delivery_count, 2);
        assert_eq!(again[1].delivery_count, 1);
    }

    #[tokio::test]
    async fn complete_removes_message() {
        let q = InMemoryQueue::default();
        q.publish("a").await.unwrap();
        let batch = q.receive_batch(10).await.unwrap();
        q.complete(&batch[0].lock_token).await.unwrap();
        assert_eq!(q.completed().await, vec!["a".to_string()]);
        assert!(q.receive_batch(10).await.unwrap().is_empty());
        assert!(q.complete(&batch[0].lock_token).await.is_err());
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let n = RecordingNotifier::failing_with(vec![ActivityError::transient("busy")]);
        assert!(n.notify("x").await.unwrap_err().is_retryable());
        n.notify("y").await.unwrap();
        assert_eq!(n.sent().await, vec!["y".to_string()]);
    }
}
