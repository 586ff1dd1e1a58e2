//! In-memory job queue.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ControlError, ControlResult};

use super::{Delivery, JobQueue, MessageId};

#[derive(Debug, Clone)]
struct QueueEntry {
    delivery: Delivery,
    visible_at: Instant,
}

/// In-memory queue with visibility timeouts.
///
/// Messages are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unacknowledged messages, visible or not.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether every message has been acknowledged.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, payload: &[u8]) -> ControlResult<MessageId> {
        let id = MessageId::new(uuid::Uuid::new_v4().to_string());
        let entry = QueueEntry {
            delivery: Delivery {
                id: id.clone(),
                payload: payload.to_vec(),
                attempt: 0,
                enqueued_at: Utc::now(),
            },
            visible_at: Instant::now(),
        };

        self.entries.lock().await.push_back(entry);
        Ok(id)
    }

    async fn receive(&self, visibility_timeout: Duration) -> ControlResult<Option<Delivery>> {
        let mut entries = self.entries.lock().await;

        let now = Instant::now();
        for entry in entries.iter_mut() {
            if entry.visible_at <= now {
                entry.visible_at = now + visibility_timeout;
                entry.delivery.attempt += 1;
                return Ok(Some(entry.delivery.clone()));
            }
        }

        Ok(None)
    }

    async fn ack(&self, message_id: &MessageId) -> ControlResult<()> {
        let mut entries = self.entries.lock().await;

        let initial_len = entries.len();
        entries.retain(|entry| entry.delivery.id != *message_id);

        if entries.len() == initial_len {
            return Err(ControlError::queue(format!("message {message_id} not found")));
        }

        Ok(())
    }

    async fn nack(&self, message_id: &MessageId) -> ControlResult<()> {
        let mut entries = self.entries.lock().await;

        for entry in entries.iter_mut() {
            if entry.delivery.id == *message_id {
                entry.visible_at = Instant::now();
                return Ok(());
            }
        }

        Err(ControlError::queue(format!("message {message_id} not found")))
    }
}
