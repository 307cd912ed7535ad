//! In-memory work queue for tests/dev.

use std::sync::RwLock;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::message::TaskQueued;
use crate::queue::{Delivery, QueueError, TaskQueue};

/// In-process competing-consumer queue.
///
/// - Unbounded tokio channel; consumers take turns on the receiving end
/// - Acks are no-ops; a delivery left unacknowledged is dropped, not
///   redelivered
/// - Every published message is also kept in a log for inspection
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    sender: RwLock<Option<mpsc::UnboundedSender<TaskQueued>>>,
    receiver: Mutex<mpsc::UnboundedReceiver<TaskQueued>>,
    published: RwLock<Vec<TaskQueued>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    pub fn published(&self) -> Vec<TaskQueued> {
        self.published.read().map(|log| log.clone()).unwrap_or_default()
    }

    /// Stop accepting messages. Pending messages can still be received;
    /// afterwards `receive` reports [`QueueError::Closed`].
    pub fn close(&self) {
        if let Ok(mut sender) = self.sender.write() {
            sender.take();
        }
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            sender: RwLock::new(Some(tx)),
            receiver: Mutex::new(rx),
            published: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn publish(&self, message: TaskQueued) -> Result<(), QueueError> {
        {
            let sender = self
                .sender
                .read()
                .map_err(|_| QueueError::Transport("sender lock poisoned".into()))?;
            let sender = sender.as_ref().ok_or(QueueError::Closed)?;
            sender.send(message.clone()).map_err(|_| QueueError::Closed)?;
        }

        if let Ok(mut log) = self.published.write() {
            log.push(message);
        }
        Ok(())
    }

    async fn receive(&self, _consumer: &str, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut receiver = self.receiver.lock().await;
        match tokio::time::timeout(wait, receiver.recv()).await {
            Ok(Some(message)) => Ok(Some(Delivery::new(message))),
            Ok(None) => Err(QueueError::Closed),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), QueueError> {
        Ok(())
    }
}
