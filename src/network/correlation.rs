//! Request/response correlation
//!
//! Every outstanding request is registered under its command id. The receive
//! loop hands replies to [`Correlator::deliver`], which wakes exactly the
//! caller waiting for that id. A registration is either single use or
//! collects any number of replies until its owner stops waiting.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;

use crate::protocol::Message;

/// Correlation errors
#[derive(Error, Debug)]
pub enum CorrelationError {
    #[error("Command id {0:#010x} is already pending")]
    DuplicateId(u32),
}

pub type CorrelationResult<T> = Result<T, CorrelationError>;

enum Pending {
    Single(oneshot::Sender<Message>),
    Multiple(mpsc::UnboundedSender<Message>),
}

/// Handle for a single expected reply
#[derive(Debug)]
pub struct ReplySlot {
    id: u32,
    rx: oneshot::Receiver<Message>,
}

impl ReplySlot {
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// Handle for a stream of replies sharing one id
#[derive(Debug)]
pub struct ReplyStream {
    id: u32,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ReplyStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Wait up to `timeout` for the next reply. The registration stays in
    /// place; `None` means timeout or cancellation.
    pub async fn next(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Table of outstanding requests
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<u32, Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-reply request under `id`
    pub async fn register(&self, id: u32) -> CorrelationResult<ReplySlot> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&id) {
            return Err(CorrelationError::DuplicateId(id));
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(id, Pending::Single(tx));
        Ok(ReplySlot { id, rx })
    }

    /// Register a single-reply request under a fresh id
    pub async fn register_new(&self) -> ReplySlot {
        let mut pending = self.pending.lock().await;
        let id = unused_id(&pending);

        let (tx, rx) = oneshot::channel();
        pending.insert(id, Pending::Single(tx));
        ReplySlot { id, rx }
    }

    /// Register a request answered by several frames under `id`
    pub async fn register_multiple(&self, id: u32) -> CorrelationResult<ReplyStream> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(&id) {
            return Err(CorrelationError::DuplicateId(id));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert(id, Pending::Multiple(tx));
        Ok(ReplyStream { id, rx })
    }

    /// Register a request answered by several frames under a fresh id
    pub async fn register_multiple_new(&self) -> ReplyStream {
        let mut pending = self.pending.lock().await;
        let id = unused_id(&pending);

        let (tx, rx) = mpsc::unbounded_channel();
        pending.insert(id, Pending::Multiple(tx));
        ReplyStream { id, rx }
    }

    /// Wait up to `timeout` for the reply. The registration is gone
    /// afterwards whatever the outcome. `None` means timeout or cancellation.
    pub async fn await_reply(&self, slot: ReplySlot, timeout: Duration) -> Option<Message> {
        let ReplySlot { id, rx } = slot;
        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Some(message),
            Ok(Err(_)) => {
                tracing::debug!("Wait for command {:#010x} cancelled", id);
                None
            }
            Err(_) => {
                tracing::debug!("Command {:#010x} timed out after {:?}", id, timeout);
                None
            }
        };

        self.unregister(id).await;
        reply
    }

    /// Wait until `count` replies arrived or `timeout` elapsed, returning
    /// whatever arrived. A reply for which `stop` holds ends the wait early
    /// and is the last one returned. The caller has to check the number of
    /// replies.
    pub async fn await_replies<F>(
        &self,
        stream: ReplyStream,
        count: usize,
        timeout: Duration,
        stop: F,
    ) -> Vec<Message>
    where
        F: Fn(&Message) -> bool,
    {
        let ReplyStream { id, mut rx } = stream;
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(count);

        while replies.len() < count {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(message)) => {
                    let done = stop(&message);
                    replies.push(message);
                    if done {
                        tracing::debug!("Wait for command {:#010x} stopped early", id);
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("Wait for command {:#010x} cancelled", id);
                    break;
                }
                Err(_) => {
                    tracing::debug!(
                        "Command {:#010x} timed out with {} of {} replies",
                        id,
                        replies.len(),
                        count
                    );
                    break;
                }
            }
        }

        self.unregister(id).await;
        replies
    }

    /// Hand a reply to whoever waits for `id`. Returns false if nobody does;
    /// the message is dropped in that case.
    pub async fn deliver(&self, id: u32, message: Message) -> bool {
        let mut pending = self.pending.lock().await;

        let delivered = match pending.remove(&id) {
            Some(Pending::Single(tx)) => tx.send(message).is_ok(),
            Some(Pending::Multiple(tx)) => {
                let sent = tx.send(message).is_ok();
                if sent {
                    pending.insert(id, Pending::Multiple(tx));
                }
                sent
            }
            None => {
                tracing::warn!("Dropping reply for unknown command id {:#010x}", id);
                return false;
            }
        };

        if !delivered {
            tracing::debug!("Waiter for command {:#010x} already gone", id);
        }
        delivered
    }

    /// Drop every registration, waking all waiters empty handed
    pub async fn cancel_all(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            tracing::debug!("Cancelling {} pending requests", pending.len());
        }
        pending.clear();
    }

    /// Number of outstanding registrations
    pub async fn pending(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Forget `id` without waiting for it
    pub async fn unregister(&self, id: u32) {
        self.pending.lock().await.remove(&id);
    }
}

fn unused_id(pending: &HashMap<u32, Pending>) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u32 = rng.gen();
        if !pending.contains_key(&id) {
            return id;
        }
    }
}
