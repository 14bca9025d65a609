use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use svcreq_core::ChangeEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::StoreError;

pub const REQUESTS_TABLE: &str = "service_requests";

/// What a subscription listens to: one request row, or the whole table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Request(String),
    Table,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Request(id) => write!(f, "{REQUESTS_TABLE}:id=eq.{id}"),
            Topic::Table => f.write_str(REQUESTS_TABLE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeSignal {
    Change(ChangeEvent),
    /// The subscriber fell behind and this many messages were dropped.
    Lagged(u64),
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, StoreError>;
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: Topic,
    receiver: broadcast::Receiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        topic: Topic,
        receiver: broadcast::Receiver<ChangeEvent>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic,
            receiver,
            release: Some(Box::new(release)),
        }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next signal, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<RealtimeSignal> {
        match self.receiver.recv().await {
            Ok(event) => Some(RealtimeSignal::Change(event)),
            Err(RecvError::Lagged(missed)) => Some(RealtimeSignal::Lagged(missed)),
            Err(RecvError::Closed) => None,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// In-process realtime channel. Stores publish row changes into it.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    capacity: usize,
    inner: Arc<Mutex<HashMap<Topic, TopicChannel>>>,
}

#[derive(Debug)]
struct TopicChannel {
    sender: broadcast::Sender<ChangeEvent>,
    subscribers: usize,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

impl RealtimeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fans `event` out to the row topic and the table topic. Returns the number
    /// of receivers reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let channels = lock(&self.inner);
        let mut topics = vec![Topic::Table];
        if let Some(id) = event.record_id() {
            topics.push(Topic::Request(id.to_string()));
        }
        topics
            .iter()
            .filter_map(|topic| channels.get(topic))
            .filter_map(|channel| channel.sender.send(event.clone()).ok())
            .sum()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        lock(&self.inner).get(topic).map_or(0, |channel| channel.subscribers)
    }
}

#[async_trait]
impl RealtimeChannel for RealtimeHub {
    async fn subscribe(&self, topic: Topic) -> Result<Subscription, StoreError> {
        let receiver = {
            let mut channels = lock(&self.inner);
            let channel = channels.entry(topic.clone()).or_insert_with(|| TopicChannel {
                sender: broadcast::channel(self.capacity).0,
                subscribers: 0,
            });
            channel.subscribers += 1;
            channel.sender.subscribe()
        };
        debug!(%topic, "realtime subscribed");

        let inner = Arc::clone(&self.inner);
        let released = topic.clone();
        Ok(Subscription::new(topic, receiver, move || {
            let mut channels = lock(&inner);
            if let Some(channel) = channels.get_mut(&released) {
                channel.subscribers = channel.subscribers.saturating_sub(1);
                if channel.subscribers == 0 {
                    channels.remove(&released);
                }
            }
            debug!(topic = %released, "realtime unsubscribed");
        }))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
