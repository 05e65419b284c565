use std::{collections::HashMap, sync::Arc};

use tokio::sync::{mpsc, Mutex};

use crate::store::{GatewayEvent, NewGatewayEvent, Store, StoreError};

/// Per-thread fan-out of durable gateway events plus store-backed replay.
///
/// Delivery is best effort over unbounded channels: a slow subscriber
/// buffers without blocking the publisher or its peers; a dropped one is
/// pruned on the next publish to its thread.
#[derive(Clone)]
pub struct EventBus {
    store: Store,
    subscribers: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<GatewayEvent>>>>>,
}

/// Replay window size handed to joining subscribers.
const REPLAY_LIMIT: usize = 1000;

impl EventBus {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persists the event (assigning its `seq`) and publishes it to the
    /// thread's live subscribers.
    pub async fn append(&self, event: NewGatewayEvent) -> Result<GatewayEvent, StoreError> {
        let stored = self.store.insert_gateway_event(&event).await?;
        self.publish(stored.clone()).await;
        Ok(stored)
    }

    pub async fn publish(&self, event: GatewayEvent) {
        let mut guard = self.subscribers.lock().await;
        if let Some(senders) = guard.get_mut(&event.thread_id) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                guard.remove(&event.thread_id);
            }
        }
    }

    /// Registers a live subscriber, then loads the replay window after
    /// `since_seq`. The live channel is attached *before* the replay read
    /// so no event can fall between them; events published during the
    /// read may therefore appear in both; consumers must drop live
    /// events whose `seq` is not beyond the last replayed one.
    pub async fn subscribe(
        &self,
        thread_id: &str,
        since_seq: i64,
    ) -> Result<(Vec<GatewayEvent>, mpsc::UnboundedReceiver<GatewayEvent>), StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut guard = self.subscribers.lock().await;
            guard.entry(thread_id.to_string()).or_default().push(tx);
        }

        let replay = self
            .store
            .list_gateway_events_since(thread_id, since_seq, REPLAY_LIMIT)
            .await?;
        Ok((replay, rx))
    }
}
