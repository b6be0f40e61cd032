//! Request-scoped batching: many link-value requests issued during the
//! concurrent resolution of one client request coalesce into as few
//! backend dispatches as possible.
//!
//! One [`LinkLoader`] exists per (client request, link) pair; the loader
//! table lives on [`RequestScope`], which is created at request entry and
//! dropped at request exit, so loaders never outlive or cross requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::ResolveError;

/// Executes one coalesced batch. Implemented by the link resolution
/// engine; keys arrive in call order, duplicates included, and the result
/// list must match them positionally.
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    async fn resolve_batch(&self, keys: Vec<Value>) -> Result<Vec<Value>, ResolveError>;
}

/// The per-request loader table. Identity of the scope value determines
/// loader sharing: resolvers within one request share it, different
/// requests never do.
#[derive(Default)]
pub struct RequestScope {
    loaders: Mutex<HashMap<String, Arc<LinkLoader>>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// The loader for `link_key`, created via `make` on first use within
    /// this request.
    pub fn loader_for(
        &self,
        link_key: &str,
        make: impl FnOnce() -> LinkLoader,
    ) -> Arc<LinkLoader> {
        let mut loaders = self.loaders.lock().expect("loader table poisoned");
        loaders
            .entry(link_key.to_string())
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }
}

type ResultSender = oneshot::Sender<Result<Value, ResolveError>>;

struct PendingBatch {
    slots: Vec<(Value, ResultSender)>,
    /// Whether a dispatch task has already been scheduled for the slots
    /// currently queued.
    scheduled: bool,
}

/// Accumulates `load` calls issued during the current batch window and
/// flushes them through the dispatcher in one call. The first enqueuer
/// after a flush schedules the dispatch task; everyone else just queues.
pub struct LinkLoader {
    dispatcher: Arc<dyn BatchDispatcher>,
    pending: Mutex<PendingBatch>,
    delay: Duration,
}

impl LinkLoader {
    pub fn new(dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        LinkLoader {
            dispatcher,
            pending: Mutex::new(PendingBatch {
                slots: Vec::new(),
                scheduled: false,
            }),
            delay: Duration::from_millis(1),
        }
    }

    /// Requests resolution of one key. All loads queued before the batch
    /// window closes share one dispatch; results come back positionally.
    pub async fn load(self: &Arc<Self>, key: Value) -> Result<Value, ResolveError> {
        let (tx, rx) = oneshot::channel();
        let schedule = {
            let mut pending = self.pending.lock().expect("batch queue poisoned");
            pending.slots.push((key, tx));
            !std::mem::replace(&mut pending.scheduled, true)
        };

        if schedule {
            let loader = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(loader.delay).await;
                loader.flush().await;
            });
        }

        rx.await.unwrap_or(Err(ResolveError::BatchDropped))
    }

    async fn flush(&self) {
        let batch = {
            let mut pending = self.pending.lock().expect("batch queue poisoned");
            pending.scheduled = false;
            std::mem::take(&mut pending.slots)
        };
        if batch.is_empty() {
            return;
        }

        let keys: Vec<Value> = batch.iter().map(|(key, _)| key.clone()).collect();
        match self.dispatcher.resolve_batch(keys).await {
            Ok(values) => {
                let mut values = values.into_iter();
                for (_, tx) in batch {
                    let value = values.next().unwrap_or(Value::Null);
                    let _ = tx.send(Ok(value));
                }
            }
            Err(err) => {
                for (_, tx) in batch {
                    let _ = tx.send(Err(err.clone()));
                }
            }
        }
    }
}
