//! Batched metadata writer.
//!
//! Every authenticated agent request produces a check-in: the node was
//! seen, through some channel, maybe from a new address, with some bytes.
//! Writing each one would turn every poll into a database write, so
//! check-ins are queued, coalesced per node and flushed in bulk.
//!
//! Producers never block. When the queue is full the check-in is dropped,
//! logged and counted; a node that keeps polling is refreshed by its next
//! check-in anyway.

use fleet_core::NodeChannel;
use fleet_core::config::WriterConfig;
use fleet_metadata::MetadataStore;
use fleet_metadata::models::NodeSeenUpdate;
use fleet_metadata::repos::NodeRepo;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Interval;
use uuid::Uuid;

/// One authenticated contact from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckIn {
    pub node_id: Uuid,
    /// Observed address, when the request had one.
    pub ip_address: Option<String>,
    pub channel: NodeChannel,
    /// Request body size.
    pub bytes: i64,
}

enum WriterMessage {
    CheckIn(CheckIn),
    Flush(oneshot::Sender<()>),
}

/// Check-ins coalesced per node.
#[derive(Debug, Default)]
struct Batch {
    pending: HashMap<Uuid, NodeSeenUpdate>,
}

impl Batch {
    fn add(&mut self, check_in: CheckIn) {
        let update = self
            .pending
            .entry(check_in.node_id)
            .or_insert_with(|| NodeSeenUpdate {
                node_id: check_in.node_id,
                ip_address: None,
                channels: Default::default(),
                bytes_received: 0,
            });
        // Latest known address wins.
        if check_in.ip_address.is_some() {
            update.ip_address = check_in.ip_address;
        }
        update.channels.insert(check_in.channel);
        update.bytes_received = update.bytes_received.saturating_add(check_in.bytes.max(0));
    }

    fn len(&self) -> usize {
        self.pending.len()
    }

    fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self) -> Vec<NodeSeenUpdate> {
        self.pending.drain().map(|(_, update)| update).collect()
    }
}

/// Handle to the writer worker. Cheap to clone.
#[derive(Clone)]
pub struct MetadataWriter {
    tx: mpsc::Sender<WriterMessage>,
    shutdown: Arc<Notify>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MetadataWriter {
    /// Start the worker.
    pub fn spawn(store: Arc<dyn MetadataStore>, config: &WriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let shutdown = Arc::new(Notify::new());
        let worker = Worker {
            store,
            rx,
            shutdown: shutdown.clone(),
            batch: Batch::default(),
            batch_size: config.batch_size.max(1),
            ticker: tokio::time::interval(config.flush_interval()),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            tx,
            shutdown,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Queue a check-in. Returns false if it was dropped.
    pub fn submit(&self, check_in: CheckIn) -> bool {
        match self.tx.try_send(WriterMessage::CheckIn(check_in)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(WriterMessage::CheckIn(dropped))) => {
                crate::metrics::WRITER_DROPPED.inc();
                tracing::warn!(
                    node_id = %dropped.node_id,
                    channel = ?dropped.channel,
                    "Metadata writer queue full, dropping check-in"
                );
                false
            }
            Err(_) => {
                tracing::debug!("Metadata writer stopped, dropping check-in");
                false
            }
        }
    }

    /// Write everything queued so far and wait for it.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stop accepting check-ins, drain the queue, flush and wait for the
    /// worker to exit. Later calls return immediately.
    pub async fn shutdown(&self) {
        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(e) = handle.await {
            tracing::error!(error = ?e, "Metadata writer worker failed");
        }
    }
}

struct Worker {
    store: Arc<dyn MetadataStore>,
    rx: mpsc::Receiver<WriterMessage>,
    shutdown: Arc<Notify>,
    batch: Batch,
    batch_size: usize,
    /// Fires one flush interval after the last flush.
    ticker: Interval,
}

impl Worker {
    async fn run(mut self) {
        self.ticker
            .set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        self.ticker.tick().await;

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = self.ticker.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
                _ = self.shutdown.notified() => {
                    self.rx.close();
                    while let Some(message) = self.rx.recv().await {
                        self.handle(message).await;
                    }
                    break;
                }
            }
        }

        if !self.batch.is_empty() {
            self.flush().await;
        }
        tracing::info!("Metadata writer stopped");
    }

    async fn handle(&mut self, message: WriterMessage) {
        match message {
            WriterMessage::CheckIn(check_in) => {
                self.batch.add(check_in);
                if self.batch.len() >= self.batch_size {
                    self.flush().await;
                }
            }
            WriterMessage::Flush(done) => {
                if !self.batch.is_empty() {
                    self.flush().await;
                }
                let _ = done.send(());
            }
        }
    }

    async fn flush(&mut self) {
        self.ticker.reset();
        let updates = self.batch.take();
        let started = Instant::now();
        crate::metrics::WRITER_BATCH_SIZE.observe(updates.len() as f64);

        match self
            .store
            .refresh_last_seen_batch(&updates, OffsetDateTime::now_utc())
            .await
        {
            Ok(rows) => {
                tracing::debug!(nodes = updates.len(), rows, "Flushed node check-ins");
            }
            Err(e) => {
                // Not retried: the next check-in of each node refreshes it.
                crate::metrics::WRITER_FLUSH_FAILURES.inc();
                tracing::error!(nodes = updates.len(), error = %e, "Failed to flush node check-ins");
            }
        }
        crate::metrics::WRITER_FLUSH_DURATION.observe(started.elapsed().as_secs_f64());
    }
}
