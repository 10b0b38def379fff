//! Keeping a local document in step with remote ones
//!
//! A [`DocumentSubscriber`] polls one remote document. A
//! [`DocumentSynchronizer`] runs one merge loop per subscriber into a local
//! [`DocumentWriter`], plus an optional loop publishing local edits. All
//! loops go through the writer's document lock, so merges and pushes never
//! lose each other's edits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::reader::DocumentReader;
use super::writer::DocumentWriter;
use crate::config::SynchronizerConfig;
use crate::convergent::CrdtDocument;
use crate::error::FeedError;
use crate::timeline::subscription::{StopFlag, Tick};
use crate::timeline::{ChapterId, Subscription};

/// A remote document polled on its own interval.
pub struct DocumentSubscriber<D: CrdtDocument> {
    reader: DocumentReader<D>,
    interval: Duration,
}

impl<D: CrdtDocument> DocumentSubscriber<D> {
    pub fn new(reader: DocumentReader<D>, interval: Duration) -> Self {
        Self { reader, interval }
    }

    pub fn reader(&self) -> &DocumentReader<D> {
        &self.reader
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll the remote document and call `on_change` with a copy of it
    /// whenever a pull brings something new.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: FnMut(D) + Send + 'static,
    {
        let worker = PullWorker {
            reader: self.reader.clone(),
            on_change,
        };
        Subscription::spawn(worker, self.interval, true)
    }
}

struct PullWorker<D: CrdtDocument, F> {
    reader: DocumentReader<D>,
    on_change: F,
}

#[async_trait]
impl<D, F> Tick for PullWorker<D, F>
where
    D: CrdtDocument,
    F: FnMut(D) + Send + 'static,
{
    async fn tick(&mut self, stop: &StopFlag) -> Result<(), FeedError> {
        if !self.reader.pull().await? {
            return Ok(());
        }
        let doc = self.reader.doc().await;
        if !stop.is_stopped() {
            (self.on_change)(doc);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "document subscriber"
    }
}

/// Pull `source` and merge it into `local`. Returns whether `local` changed.
///
/// The merge runs even when the pull brought nothing new: a tick stopped or
/// failed between an earlier pull and its merge leaves the source ahead of
/// the local document, and merging is idempotent.
async fn pull_and_merge<D: CrdtDocument>(
    source: &DocumentReader<D>,
    local: &DocumentWriter<D>,
) -> Result<bool, FeedError> {
    source.pull().await?;
    let remote = source.doc().await;
    local.merge(&remote).await
}

struct MergeWorker<D: CrdtDocument> {
    source: DocumentReader<D>,
    local: Arc<DocumentWriter<D>>,
}

#[async_trait]
impl<D: CrdtDocument> Tick for MergeWorker<D> {
    async fn tick(&mut self, _stop: &StopFlag) -> Result<(), FeedError> {
        match pull_and_merge(&self.source, &self.local).await {
            Ok(true) => log::debug!("merged changes from {}", self.source.timeline().topic()),
            Ok(false) => {}
            Err(e) => log::warn!(
                "failed to sync from {}: {}",
                self.source.timeline().topic(),
                e
            ),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "document merge"
    }
}

struct PushWorker<D: CrdtDocument> {
    local: Arc<DocumentWriter<D>>,
}

#[async_trait]
impl<D: CrdtDocument> Tick for PushWorker<D> {
    async fn tick(&mut self, _stop: &StopFlag) -> Result<(), FeedError> {
        match self.local.push().await {
            Ok(Some(id)) => log::debug!("published chapter {}", id),
            Ok(None) => {}
            Err(e) => log::warn!("failed to publish local changes: {}", e),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "document push"
    }
}

/// One local writer kept in sync with any number of remote sources.
pub struct DocumentSynchronizer<D: CrdtDocument> {
    local: Arc<DocumentWriter<D>>,
    sources: Vec<DocumentSubscriber<D>>,
    config: SynchronizerConfig,
    running: Mutex<Vec<Subscription>>,
}

impl<D: CrdtDocument> DocumentSynchronizer<D> {
    pub fn new(local: Arc<DocumentWriter<D>>, config: SynchronizerConfig) -> Self {
        Self {
            local,
            sources: Vec::new(),
            config,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Add a source polled at the configured pull interval.
    pub fn add_source(&mut self, reader: DocumentReader<D>) {
        let interval = self.config.pull_interval();
        self.sources.push(DocumentSubscriber::new(reader, interval));
    }

    pub fn add_subscriber(&mut self, subscriber: DocumentSubscriber<D>) {
        self.sources.push(subscriber);
    }

    pub fn local(&self) -> &Arc<DocumentWriter<D>> {
        &self.local
    }

    pub fn sources(&self) -> &[DocumentSubscriber<D>] {
        &self.sources
    }

    /// Start the background loops. Failures inside a loop are logged and
    /// retried on the next tick. Calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if !running.is_empty() {
            log::debug!("synchronizer already running");
            return;
        }

        for source in &self.sources {
            let worker = MergeWorker {
                source: source.reader.clone(),
                local: self.local.clone(),
            };
            running.push(Subscription::spawn(worker, source.interval, true));
        }
        if let Some(interval) = self.config.push_interval() {
            let worker = PushWorker {
                local: self.local.clone(),
            };
            running.push(Subscription::spawn(worker, interval, false));
        }
        log::info!("synchronizer started with {} sources", self.sources.len());
    }

    /// Stop every loop. A merge already in flight still completes, since it
    /// only updates the local document.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        for subscription in running.drain(..) {
            subscription.stop();
        }
    }

    pub async fn is_running(&self) -> bool {
        !self.running.lock().await.is_empty()
    }

    /// Pull every source once and merge what changed. Returns whether the
    /// local document changed.
    pub async fn pull_sources(&self) -> Result<bool, FeedError> {
        let mut changed = false;
        for source in &self.sources {
            changed |= pull_and_merge(&source.reader, &self.local).await?;
        }
        Ok(changed)
    }

    pub async fn push(&self) -> Result<Option<ChapterId>, FeedError> {
        self.local.push().await
    }
}
