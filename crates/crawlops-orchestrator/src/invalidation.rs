//! Topic invalidation shared by every view that caches backend listings.

use std::sync::Arc;

use crawlops_client::{ApiError, JobService};
use crawlops_core::{JobFilter, JobSummary};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    JobList,
    BulkStatus,
}

#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<Topic>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Topic> {
        self.tx.subscribe()
    }

    /// Publish once per logical operator action.
    pub fn invalidate(&self, topic: Topic) {
        let receivers = self.tx.send(topic).unwrap_or(0);
        debug!(?topic, receivers, "invalidated");
    }
}

/// Cached job listing that refetches when [`Topic::JobList`] is invalidated.
pub struct JobListView {
    service: Arc<dyn JobService>,
    filter: JobFilter,
    rx: broadcast::Receiver<Topic>,
    rows: Vec<JobSummary>,
    refreshes: u64,
}

impl JobListView {
    pub fn new(service: Arc<dyn JobService>, bus: &InvalidationBus, filter: JobFilter) -> Self {
        Self {
            service,
            filter,
            rx: bus.subscribe(),
            rows: Vec::new(),
            refreshes: 0,
        }
    }

    pub fn rows(&self) -> &[JobSummary] {
        &self.rows
    }

    pub fn refreshes(&self) -> u64 {
        self.refreshes
    }

    /// On error the previous rows are kept.
    pub async fn refresh(&mut self) -> Result<&[JobSummary], ApiError> {
        let rows = self.service.list_jobs(&self.filter).await?;
        self.rows = rows;
        self.refreshes += 1;
        Ok(&self.rows)
    }

    /// Wait for the next job-list invalidation. Invalidations already queued
    /// behind it are folded in. Returns `false` once the bus is gone.
    pub async fn invalidated(&mut self) -> bool {
        loop {
            match self.rx.recv().await {
                Ok(Topic::JobList) | Err(RecvError::Lagged(_)) => break,
                Ok(_) => continue,
                Err(RecvError::Closed) => return false,
            }
        }
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return true,
            }
        }
    }

    /// Refetch whenever invalidated, until the bus is dropped.
    pub async fn follow(&mut self) {
        while self.invalidated().await {
            if let Err(err) = self.refresh().await {
                debug!(error = %err, "job list refresh failed; keeping cached rows");
            }
        }
    }
}
