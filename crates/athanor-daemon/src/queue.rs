//! The hopper: bounded fetch-ahead between the fetcher and a shard agent
//!
//! A background task fetches pages up to the published high-water mark and
//! pushes them through a channel in floor order. The number of buffered
//! events never exceeds `maximum_hopper_size`; each fetch asks for at most
//! the remaining room, and the agent releases room after each page is done.

use athanor_core::error::{AthanorError, Result};
use athanor_core::types::{EventRange, Sequence};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fetcher::EventFetcher;

#[derive(Default)]
struct Level {
    buffered: usize,
    peak: usize,
}

/// Event count currently held in the hopper
#[derive(Default)]
struct Hopper {
    level: Mutex<Level>,
    drained: Notify,
}

impl Hopper {
    fn buffered(&self) -> usize {
        self.level.lock().buffered
    }

    fn peak(&self) -> usize {
        self.level.lock().peak
    }

    fn fill(&self, events: usize) {
        let mut level = self.level.lock();
        level.buffered += events;
        level.peak = level.peak.max(level.buffered);
    }

    fn drain(&self, events: usize) {
        {
            let mut level = self.level.lock();
            level.buffered = level.buffered.saturating_sub(events);
        }
        self.drained.notify_one();
    }

    /// Wait until there is room, returning how much
    async fn room(&self, maximum: usize, token: &CancellationToken) -> Result<usize> {
        loop {
            let notified = self.drained.notified();
            let buffered = self.buffered();
            if buffered < maximum {
                return Ok(maximum - buffered);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(AthanorError::Cancelled),
                _ = notified => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub batch_size: usize,
    pub maximum_hopper_size: usize,
}

/// Bounded, ordered page pump for one shard
pub struct ShardExecutionQueue {
    receiver: mpsc::Receiver<Result<EventRange>>,
    hopper: Arc<Hopper>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ShardExecutionQueue {
    /// Start fetching after `floor`, bounded by the marks on `ceiling`
    pub fn start(
        fetcher: Arc<EventFetcher>,
        options: QueueOptions,
        floor: Sequence,
        ceiling: watch::Receiver<Sequence>,
        token: CancellationToken,
    ) -> Self {
        let hopper = Arc::new(Hopper::default());
        let pages = (options.maximum_hopper_size / options.batch_size.max(1)).max(1) + 1;
        let (sender, receiver) = mpsc::channel(pages);

        let task = tokio::spawn(pump(
            fetcher,
            options,
            floor,
            ceiling,
            hopper.clone(),
            sender,
            token.clone(),
        ));

        Self {
            receiver,
            hopper,
            token,
            task,
        }
    }

    /// Next page in floor order; `None` once the queue has stopped
    pub async fn next_page(&mut self) -> Option<Result<EventRange>> {
        self.receiver.recv().await
    }

    /// Return a consumed page's events to the hopper budget
    pub fn release(&self, events: usize) {
        self.hopper.drain(events);
    }

    pub fn buffered(&self) -> usize {
        self.hopper.buffered()
    }

    /// Largest number of events ever buffered at once
    pub fn peak_buffered(&self) -> usize {
        self.hopper.peak()
    }

    /// Stop fetching and discard anything buffered
    pub async fn stop(mut self) {
        self.token.cancel();
        self.receiver.close();
        while self.receiver.recv().await.is_some() {}
        if let Err(e) = self.task.await {
            warn!(error = %e, "Queue task ended abnormally");
        }
    }
}

async fn wait_for_ceiling(
    ceiling: &mut watch::Receiver<Sequence>,
    floor: Sequence,
    token: &CancellationToken,
) -> Result<Sequence> {
    loop {
        let mark = *ceiling.borrow_and_update();
        if mark > floor {
            return Ok(mark);
        }
        tokio::select! {
            _ = token.cancelled() => return Err(AthanorError::Cancelled),
            changed = ceiling.changed() => {
                if changed.is_err() {
                    return Err(AthanorError::Cancelled);
                }
            }
        }
    }
}

async fn pump(
    fetcher: Arc<EventFetcher>,
    options: QueueOptions,
    mut floor: Sequence,
    mut ceiling: watch::Receiver<Sequence>,
    hopper: Arc<Hopper>,
    sender: mpsc::Sender<Result<EventRange>>,
    token: CancellationToken,
) {
    loop {
        let result = async {
            let mark = wait_for_ceiling(&mut ceiling, floor, &token).await?;
            let room = hopper.room(options.maximum_hopper_size, &token).await?;
            let batch = options.batch_size.min(room);
            fetcher.fetch(floor, mark, batch, &token).await
        }
        .await;

        match result {
            Ok(page) => {
                hopper.fill(page.len());
                floor = page.ceiling;
                debug!(
                    shard = %fetcher.shard(),
                    floor = page.floor,
                    ceiling = page.ceiling,
                    buffered = hopper.buffered(),
                    "Queued page"
                );
                if sender.send(Ok(page)).await.is_err() {
                    return;
                }
            }
            Err(AthanorError::Cancelled) => return,
            Err(e) => {
                let _ = sender.send(Err(e)).await;
                return;
            }
        }
    }
}
