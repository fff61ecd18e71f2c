//! Bounded hand-off queue between a live ingestion thread and the synchronizer.

use crate::domain::market::data_point::{MarketRecord, SubscriptionId};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::warn;

/// What a producer does when the per-subscription queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits for the consumer
    #[default]
    Block,
    /// Incoming record is discarded and counted
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" | "drop_newest" => Ok(OverflowPolicy::DropNewest),
            _ => anyhow::bail!(
                "Invalid overflow policy: {}. Must be 'block' or 'drop_newest'",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("live feed closed")]
pub struct FeedClosed;

/// Producer side, handed to a `LiveDataSource` or an external pusher.
#[derive(Debug, Clone)]
pub struct LiveFeedSender {
    subscription: SubscriptionId,
    symbol: String,
    tx: Sender<MarketRecord>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl LiveFeedSender {
    pub fn send(&self, record: MarketRecord) -> Result<(), FeedClosed> {
        if self.is_stopped() {
            return Err(FeedClosed);
        }
        match self.policy {
            OverflowPolicy::Block => self.tx.send(record).map_err(|_| FeedClosed),
            OverflowPolicy::DropNewest => match self.tx.try_send(record) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped == 1 || dropped % 1000 == 0 {
                        warn!(
                            "LiveFeed[{} {}]: Queue full, dropped {} record(s) so far",
                            self.subscription, self.symbol, dropped
                        );
                    }
                    Ok(())
                }
                Err(TrySendError::Disconnected(_)) => Err(FeedClosed),
            },
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }
}

pub enum LivePoll {
    Record(MarketRecord),
    Empty,
    Closed,
}

/// Consumer side, owned by the synchronizer.
#[derive(Debug)]
pub struct LiveFeedReceiver {
    rx: Receiver<MarketRecord>,
    dropped: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
}

impl LiveFeedReceiver {
    pub fn try_next(&self) -> LivePoll {
        match self.rx.try_recv() {
            Ok(record) => LivePoll::Record(record),
            Err(TryRecvError::Empty) => LivePoll::Empty,
            Err(TryRecvError::Disconnected) => LivePoll::Closed,
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Signals producers to stop and discards everything still queued.
    pub fn close(&self) -> usize {
        self.stop.store(true, Ordering::Release);
        self.rx.try_iter().count()
    }
}

pub fn live_feed(
    subscription: SubscriptionId,
    symbol: &str,
    capacity: usize,
    policy: OverflowPolicy,
) -> (LiveFeedSender, LiveFeedReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let stop = Arc::new(AtomicBool::new(false));
    (
        LiveFeedSender {
            subscription,
            symbol: symbol.to_string(),
            tx,
            policy,
            dropped: dropped.clone(),
            stop: stop.clone(),
        },
        LiveFeedReceiver { rx, dropped, stop },
    )
}

/// Handle to a running ingestion thread.
#[derive(Debug, Default)]
pub struct IngestionHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl IngestionHandle {
    pub fn new(stop: Arc<AtomicBool>, thread: Option<JoinHandle<()>>) -> Self {
        Self { stop, thread }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        // Threads blocked on a full queue exit once the receiver is dropped, so no join here.
        self.thread.take();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}
