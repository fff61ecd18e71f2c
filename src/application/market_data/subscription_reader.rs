//! Per-subscription record readers feeding the synchronizer.

use crate::domain::market::data_point::MarketRecord;
use crate::domain::market::live_feed::{IngestionHandle, LiveFeedReceiver, LivePoll};
use crossbeam_channel::{Receiver, RecvError, bounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::debug;

pub enum ReadOutcome {
    Record(MarketRecord),
    /// Nothing available right now (live only)
    Pending,
    Exhausted,
}

enum ReaderSource {
    Historical(Box<dyn Iterator<Item = MarketRecord> + Send>),
    Prefetched {
        rx: Receiver<MarketRecord>,
        handle: IngestionHandle,
    },
    Live {
        feed: LiveFeedReceiver,
        handle: IngestionHandle,
    },
    Stopped,
}

pub struct SubscriptionReader {
    source: ReaderSource,
}

impl SubscriptionReader {
    pub fn historical(records: Box<dyn Iterator<Item = MarketRecord> + Send>) -> Self {
        Self {
            source: ReaderSource::Historical(records),
        }
    }

    /// Reads the iterator on a dedicated ingestion thread through a bounded queue.
    ///
    /// Per-subscription order is preserved; the consumer blocks until the next record
    /// arrives or the thread finishes.
    pub fn prefetched(
        name: &str,
        records: Box<dyn Iterator<Item = MarketRecord> + Send>,
        capacity: usize,
    ) -> std::io::Result<Self> {
        let (tx, rx) = bounded(capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = thread::Builder::new()
            .name(format!("ingest-{}", name))
            .spawn(move || {
                for record in records {
                    if thread_stop.load(Ordering::Acquire) || tx.send(record).is_err() {
                        break;
                    }
                }
            })?;
        debug!("SubscriptionReader[{}]: prefetch thread started", name);
        Ok(Self {
            source: ReaderSource::Prefetched {
                rx,
                handle: IngestionHandle::new(stop, Some(join)),
            },
        })
    }

    pub fn live(feed: LiveFeedReceiver, handle: IngestionHandle) -> Self {
        Self {
            source: ReaderSource::Live { feed, handle },
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.source, ReaderSource::Live { .. })
    }

    pub fn next_record(&mut self) -> ReadOutcome {
        let outcome = match &mut self.source {
            ReaderSource::Historical(records) => match records.next() {
                Some(record) => ReadOutcome::Record(record),
                None => ReadOutcome::Exhausted,
            },
            ReaderSource::Prefetched { rx, .. } => match rx.recv() {
                Ok(record) => ReadOutcome::Record(record),
                Err(RecvError) => ReadOutcome::Exhausted,
            },
            ReaderSource::Live { feed, .. } => match feed.try_next() {
                LivePoll::Record(record) => ReadOutcome::Record(record),
                LivePoll::Empty => ReadOutcome::Pending,
                LivePoll::Closed => ReadOutcome::Exhausted,
            },
            ReaderSource::Stopped => ReadOutcome::Exhausted,
        };
        if matches!(outcome, ReadOutcome::Exhausted) {
            self.source = ReaderSource::Stopped;
        }
        outcome
    }

    /// Live queue overflow count, zero for historical readers.
    pub fn dropped_count(&self) -> u64 {
        match &self.source {
            ReaderSource::Live { feed, .. } => feed.dropped_count(),
            _ => 0,
        }
    }

    /// Stops ingestion and discards anything still queued. Returns the discarded count.
    pub fn stop(&mut self) -> usize {
        let discarded = match &mut self.source {
            ReaderSource::Historical(_) | ReaderSource::Stopped => 0,
            ReaderSource::Prefetched { rx, handle } => {
                handle.stop();
                rx.try_iter().count()
            }
            ReaderSource::Live { feed, handle } => {
                handle.stop();
                feed.close()
            }
        };
        self.source = ReaderSource::Stopped;
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::data_point::SubscriptionId;
    use crate::domain::market::live_feed::{OverflowPolicy, live_feed};
    use chrono::{Duration, NaiveDate, NaiveDateTime};
    use rust_decimal_macros::dec;

    fn records(n: i64) -> Vec<MarketRecord> {
        let t0: NaiveDateTime = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        (0..n)
            .map(|i| MarketRecord::tick(t0 + Duration::seconds(i), dec!(100), dec!(1)))
            .collect()
    }

    fn drain(reader: &mut SubscriptionReader) -> Vec<MarketRecord> {
        let mut out = Vec::new();
        while let ReadOutcome::Record(r) = reader.next_record() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_prefetched_preserves_order() {
        let expected = records(50);
        let mut reader =
            SubscriptionReader::prefetched("SPY", Box::new(expected.clone().into_iter()), 4)
                .unwrap();
        assert_eq!(drain(&mut reader), expected);
        assert!(matches!(reader.next_record(), ReadOutcome::Exhausted));
    }

    #[test]
    fn test_live_reader_reports_pending_then_exhausted() {
        let (tx, rx) = live_feed(SubscriptionId(0), "SPY", 8, OverflowPolicy::Block);
        let mut reader = SubscriptionReader::live(rx, IngestionHandle::default());
        assert!(matches!(reader.next_record(), ReadOutcome::Pending));

        tx.send(records(1).remove(0)).unwrap();
        assert!(matches!(reader.next_record(), ReadOutcome::Record(_)));

        drop(tx);
        assert!(matches!(reader.next_record(), ReadOutcome::Exhausted));
    }

    #[test]
    fn test_stop_discards_queued_live_records() {
        let (tx, rx) = live_feed(SubscriptionId(0), "SPY", 8, OverflowPolicy::Block);
        let mut reader = SubscriptionReader::live(rx, IngestionHandle::default());
        for record in records(3) {
            tx.send(record).unwrap();
        }
        assert_eq!(reader.stop(), 3);
        assert!(tx.send(records(1).remove(0)).is_err());
        assert!(matches!(reader.next_record(), ReadOutcome::Exhausted));
    }
}
