//! Event-time merge of all active subscriptions into one ordered frontier sequence.
//!
//! Every subscription contributes one key to a min-heap: the end time of its next
//! buffered point, or the end of its next expected period when a fill-forward copy
//! is due. The smallest key is the frontier; every subscription whose key lies within
//! `frontier + tolerance` is drained into the same batch. Ties are broken by
//! subscription id, so the output depends only on the data, never on thread timing.

use crate::application::market_data::subscription_reader::{ReadOutcome, SubscriptionReader};
use crate::domain::errors::EngineError;
use crate::domain::events::RunEvent;
use crate::domain::market::data_point::{DataPoint, SubscriptionId};
use crate::domain::market::slice::FrontierBatch;
use crate::domain::market::subscription::Subscription;
use crate::domain::validation::data_quality::StrictRecordValidator;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynchronizerSettings {
    /// Keys within `frontier + time_tolerance` join the frontier batch
    pub time_tolerance: Duration,
    /// Consecutive fill-forward periods allowed before a subscription is stale
    pub max_fill_forward_gap: u32,
}

impl Default for SynchronizerSettings {
    fn default() -> Self {
        Self {
            time_tolerance: Duration::zero(),
            max_fill_forward_gap: 390,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncPoll {
    Batch(FrontierBatch),
    /// Subscriptions are alive but nothing is due yet
    Pending,
    EndOfStream,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub batches: u64,
    pub data_points: u64,
    pub fill_forward_points: u64,
    pub out_of_order_points: u64,
    pub filtered_points: u64,
}

#[derive(Default)]
struct SyncLedger {
    events: Vec<RunEvent>,
    stats: SyncStats,
}

enum Ingest {
    Buffered,
    Pending,
    Exhausted,
}

struct StreamState {
    subscription: Arc<Subscription>,
    reader: SubscriptionReader,
    buffer: VecDeque<DataPoint>,
    last_record: Option<(DateTime<Utc>, DateTime<Utc>)>,
    last_emitted: Option<DataPoint>,
    /// Current heap key; heap entries that disagree are discarded on pop
    key: Option<DateTime<Utc>>,
    /// Period end of the fill-forward copy due at `key`, if any
    pending_fill_forward: Option<DateTime<Utc>>,
    fill_forward_gap: u32,
    stale_since: Option<DateTime<Utc>>,
    exhausted: bool,
    removing: bool,
    reported_dropped: u64,
}

impl StreamState {
    fn new(subscription: Arc<Subscription>, reader: SubscriptionReader) -> Self {
        Self {
            subscription,
            reader,
            buffer: VecDeque::new(),
            last_record: None,
            last_emitted: None,
            key: None,
            pending_fill_forward: None,
            fill_forward_gap: 0,
            stale_since: None,
            exhausted: false,
            removing: false,
            reported_dropped: 0,
        }
    }

    fn integrity_error(&self, reason: String) -> EngineError {
        EngineError::DataIntegrity {
            subscription: self.subscription.id,
            symbol: self.subscription.symbol.clone(),
            reason,
        }
    }

    /// Reads until one session-valid point is buffered or the reader has nothing more.
    fn ingest_one(
        &mut self,
        last_frontier: Option<DateTime<Utc>>,
        ledger: &mut SyncLedger,
    ) -> Result<Ingest, EngineError> {
        if self.exhausted {
            return Ok(Ingest::Exhausted);
        }
        loop {
            let record = match self.reader.next_record() {
                ReadOutcome::Record(record) => record,
                ReadOutcome::Pending => return Ok(Ingest::Pending),
                ReadOutcome::Exhausted => {
                    self.exhausted = true;
                    return Ok(Ingest::Exhausted);
                }
            };

            StrictRecordValidator::validate(&record).map_err(|reason| self.integrity_error(reason))?;

            let time = self.subscription.to_utc(record.time);
            let end_time = self.subscription.to_utc(record.end_time);
            if let Some((last_time, last_end)) = self.last_record
                && (time < last_time || end_time < last_end)
            {
                return Err(self.integrity_error(format!(
                    "timestamp {} precedes previous {}",
                    end_time, last_end
                )));
            }
            self.last_record = Some((time, end_time));

            if !self.subscription.accepts(time, end_time) {
                ledger.stats.filtered_points += 1;
                continue;
            }
            let late = last_frontier.filter(|frontier| end_time <= *frontier);
            // History behind the frontier was already simulated
            if late.is_some() && !self.reader.is_live() {
                ledger.stats.filtered_points += 1;
                continue;
            }

            let mut point = DataPoint {
                subscription_id: self.subscription.id,
                symbol: self.subscription.symbol.clone(),
                time,
                end_time,
                value: record.value,
                is_fill_forward: false,
                is_out_of_order: false,
            };
            if let Some(frontier) = late {
                point.is_out_of_order = true;
                ledger.stats.out_of_order_points += 1;
                ledger.events.push(RunEvent::OutOfOrderData {
                    subscription: self.subscription.id,
                    symbol: self.subscription.symbol.clone(),
                    end_time,
                    frontier,
                });
            }
            self.buffer.push_back(point);
            return Ok(Ingest::Buffered);
        }
    }

    fn ensure_buffered(
        &mut self,
        last_frontier: Option<DateTime<Utc>>,
        ledger: &mut SyncLedger,
    ) -> Result<(), EngineError> {
        if self.buffer.is_empty() {
            self.ingest_one(last_frontier, ledger)?;
        }
        Ok(())
    }

    fn ingest_available(
        &mut self,
        last_frontier: Option<DateTime<Utc>>,
        ledger: &mut SyncLedger,
    ) -> Result<(), EngineError> {
        if !self.reader.is_live() {
            return self.ensure_buffered(last_frontier, ledger);
        }
        while let Ingest::Buffered = self.ingest_one(last_frontier, ledger)? {}

        let dropped = self.reader.dropped_count();
        if dropped > self.reported_dropped {
            self.reported_dropped = dropped;
            ledger.events.push(RunEvent::QueueOverflow {
                subscription: self.subscription.id,
                dropped,
            });
        }
        Ok(())
    }

    fn fill_forward_candidate(&self, last_frontier: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        if !self.subscription.fill_forward || self.removing || self.stale_since.is_some() {
            return None;
        }
        if self.exhausted && self.buffer.is_empty() {
            return None;
        }
        let last = self.last_emitted.as_ref()?;
        let anchor = match last_frontier {
            Some(frontier) if frontier > last.end_time => frontier,
            _ => last.end_time,
        };
        self.subscription.next_expected_end(anchor)
    }

    /// Recomputes the heap key from buffered data and the fill-forward schedule.
    fn refresh_key(&mut self, last_frontier: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let real = self.buffer.front().map(|p| p.end_time);
        let fill_forward = self.fill_forward_candidate(last_frontier);
        self.pending_fill_forward = match (real, fill_forward) {
            (Some(real), Some(ff)) if ff < real => Some(ff),
            (None, Some(ff)) => Some(ff),
            _ => None,
        };
        self.key = match (real, self.pending_fill_forward) {
            (Some(real), Some(ff)) => Some(real.min(ff)),
            (real, ff) => real.or(ff),
        };
        self.key
    }

    fn is_finished(&self) -> bool {
        self.buffer.is_empty() && (self.exhausted || self.removing)
    }

    fn front_is_late(&self) -> bool {
        self.buffer.front().is_some_and(|p| p.is_out_of_order)
    }

    /// Moves every point due by `limit` into the batch, or a fill-forward copy if none.
    fn emit(
        &mut self,
        limit: DateTime<Utc>,
        last_frontier: Option<DateTime<Utc>>,
        max_gap: u32,
        batch: &mut FrontierBatch,
        ledger: &mut SyncLedger,
    ) -> Result<(), EngineError> {
        let mut emitted_real = false;
        loop {
            if !self.removing {
                self.ensure_buffered(last_frontier, ledger)?;
            }
            match self.buffer.front() {
                Some(point) if point.end_time <= limit => {}
                _ => break,
            }
            let Some(point) = self.buffer.pop_front() else {
                break;
            };
            let newest = self
                .last_emitted
                .as_ref()
                .is_none_or(|last| point.end_time >= last.end_time);
            if newest {
                self.last_emitted = Some(point.clone());
            }
            ledger.stats.data_points += 1;
            batch.push(point);
            emitted_real = true;
        }

        if emitted_real {
            self.fill_forward_gap = 0;
            if self.stale_since.take().is_some() {
                info!(
                    "TimeSynchronizer: {} resumed at {}",
                    self.subscription, batch.time
                );
                ledger.events.push(RunEvent::SubscriptionResumed {
                    subscription: self.subscription.id,
                    symbol: self.subscription.symbol.clone(),
                    at: batch.time,
                });
            }
            return Ok(());
        }

        let Some(ff_end) = self.pending_fill_forward.filter(|end| *end <= limit) else {
            return Ok(());
        };
        if self.fill_forward_gap >= max_gap {
            self.stale_since = Some(ff_end);
            warn!(
                "TimeSynchronizer: {} is stale at {} after {} fill-forward periods",
                self.subscription, ff_end, self.fill_forward_gap
            );
            ledger.events.push(RunEvent::SubscriptionStale {
                subscription: self.subscription.id,
                symbol: self.subscription.symbol.clone(),
                since: ff_end,
                missing_periods: self.fill_forward_gap + 1,
            });
            return Ok(());
        }
        let Some(last) = self.last_emitted.as_ref() else {
            return Ok(());
        };
        let point = DataPoint {
            subscription_id: self.subscription.id,
            symbol: self.subscription.symbol.clone(),
            time: self.subscription.period_start(ff_end),
            end_time: ff_end,
            value: last.value.clone(),
            is_fill_forward: true,
            is_out_of_order: false,
        };
        self.last_emitted = Some(point.clone());
        self.fill_forward_gap += 1;
        ledger.stats.fill_forward_points += 1;
        batch.push(point);
        Ok(())
    }
}

pub struct TimeSynchronizer {
    settings: SynchronizerSettings,
    streams: BTreeMap<SubscriptionId, StreamState>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, SubscriptionId)>>,
    /// Streams added since the last advance whose keys are not in the heap yet
    unkeyed: Vec<SubscriptionId>,
    last_frontier: Option<DateTime<Utc>>,
    ledger: SyncLedger,
}

impl TimeSynchronizer {
    pub fn new(settings: SynchronizerSettings) -> Self {
        Self {
            settings,
            streams: BTreeMap::new(),
            heap: BinaryHeap::new(),
            unkeyed: Vec::new(),
            last_frontier: None,
            ledger: SyncLedger::default(),
        }
    }

    pub fn settings(&self) -> SynchronizerSettings {
        self.settings
    }

    pub fn add_stream(&mut self, subscription: Arc<Subscription>, reader: SubscriptionReader) {
        let id = subscription.id;
        debug!("TimeSynchronizer: Adding stream {}", subscription);
        self.streams
            .insert(id, StreamState::new(subscription, reader));
        self.unkeyed.push(id);
    }

    /// Stops future emission for a subscription. Already-buffered points still drain.
    ///
    /// Returns the number of queued records discarded from its ingestion queue.
    pub fn remove_stream(&mut self, id: SubscriptionId) -> usize {
        let Some(stream) = self.streams.get_mut(&id) else {
            return 0;
        };
        stream.removing = true;
        let discarded = stream.reader.stop();
        stream.refresh_key(self.last_frontier);
        if stream.is_finished() {
            self.streams.remove(&id);
        } else if let Some(key) = stream.key {
            self.heap.push(Reverse((key, id)));
        }
        debug!(
            "TimeSynchronizer: Removing stream {} ({} queued records discarded)",
            id, discarded
        );
        discarded
    }

    pub fn last_frontier(&self) -> Option<DateTime<Utc>> {
        self.last_frontier
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_stale(&self, id: SubscriptionId) -> bool {
        self.streams
            .get(&id)
            .is_some_and(|s| s.stale_since.is_some())
    }

    pub fn stats(&self) -> SyncStats {
        self.ledger.stats
    }

    pub fn take_events(&mut self) -> Vec<RunEvent> {
        std::mem::take(&mut self.ledger.events)
    }

    fn key_stream(&mut self, id: SubscriptionId) -> Result<(), EngineError> {
        let last_frontier = self.last_frontier;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        stream.ensure_buffered(last_frontier, &mut self.ledger)?;
        match stream.refresh_key(last_frontier) {
            Some(key) => self.heap.push(Reverse((key, id))),
            None if stream.is_finished() => {
                debug!("TimeSynchronizer: Stream {} finished", stream.subscription);
                self.streams.remove(&id);
            }
            None => {}
        }
        Ok(())
    }

    /// Pops every valid heap entry whose key is within `limit`.
    fn collect_due(&mut self, limit: DateTime<Utc>) -> Vec<SubscriptionId> {
        let mut due = Vec::new();
        while let Some(Reverse((key, id))) = self.heap.peek().copied() {
            if key > limit {
                break;
            }
            self.heap.pop();
            let valid = self
                .streams
                .get(&id)
                .is_some_and(|s| s.key == Some(key));
            if valid && !due.contains(&id) {
                due.push(id);
            }
        }
        due.sort();
        due
    }

    fn emit_due(
        &mut self,
        due: &[SubscriptionId],
        limit: DateTime<Utc>,
        batch: &mut FrontierBatch,
    ) -> Result<(), EngineError> {
        let last_frontier = self.last_frontier;
        let max_gap = self.settings.max_fill_forward_gap;
        for id in due {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.emit(limit, last_frontier, max_gap, batch, &mut self.ledger)?;
            }
        }
        Ok(())
    }

    fn record_batch(&mut self, batch: &FrontierBatch) {
        self.last_frontier = Some(batch.time);
        self.ledger.stats.batches += 1;
    }

    /// Backtest advance: next non-empty frontier batch, or `None` once every stream is done.
    pub fn advance(&mut self) -> Result<Option<FrontierBatch>, EngineError> {
        for id in std::mem::take(&mut self.unkeyed) {
            self.key_stream(id)?;
        }

        loop {
            let Some(Reverse((frontier, id))) = self.heap.pop() else {
                return Ok(None);
            };
            let valid = self
                .streams
                .get(&id)
                .is_some_and(|s| s.key == Some(frontier));
            if !valid {
                continue;
            }

            let limit = frontier + self.settings.time_tolerance;
            let mut due = self.collect_due(limit);
            if !due.contains(&id) {
                due.push(id);
                due.sort();
            }

            let mut batch = FrontierBatch::new(frontier);
            self.emit_due(&due, limit, &mut batch)?;
            if !batch.is_empty() {
                self.record_batch(&batch);
            }
            for id in due {
                self.key_stream(id)?;
            }
            if !batch.is_empty() {
                return Ok(Some(batch));
            }
        }
    }

    /// Live advance: the frontier never passes `now`.
    ///
    /// Points arriving after their frontier has been emitted are delivered in the next
    /// batch flagged out-of-order; a batch holding only late points is stamped `now`.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Result<SyncPoll, EngineError> {
        self.unkeyed.clear();
        self.heap.clear();
        let last_frontier = self.last_frontier;

        let mut finished = Vec::new();
        let mut has_late = false;
        for (id, stream) in self.streams.iter_mut() {
            stream.ingest_available(last_frontier, &mut self.ledger)?;
            has_late |= stream.front_is_late();
            match stream.refresh_key(last_frontier) {
                Some(key) if key <= now => self.heap.push(Reverse((key, *id))),
                Some(_) => {}
                None if stream.is_finished() => finished.push(*id),
                None => {}
            }
        }
        for id in finished {
            debug!("TimeSynchronizer: Live stream {} finished", id);
            self.streams.remove(&id);
        }
        if self.streams.is_empty() {
            return Ok(SyncPoll::EndOfStream);
        }

        let on_time = self
            .heap
            .iter()
            .map(|Reverse((key, _))| *key)
            .filter(|key| last_frontier.is_none_or(|f| *key > f))
            .min();
        let frontier = match on_time {
            Some(key) => key,
            None if has_late && last_frontier.is_none_or(|f| now > f) => now,
            None => return Ok(SyncPoll::Pending),
        };
        let limit = (frontier + self.settings.time_tolerance).min(now);

        let due = self.collect_due(limit);
        let mut batch = FrontierBatch::new(frontier);
        self.emit_due(&due, limit, &mut batch)?;
        self.heap.clear();

        if batch.is_empty() {
            return Ok(SyncPoll::Pending);
        }
        self.record_batch(&batch);
        Ok(SyncPoll::Batch(batch))
    }

    /// Stops all ingestion and drops everything still queued. Returns the discarded count.
    pub fn shutdown(&mut self) -> usize {
        let mut discarded = 0;
        for stream in self.streams.values_mut() {
            discarded += stream.reader.stop() + stream.buffer.len();
        }
        self.streams.clear();
        self.heap.clear();
        self.unkeyed.clear();
        if discarded > 0 {
            info!("TimeSynchronizer: Discarded {} queued data points", discarded);
        }
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::calendar::ExchangeCalendar;
    use crate::domain::market::data_point::MarketRecord;
    use crate::domain::market::live_feed::{IngestionHandle, OverflowPolicy, live_feed};
    use crate::domain::market::resolution::Resolution;
    use crate::domain::market::subscription::DataKind;
    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn subscription(id: u32, symbol: &str, resolution: Resolution, fill_forward: bool) -> Arc<Subscription> {
        let calendar = Arc::new(ExchangeCalendar::us_equity());
        Arc::new(Subscription {
            id: SubscriptionId(id),
            symbol: symbol.to_string(),
            resolution,
            kind: DataKind::TradeBar,
            data_time_zone: calendar.utc_offset,
            calendar,
            fill_forward,
            extended_hours: false,
        })
    }

    fn local(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn minute_bar(day: u32, hour: u32, minute: u32, close: Decimal) -> MarketRecord {
        let start = local(day, hour, minute);
        MarketRecord::bar(start, start + Duration::minutes(1), close, close, close, close, dec!(100))
    }

    fn reader(records: Vec<MarketRecord>) -> SubscriptionReader {
        SubscriptionReader::historical(Box::new(records.into_iter()))
    }

    fn drain(sync: &mut TimeSynchronizer) -> Vec<FrontierBatch> {
        let mut out = Vec::new();
        while let Some(batch) = sync.advance().unwrap() {
            out.push(batch);
        }
        out
    }

    #[test]
    fn test_merges_two_streams_in_time_order() {
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        sync.add_stream(
            subscription(0, "AAA", Resolution::Minute, false),
            reader(vec![minute_bar(2, 9, 30, dec!(1)), minute_bar(2, 9, 32, dec!(2))]),
        );
        sync.add_stream(
            subscription(1, "BBB", Resolution::Minute, false),
            reader(vec![minute_bar(2, 9, 31, dec!(3)), minute_bar(2, 9, 32, dec!(4))]),
        );

        let batches = drain(&mut sync);
        assert_eq!(batches.len(), 3);
        assert!(batches.windows(2).all(|w| w[0].time < w[1].time));
        assert_eq!(batches[2].points.len(), 2);
        assert_eq!(sync.stats().data_points, 4);
    }

    #[test]
    fn test_non_monotonic_timestamps_are_fatal() {
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        sync.add_stream(
            subscription(0, "AAA", Resolution::Minute, false),
            reader(vec![minute_bar(2, 9, 35, dec!(1)), minute_bar(2, 9, 31, dec!(2))]),
        );

        let err = loop {
            match sync.advance() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an integrity failure"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, EngineError::DataIntegrity { .. }));
    }

    #[test]
    fn test_out_of_session_bars_are_filtered() {
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        sync.add_stream(
            subscription(0, "AAA", Resolution::Minute, false),
            reader(vec![
                minute_bar(2, 8, 0, dec!(1)),
                minute_bar(2, 9, 30, dec!(2)),
                minute_bar(2, 16, 5, dec!(3)),
            ]),
        );

        let batches = drain(&mut sync);
        assert_eq!(batches.len(), 1);
        assert_eq!(sync.stats().filtered_points, 2);
    }

    #[test]
    fn test_remove_drains_buffer_then_stops() {
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        let records: Vec<_> = (30..40).map(|m| minute_bar(2, 9, m, dec!(1))).collect();
        sync.add_stream(subscription(0, "AAA", Resolution::Minute, true), reader(records));

        assert!(sync.advance().unwrap().is_some());
        sync.remove_stream(SubscriptionId(0));

        // The single look-ahead point still drains, nothing after it, and no fill-forward
        let rest = drain(&mut sync);
        assert_eq!(rest.len(), 1);
        assert_eq!(sync.stream_count(), 0);
    }

    #[test]
    fn test_live_poll_caps_frontier_at_now() {
        let sub = subscription(0, "AAA", Resolution::Minute, false);
        let (tx, rx) = live_feed(sub.id, "AAA", 16, OverflowPolicy::Block);
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        sync.add_stream(sub.clone(), SubscriptionReader::live(rx, IngestionHandle::default()));

        tx.send(minute_bar(2, 9, 30, dec!(1))).unwrap();
        let before_close = sub.to_utc(local(2, 9, 30)) + Duration::seconds(30);
        assert_eq!(sync.poll(before_close).unwrap(), SyncPoll::Pending);

        let after_close = sub.to_utc(local(2, 9, 31));
        match sync.poll(after_close).unwrap() {
            SyncPoll::Batch(batch) => assert_eq!(batch.time, after_close),
            other => panic!("expected batch, got {:?}", other),
        }

        drop(tx);
        assert_eq!(sync.poll(after_close).unwrap(), SyncPoll::EndOfStream);
    }

    #[test]
    fn test_shutdown_counts_discarded_points() {
        let sub = subscription(0, "AAA", Resolution::Minute, false);
        let (tx, rx) = live_feed(sub.id, "AAA", 16, OverflowPolicy::Block);
        let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
        sync.add_stream(sub, SubscriptionReader::live(rx, IngestionHandle::default()));
        for m in 30..33 {
            tx.send(minute_bar(2, 9, m, dec!(1))).unwrap();
        }

        assert_eq!(sync.shutdown(), 3);
        assert_eq!(sync.stream_count(), 0);
    }
}
