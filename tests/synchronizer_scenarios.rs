use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use synctrade::application::market_data::slice_aggregator::SliceAggregator;
use synctrade::application::market_data::subscription_registry::{
    DataSources, RegistrySettings, SubscriptionRegistry,
};
use synctrade::application::market_data::time_synchronizer::{
    SyncPoll, SynchronizerSettings, TimeSynchronizer,
};
use synctrade::domain::events::RunEvent;
use synctrade::domain::market::calendar::CalendarRegistry;
use synctrade::domain::market::data_point::MarketRecord;
use synctrade::domain::market::resolution::Resolution;
use synctrade::domain::market::slice::FrontierBatch;
use synctrade::domain::market::subscription::{DataKind, SubscriptionDescriptor};
use synctrade::infrastructure::data::InMemoryDataSource;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Exchange-local time on 2024-01-02 (a Tuesday).
fn local(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

/// Same instant in UTC for the UTC-5 equity calendar.
fn utc(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, hour + 5, minute, 0).unwrap()
}

fn minute_bar(start: NaiveDateTime, close: Decimal) -> MarketRecord {
    MarketRecord::bar(
        start,
        start + Duration::minutes(1),
        close,
        close + dec!(0.10),
        close - dec!(0.10),
        close,
        dec!(1000),
    )
}

fn full_session(base: Decimal) -> Vec<MarketRecord> {
    (0..390)
        .map(|i| minute_bar(local(9, 30) + Duration::minutes(i), base + Decimal::from(i)))
        .collect()
}

fn synchronizer_with(
    source: InMemoryDataSource,
    settings: SynchronizerSettings,
    descriptors: Vec<SubscriptionDescriptor>,
) -> TimeSynchronizer {
    let mut registry = registry_with(source);
    let mut sync = TimeSynchronizer::new(settings);
    for descriptor in descriptors {
        let (subscription, reader) = registry.add(descriptor, None).unwrap();
        sync.add_stream(subscription, reader);
    }
    sync
}

fn drain(sync: &mut TimeSynchronizer) -> Vec<FrontierBatch> {
    let mut batches = Vec::new();
    while let Some(batch) = sync.advance().unwrap() {
        batches.push(batch);
    }
    batches
}

#[test]
fn test_two_symbols_full_session_produce_390_slices() {
    init_tracing();
    let source = InMemoryDataSource::new()
        .with_series("SPY", Resolution::Minute, DataKind::TradeBar, full_session(dec!(470)))
        .with_series("QQQ", Resolution::Minute, DataKind::TradeBar, full_session(dec!(400)));
    let mut sync = synchronizer_with(
        source,
        SynchronizerSettings::default(),
        vec![
            SubscriptionDescriptor::new("SPY", Resolution::Minute),
            SubscriptionDescriptor::new("QQQ", Resolution::Minute),
        ],
    );

    let mut aggregator = SliceAggregator::new(5);
    let slices: Vec<_> = drain(&mut sync)
        .into_iter()
        .map(|batch| aggregator.aggregate(batch))
        .collect();

    assert_eq!(slices.len(), 390);
    assert!(slices.iter().all(|s| s.len() == 2));
    assert!(slices.windows(2).all(|w| w[0].time() < w[1].time()));
    assert_eq!(slices[0].time(), utc(9, 31));
    assert_eq!(slices[389].time(), utc(16, 0));
    assert_eq!(slices[0].price("SPY"), Some(dec!(470)));
    assert_eq!(slices[389].price("QQQ"), Some(dec!(789)));

    let stats = sync.stats();
    assert_eq!(stats.batches, 390);
    assert_eq!(stats.data_points, 780);
    assert_eq!(stats.fill_forward_points, 0);
    assert_eq!(aggregator.emitted(), 390);
    assert_eq!(aggregator.recent().len(), 5);
}

#[test]
fn test_daily_bar_joins_the_closing_minute() {
    init_tracing();
    let daily = MarketRecord::bar(
        local(9, 30),
        local(16, 0),
        dec!(470),
        dec!(480),
        dec!(465),
        dec!(475),
        dec!(1000000),
    );
    let source = InMemoryDataSource::new()
        .with_series("SPY", Resolution::Minute, DataKind::TradeBar, full_session(dec!(470)))
        .with_series("SPY", Resolution::Daily, DataKind::TradeBar, vec![daily]);
    let mut sync = synchronizer_with(
        source,
        SynchronizerSettings::default(),
        vec![
            SubscriptionDescriptor::new("SPY", Resolution::Minute),
            SubscriptionDescriptor::new("SPY", Resolution::Daily),
        ],
    );

    let batches = drain(&mut sync);
    assert_eq!(batches.len(), 390);
    let last = batches.last().unwrap();
    assert_eq!(last.time, utc(16, 0));
    assert_eq!(last.len(), 2);
    assert!(batches[..389].iter().all(|b| b.len() == 1));
}

#[test]
fn test_fill_forward_caps_at_max_gap_then_goes_stale() {
    init_tracing();
    let records = vec![
        minute_bar(local(9, 30), dec!(100)),
        // periods starting 9:31..9:34 are missing
        minute_bar(local(9, 35), dec!(101)),
        minute_bar(local(9, 36), dec!(102)),
    ];
    let source =
        InMemoryDataSource::new().with_series("SPY", Resolution::Minute, DataKind::TradeBar, records);
    let settings = SynchronizerSettings {
        max_fill_forward_gap: 3,
        ..SynchronizerSettings::default()
    };
    let mut sync = synchronizer_with(
        source,
        settings,
        vec![SubscriptionDescriptor::new("SPY", Resolution::Minute)],
    );

    let batches = drain(&mut sync);
    let times: Vec<_> = batches.iter().map(|b| b.time).collect();
    assert_eq!(
        times,
        vec![
            utc(9, 31),
            utc(9, 32),
            utc(9, 33),
            utc(9, 34),
            utc(9, 36),
            utc(9, 37)
        ]
    );

    let fill_forward: Vec<_> = batches
        .iter()
        .flat_map(|b| b.points.values().flatten())
        .filter(|p| p.is_fill_forward)
        .collect();
    assert_eq!(fill_forward.len(), 3);
    assert!(fill_forward.iter().all(|p| p.price() == dec!(100)));
    assert_eq!(sync.stats().fill_forward_points, 3);

    let events = sync.take_events();
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::SubscriptionStale { since, missing_periods: 4, .. } if *since == utc(9, 35)
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunEvent::SubscriptionResumed { at, .. } if *at == utc(9, 36)
    )));
}

fn tick_at(nanos: u32, price: Decimal) -> MarketRecord {
    let time = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_nano_opt(12, 0, 0, nanos)
        .unwrap();
    MarketRecord::tick(time, price, dec!(1))
}

fn tick_batches(settings: SynchronizerSettings, second_tick_nanos: u32) -> Vec<FrontierBatch> {
    let source = InMemoryDataSource::new()
        .with_series("BTC", Resolution::Tick, DataKind::Tick, vec![tick_at(0, dec!(42000))])
        .with_series(
            "ETH",
            Resolution::Tick,
            DataKind::Tick,
            vec![tick_at(second_tick_nanos, dec!(2500))],
        );
    let mut sync = synchronizer_with(
        source,
        settings,
        vec![
            SubscriptionDescriptor::new("BTC", Resolution::Tick).with_calendar("crypto"),
            SubscriptionDescriptor::new("ETH", Resolution::Tick).with_calendar("crypto"),
        ],
    );
    drain(&mut sync)
}

#[test]
fn test_tolerance_edge_is_inclusive() {
    init_tracing();
    let settings = SynchronizerSettings {
        time_tolerance: Duration::milliseconds(1),
        ..SynchronizerSettings::default()
    };

    let joined = tick_batches(settings, 1_000_000);
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].len(), 2);
    assert_eq!(joined[0].time, Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap());

    let split = tick_batches(settings, 1_000_001);
    assert_eq!(split.len(), 2);
    assert!(split.iter().all(|b| b.len() == 1));
}

#[test]
fn test_zero_tolerance_requires_exact_equality() {
    init_tracing();
    let exact = tick_batches(SynchronizerSettings::default(), 0);
    assert_eq!(exact.len(), 1);

    let off_by_one = tick_batches(SynchronizerSettings::default(), 1);
    assert_eq!(off_by_one.len(), 2);
}

#[test]
fn test_replay_is_deterministic() {
    init_tracing();
    let build = || {
        let mut spy = full_session(dec!(470));
        spy.retain(|r| r.time.time().format("%M").to_string() != "45");
        let source = InMemoryDataSource::new()
            .with_series("SPY", Resolution::Minute, DataKind::TradeBar, spy)
            .with_series("QQQ", Resolution::Minute, DataKind::TradeBar, full_session(dec!(400)));
        synchronizer_with(
            source,
            SynchronizerSettings::default(),
            vec![
                SubscriptionDescriptor::new("QQQ", Resolution::Minute),
                SubscriptionDescriptor::new("SPY", Resolution::Minute),
            ],
        )
    };

    let first = drain(&mut build());
    let second = drain(&mut build());
    assert_eq!(first, second);
    assert_eq!(first.len(), 390);
}

#[test]
fn test_out_of_session_records_are_filtered() {
    init_tracing();
    let mut records = vec![minute_bar(local(8, 0), dec!(99))];
    records.extend(full_session(dec!(100)).into_iter().take(3));
    let source =
        InMemoryDataSource::new().with_series("SPY", Resolution::Minute, DataKind::TradeBar, records);
    let mut sync = synchronizer_with(
        source,
        SynchronizerSettings::default(),
        vec![SubscriptionDescriptor::new("SPY", Resolution::Minute)],
    );

    let batches = drain(&mut sync);
    assert_eq!(batches.len(), 3);
    assert_eq!(sync.stats().filtered_points, 1);
}

fn two_symbol_source(bars: usize) -> InMemoryDataSource {
    let aaa: Vec<_> = full_session(dec!(100)).into_iter().take(bars).collect();
    let bbb: Vec<_> = full_session(dec!(200)).into_iter().take(bars).collect();
    InMemoryDataSource::new()
        .with_series("AAA", Resolution::Minute, DataKind::TradeBar, aaa)
        .with_series("BBB", Resolution::Minute, DataKind::TradeBar, bbb)
}

fn registry_with(source: InMemoryDataSource) -> SubscriptionRegistry {
    SubscriptionRegistry::new(
        CalendarRegistry::new(),
        DataSources {
            historical: Some(Arc::new(source)),
            live: None,
        },
        RegistrySettings::default(),
    )
}

#[test]
fn test_stream_added_mid_run_never_moves_the_frontier_back() {
    init_tracing();
    let mut registry = registry_with(two_symbol_source(20));
    let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
    let (aaa, reader) = registry
        .add(SubscriptionDescriptor::new("AAA", Resolution::Minute), None)
        .unwrap();
    sync.add_stream(aaa, reader);

    let mut frontiers = Vec::new();
    for _ in 0..10 {
        frontiers.push(sync.advance().unwrap().unwrap().time);
    }
    assert_eq!(sync.last_frontier(), Some(utc(9, 40)));

    // Reader opened from the start of the day; its first ten bars are already behind
    let (bbb, reader) = registry
        .add(SubscriptionDescriptor::new("BBB", Resolution::Minute), None)
        .unwrap();
    sync.add_stream(bbb.clone(), reader);

    let next = sync.advance().unwrap().unwrap();
    assert_eq!(next.time, utc(9, 41));
    assert_eq!(next.len(), 2);
    assert_eq!(next.points[&bbb.id][0].end_time, utc(9, 41));
    assert!(!next.points[&bbb.id][0].is_out_of_order);
    frontiers.push(next.time);
    frontiers.extend(drain(&mut sync).into_iter().map(|b| b.time));

    assert_eq!(frontiers.len(), 20);
    assert!(frontiers.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sync.stats().filtered_points, 10);
    assert_eq!(sync.stats().out_of_order_points, 0);
    assert!(sync.take_events().is_empty());
}

#[test]
fn test_late_live_bar_is_delivered_flagged_in_the_next_batch() {
    init_tracing();
    let mut registry = SubscriptionRegistry::new(
        CalendarRegistry::new(),
        DataSources::default(),
        RegistrySettings::default(),
    );
    let mut sync = TimeSynchronizer::new(SynchronizerSettings::default());
    let (aaa, feed_a, reader) = registry
        .add_live_feed(SubscriptionDescriptor::new("AAA", Resolution::Minute))
        .unwrap();
    sync.add_stream(aaa, reader);
    let (bbb, feed_b, reader) = registry
        .add_live_feed(SubscriptionDescriptor::new("BBB", Resolution::Minute))
        .unwrap();
    sync.add_stream(bbb.clone(), reader);

    feed_a.send(minute_bar(local(9, 30), dec!(100))).unwrap();
    feed_a.send(minute_bar(local(9, 31), dec!(101))).unwrap();
    for now in [utc(9, 31), utc(9, 32)] {
        let SyncPoll::Batch(batch) = sync.poll(now).unwrap() else {
            panic!("AAA bar ending at {} is due", now);
        };
        assert_eq!(batch.time, now);
    }
    assert!(sync.take_events().is_empty());

    // BBB's first bar shows up after the 09:32 frontier went out
    feed_b.send(minute_bar(local(9, 30), dec!(200))).unwrap();
    let now = utc(9, 32) + Duration::seconds(5);
    let SyncPoll::Batch(batch) = sync.poll(now).unwrap() else {
        panic!("late BBB bar is delivered");
    };

    assert_eq!(batch.time, now);
    assert_eq!(batch.len(), 1);
    let point = &batch.points[&bbb.id][0];
    assert!(point.is_out_of_order);
    assert_eq!(point.end_time, utc(9, 31));
    assert_eq!(sync.last_frontier(), Some(now));
    assert_eq!(sync.stats().out_of_order_points, 1);

    let events = sync.take_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        RunEvent::OutOfOrderData { subscription, symbol, end_time, frontier }
            if *subscription == bbb.id
                && symbol == "BBB"
                && *end_time == utc(9, 31)
                && *frontier == utc(9, 32)
    ));
}
