use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use clap::Parser;
use rust_decimal_macros::dec;
use std::sync::Arc;
use synctrade::application::market_data::subscription_registry::DataSources;
use synctrade::application::strategies::equal_weighting::EqualWeightingPortfolioConstruction;
use synctrade::application::strategies::immediate_execution::ImmediateExecution;
use synctrade::application::strategies::pipeline::StrategyPipeline;
use synctrade::application::strategies::risk_models::NullRiskManagement;
use synctrade::application::strategies::sma_cross_alpha::SmaCrossAlpha;
use synctrade::application::system::{BacktestEngine, RunContext};
use synctrade::config::Config;
use synctrade::domain::events::LoggingListener;
use synctrade::domain::market::calendar::CalendarRegistry;
use synctrade::domain::market::resolution::Resolution;
use synctrade::domain::market::subscription::{DataKind, SubscriptionDescriptor};
use synctrade::domain::ports::ResultsSink;
use synctrade::domain::strategy::models::AlphaModel;
use synctrade::domain::trading::fee_model::ConstantFeeModel;
use synctrade::infrastructure::data::InMemoryDataSource;
use synctrade::infrastructure::data::synthetic::SyntheticSeries;
use synctrade::infrastructure::observability::EngineMetrics;
use synctrade::infrastructure::results::JsonLinesResultsSink;
use synctrade::infrastructure::simulation::{SimulatedBrokerage, SimulatedBrokerageSettings};
use tracing::info;

/// Replays a synthetic daily series through an SMA crossover strategy.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Symbol of the synthetic series
    #[arg(long, default_value = "SYNTH")]
    symbol: String,

    /// Number of daily bars to generate
    #[arg(long, default_value_t = 500)]
    days: usize,

    /// Seed of the random walk
    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 20)]
    fast: usize,

    #[arg(long, default_value_t = 50)]
    slow: usize,

    /// First session date (YYYY-MM-DD)
    #[arg(long, default_value = "2022-01-03")]
    start: String,

    /// TOML config file; environment variables are used when absent
    #[arg(long)]
    config: Option<String>,

    /// Write equity points and trades as JSON lines
    #[arg(long)]
    results: Option<String>,

    /// Print Prometheus metrics at the end of the run
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path))?;
            Config::from_toml_str(&text)?
        }
        None => Config::from_env()?,
    };
    info!("Backtest: Loaded config {:?}", config);

    let start_date = NaiveDate::parse_from_str(&cli.start, "%Y-%m-%d")
        .context("--start must be YYYY-MM-DD")?;
    let start = Utc.from_utc_datetime(&start_date.and_hms_opt(0, 0, 0).context("invalid start")?);

    let calendars = CalendarRegistry::new();
    let calendar = calendars
        .get("us_equity")
        .context("us_equity calendar missing")?;
    let records = SyntheticSeries::new(cli.seed, 100.0).bars(&calendar, Resolution::Daily, start, cli.days);
    info!("Backtest: Generated {} daily bars for {}", records.len(), cli.symbol);

    let source = InMemoryDataSource::new().with_series(&cli.symbol, Resolution::Daily, DataKind::TradeBar, records);
    let sources = DataSources {
        historical: Some(Arc::new(source)),
        live: None,
    };

    let alphas: Vec<Box<dyn AlphaModel>> = vec![Box::new(SmaCrossAlpha::new(cli.fast, cli.slow)?)];
    let pipeline = StrategyPipeline::new(
        alphas,
        config.pipeline.merge_policy()?,
        Box::new(EqualWeightingPortfolioConstruction::long_only()),
        Box::new(NullRiskManagement),
        Box::new(ImmediateExecution),
    );

    let fees = Arc::new(ConstantFeeModel::new(dec!(0.005), dec!(1)));
    let metrics = EngineMetrics::new()?;
    let mut settings = config.run_settings();
    settings.start = Some(start);

    let mut context = RunContext::new(settings, calendars, sources, pipeline)
        .with_fee_model(fees.clone())
        .with_metrics(metrics.clone());
    if let Some(path) = &cli.results {
        let sink: Arc<dyn ResultsSink> = Arc::new(JsonLinesResultsSink::create(path)?);
        context = context.with_results(sink);
    }
    context.events().subscribe(Arc::new(LoggingListener)).await;
    context.add_subscription(SubscriptionDescriptor::new(&cli.symbol, Resolution::Daily))?;

    let brokerage = SimulatedBrokerage::new(SimulatedBrokerageSettings {
        event_capacity: config.broker.event_queue_capacity,
        ..SimulatedBrokerageSettings::default()
    })
    .with_fee_model(fees);

    let mut engine = BacktestEngine::new(
        context,
        Arc::new(brokerage),
        config.broker.gateway_settings(),
        config.broker.shutdown_settings(),
    );
    let summary = engine.run().await?;

    let portfolio = engine.context().transactions().portfolio();
    info!("Backtest: Summary {:?}", summary);
    info!(
        "Backtest: Cash {} | Equity {} | Realized P&L {} | Fees {}",
        portfolio.cash,
        summary.final_equity,
        portfolio.realized_pnl,
        portfolio.total_fees
    );
    for holding in portfolio.holdings.values() {
        info!(
            "Backtest: Holding {} x {} @ {}",
            holding.symbol, holding.quantity, holding.average_price
        );
    }

    if cli.metrics {
        println!("{}", metrics.render());
    }
    Ok(())
}
