use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spreadbot_backend::bus::{BusEvent, EventBus};
use spreadbot_backend::engine::{AutoOrderEngine, EngineConfig};
use spreadbot_backend::models::{Config, Venue};
use spreadbot_backend::pairs::PairsFile;
use spreadbot_backend::pricing::PricingService;
use spreadbot_backend::registry::SymbolRegistry;
use spreadbot_backend::store::SqliteTradeStore;
use spreadbot_backend::venue::paper::PaperVenue;
use spreadbot_backend::venue::Venues;

#[derive(Parser)]
#[command(
    name = "spreadbot",
    about = "Cross-exchange arbitrage pricing and auto-order engine"
)]
struct Args {
    /// JSON file describing the arbitrage pairs to watch
    #[arg(long, default_value = "pairs.json")]
    pairs: PathBuf,

    /// Override the database path from the environment
    #[arg(long)]
    database: Option<String>,

    /// Start with auto order management enabled
    #[arg(long)]
    auto: bool,
}

fn venue_min_notional(venue: Venue) -> f64 {
    match venue {
        Venue::Bitrue => 10.0,
        _ => 1.0,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if args.auto {
        config.auto_order_management = true;
    }

    let registry = Arc::new(SymbolRegistry::new());
    let pairs_file = PairsFile::load(&args.pairs)?;
    pairs_file.register(&registry);
    let specs = pairs_file.build_specs(&registry)?;
    info!(pairs = specs.len(), "loaded arbitrage pair configuration");

    let bus = EventBus::default();
    let store = Arc::new(SqliteTradeStore::open(&config.database_path)?);
    let pricing = Arc::new(PricingService::new(bus.clone()));

    // Exchange API connectors are wired in per deployment; this binary runs
    // against in-process simulated venues.
    warn!("running with simulated venue connectors");
    let mut venues = Venues::new();
    let mut seen = HashSet::new();
    for spec in &specs {
        let mut symbols = vec![&spec.sell_symbol, &spec.buy_symbol];
        if let Some(conversion) = &spec.conversion_symbol {
            symbols.push(conversion);
        }
        for symbol in symbols {
            if seen.insert(symbol.venue) {
                venues.register(Arc::new(PaperVenue::with_bus(
                    symbol.venue,
                    venue_min_notional(symbol.venue),
                    bus.clone(),
                )));
            }
        }
        pricing.add_spec(spec.clone());
    }

    let engine = AutoOrderEngine::new(
        EngineConfig::from_config(&config),
        venues,
        Arc::clone(&pricing),
        store,
        bus.clone(),
    );
    engine.set_auto_management(config.auto_order_management);
    let restored = engine.restore()?;
    if restored > 0 {
        info!(restored, "resumed in-flight trades");
    }

    let _pricing_task = pricing.start();
    let _engine_task = engine.start();
    info!("spreadbot running");

    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = rx.recv() => match event {
                Ok(BusEvent::MarketProfitAlert(snapshot)) => {
                    info!(
                        spec = %snapshot.spec.key(),
                        profit = snapshot.profit_at_market,
                        "market profit alert"
                    );
                }
                Ok(BusEvent::LimitProfitAlert(snapshot)) => {
                    info!(
                        spec = %snapshot.spec.key(),
                        profit = snapshot.profit_at_best_price,
                        "best-price profit alert"
                    );
                }
                Ok(BusEvent::TradeDetected(snapshot)) => {
                    info!(
                        spec = %snapshot.spec.key(),
                        magic = snapshot.magic_number.as_deref().unwrap_or(""),
                        "trade launched"
                    );
                }
                Ok(BusEvent::TradeCleared { magic_number }) => {
                    info!(magic = magic_number.as_deref().unwrap_or("all"), "trade cleared");
                }
                Ok(BusEvent::OrderUpdate(order)) => {
                    tracing::debug!(
                        venue = %order.venue,
                        token = %order.token,
                        status = ?order.status,
                        filled = order.filled_quantity,
                        "order update"
                    );
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "main loop lagged behind the event bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}
