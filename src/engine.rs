//! Auto-order engine: turns profit alerts into paired sell/buy orders and
//! reconciles their fills until both legs balance.
//!
//! Lifecycle of one trade: detected (alert passes the pre-submission
//! recheck) -> both legs placed concurrently -> polled until fills balance
//! -> complete. An unfilled or lopsided trade enters exit mode: open orders
//! are canceled and a corrective order for the leg imbalance is repriced
//! in steps until the configured loss floor, where one final order is
//! placed and the trade is left for the operator.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, EventBus};
use crate::models::{generate_magic_number, now_ms, Config, Order, OrderType, Side};
use crate::pricing::{floor_quantity, normalize_price, ArbitrageSnapshot, PricingService};
use crate::store::{PersistedTrade, TradeStore};
use crate::venue::{OrderRequest, Venues};

/// Fill-quantity comparisons tolerate this much float noise.
const FILL_TOLERANCE: f64 = 1e-5;
/// Attempts per corrective order before giving up on the cycle.
const MAX_PLACEMENT_ATTEMPTS: u32 = 3;
const PLACEMENT_BACKOFF: Duration = Duration::from_secs(1);
/// Order-history queries start this far before the trade's creation time.
const ORDER_LOOKBACK_MS: i64 = 5_000;
/// Repricing step when the corrected leg has no fills yet.
const ADJUSTMENT_STEP_CLEAN: f64 = 0.1;
/// Larger step when the leg already has partial fills and exposure is live.
const ADJUSTMENT_STEP_PARTIAL: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub initial_wait: Duration,
    pub exit_retry_timeout: Duration,
    pub stuck_order_timeout: Duration,
    pub min_profit_percent: f64,
    pub max_loss_percent: f64,
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            initial_wait: Duration::from_secs(config.initial_wait_secs),
            exit_retry_timeout: Duration::from_secs(config.exit_retry_timeout_secs),
            stuck_order_timeout: Duration::from_secs(config.stuck_order_timeout_secs),
            min_profit_percent: config.min_profit_percent,
            max_loss_percent: config.max_loss_percent,
        }
    }
}

/// Mutable reconciliation state for one in-flight trade. Rebuilt from venue
/// order history after a restart; only the snapshot is persisted.
struct TradeTracking {
    sell_orders: Vec<Order>,
    buy_orders: Vec<Order>,
    /// Monotonic: a leg's progress never regresses even if a venue's order
    /// history momentarily under-reports.
    cumulative_sell_filled: f64,
    cumulative_buy_filled: f64,
    is_exiting: bool,
    retry_count: u32,
    price_adjustment_percent: f64,
    initial_profit_percent: f64,
    last_adjusted_sell_price: f64,
    last_adjusted_buy_price: f64,
    last_canceled_sell: Option<Order>,
    last_canceled_buy: Option<Order>,
    started_ms: i64,
    /// Last time an exit-mode adjustment was attempted.
    last_checked_ms: i64,
    /// The loss floor was hit; one final order went out and no further
    /// repricing happens.
    floor_reached: bool,
}

impl TradeTracking {
    fn new(initial_profit_percent: f64) -> Self {
        let now = now_ms();
        Self {
            sell_orders: Vec::new(),
            buy_orders: Vec::new(),
            cumulative_sell_filled: 0.0,
            cumulative_buy_filled: 0.0,
            is_exiting: false,
            retry_count: 0,
            price_adjustment_percent: 0.0,
            initial_profit_percent,
            last_adjusted_sell_price: 0.0,
            last_adjusted_buy_price: 0.0,
            last_canceled_sell: None,
            last_canceled_buy: None,
            started_ms: now,
            last_checked_ms: now,
            floor_reached: false,
        }
    }
}

/// Read-only view of a trade's reconciliation progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeProgress {
    pub cumulative_sell_filled: f64,
    pub cumulative_buy_filled: f64,
    pub is_exiting: bool,
    pub retry_count: u32,
    pub price_adjustment_percent: f64,
    pub floor_reached: bool,
}

/// Step the price adjustment down, clamping so the adjusted profit never
/// drops below the loss floor. Returns the new adjustment and whether the
/// floor was hit.
fn next_adjustment(current: f64, step: f64, initial_profit: f64, max_loss: f64) -> (f64, bool) {
    let stepped = current - step;
    if initial_profit + stepped < max_loss {
        (max_loss - initial_profit, true)
    } else {
        (stepped, false)
    }
}

struct Inner {
    config: EngineConfig,
    venues: Venues,
    pricing: Arc<PricingService>,
    store: Arc<dyn TradeStore>,
    bus: EventBus,
    /// Spec keys currently mid-launch; the dedup guard against alert storms.
    launching: Mutex<HashSet<String>>,
    /// In-flight trades by magic number.
    processing: RwLock<HashMap<String, ArbitrageSnapshot>>,
    tracking: Mutex<HashMap<String, TradeTracking>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    auto_management: AtomicBool,
}

#[derive(Clone)]
pub struct AutoOrderEngine {
    inner: Arc<Inner>,
}

impl AutoOrderEngine {
    pub fn new(
        config: EngineConfig,
        venues: Venues,
        pricing: Arc<PricingService>,
        store: Arc<dyn TradeStore>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                venues,
                pricing,
                store,
                bus,
                launching: Mutex::new(HashSet::new()),
                processing: RwLock::new(HashMap::new()),
                tracking: Mutex::new(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                auto_management: AtomicBool::new(false),
            }),
        }
    }

    pub fn auto_management(&self) -> bool {
        self.inner.auto_management.load(Ordering::SeqCst)
    }

    /// Enable or disable automatic trade management. Enabling resumes
    /// polling for every tracked trade; disabling stops the polling tasks
    /// but keeps the trades tracked and persisted.
    pub fn set_auto_management(&self, enabled: bool) {
        self.inner.auto_management.store(enabled, Ordering::SeqCst);
        info!(enabled, "auto order management toggled");

        if enabled {
            let tracked: Vec<String> = self.inner.processing.read().keys().cloned().collect();
            let missing: Vec<String> = {
                let tasks = self.inner.tasks.lock();
                tracked
                    .into_iter()
                    .filter(|magic| !tasks.contains_key(magic))
                    .collect()
            };
            for magic in missing {
                self.spawn_polling(&magic);
            }
        } else {
            for (_, handle) in self.inner.tasks.lock().drain() {
                handle.abort();
            }
        }
    }

    pub fn processing_snapshots(&self) -> Vec<ArbitrageSnapshot> {
        self.inner.processing.read().values().cloned().collect()
    }

    pub fn progress(&self, magic: &str) -> Option<TradeProgress> {
        let tracking = self.inner.tracking.lock();
        let t = tracking.get(magic)?;
        Some(TradeProgress {
            cumulative_sell_filled: t.cumulative_sell_filled,
            cumulative_buy_filled: t.cumulative_buy_filled,
            is_exiting: t.is_exiting,
            retry_count: t.retry_count,
            price_adjustment_percent: t.price_adjustment_percent,
            floor_reached: t.floor_reached,
        })
    }

    /// Consume profit alerts from the bus until the channel closes.
    pub fn start(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let mut rx = self.inner.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::MarketProfitAlert(snapshot)) => {
                        if !snapshot.spec.auto_order_enabled || !engine.auto_management() {
                            continue;
                        }
                        if let Err(err) = engine.on_profit_alert(snapshot).await {
                            error!(error = %err, "trade launch failed");
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "engine lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Reload persisted trades after a restart and resume polling them if
    /// auto management is on. Returns the number of trades restored.
    pub fn restore(&self) -> Result<usize> {
        let trades = self.inner.store.load_all()?;
        let count = trades.len();

        for trade in trades {
            let initial_profit = trade.snapshot.profit_at_market;
            self.inner
                .pricing
                .mark_processed(&trade.snapshot.spec.key(), &trade.magic_number);
            self.inner
                .processing
                .write()
                .insert(trade.magic_number.clone(), trade.snapshot);
            self.inner
                .tracking
                .lock()
                .insert(trade.magic_number.clone(), TradeTracking::new(initial_profit));
            if self.auto_management() {
                self.spawn_polling(&trade.magic_number);
            }
        }

        if count > 0 {
            info!(count, "restored in-flight trades from store");
        }
        Ok(count)
    }

    /// Launch path for one alert. Public so operators (and tests) can
    /// trigger a launch without going through the bus.
    pub async fn on_profit_alert(&self, snapshot: ArbitrageSnapshot) -> Result<()> {
        let key = snapshot.spec.key();
        {
            let mut launching = self.inner.launching.lock();
            if launching.contains(&key) {
                debug!(spec = %key, "launch already in progress, ignoring alert");
                return Ok(());
            }
            if self
                .inner
                .processing
                .read()
                .values()
                .any(|s| s.spec.key() == key)
            {
                debug!(spec = %key, "pair already has an in-flight trade, ignoring alert");
                return Ok(());
            }
            launching.insert(key.clone());
        }

        let result = self.launch_trade(snapshot).await;
        self.inner.launching.lock().remove(&key);
        result
    }

    async fn launch_trade(&self, snapshot: ArbitrageSnapshot) -> Result<()> {
        let spec = snapshot.spec.clone();
        let spec_key = spec.key();

        let (Some(sell_base), Some(buy_quote)) = (spec.sell_symbol.base(), spec.buy_symbol.quote())
        else {
            bail!("auto orders require spot symbols on both legs: {spec_key}");
        };

        let sell_venue = self.inner.venues.get(spec.sell_symbol.venue)?;
        let buy_venue = self.inner.venues.get(spec.buy_symbol.venue)?;

        // Re-verify against live books; the alert may be stale by now.
        let current = self
            .inner
            .pricing
            .recalculate(&spec_key)
            .with_context(|| format!("pair {spec_key} is no longer registered"))?;
        if current.sell_market_price <= 0.0 || current.buy_market_price <= 0.0 {
            warn!(spec = %spec_key, "no executable prices at launch time, aborting");
            return Ok(());
        }
        if current.profit_at_market < self.inner.config.min_profit_percent {
            info!(
                spec = %spec_key,
                profit = current.profit_at_market,
                required = self.inner.config.min_profit_percent,
                "profit evaporated before submission, aborting"
            );
            return Ok(());
        }

        let sell_quantity = floor_quantity(current.sell_quantity, spec.sell_symbol.lot_size);
        if sell_quantity <= 0.0 {
            warn!(spec = %spec_key, "sell quantity below one lot, aborting");
            return Ok(());
        }
        let buy_quantity =
            floor_quantity(sell_quantity + spec.extra_buy_quantity, spec.buy_symbol.lot_size);
        let sell_price = normalize_price(current.sell_market_price, spec.sell_symbol.tick_size);
        let buy_price = normalize_price(current.buy_market_price, spec.buy_symbol.tick_size);

        // Batch gating: both venues must cover at least one full batch.
        let batch_value = if spec.target_notional_value > 0.0 {
            spec.target_notional_value
        } else {
            buy_price * sell_quantity
        };
        let quote_balance = buy_venue.balance(buy_quote).await?;
        let base_balance = sell_venue.balance(sell_base).await?;
        let quote_batches = (quote_balance.free / batch_value).floor();
        let base_batches = (base_balance.free / sell_quantity).floor();
        if quote_batches < 1.0 || base_batches < 1.0 {
            warn!(
                spec = %spec_key,
                quote_free = quote_balance.free,
                base_free = base_balance.free,
                "insufficient balance for one batch, aborting"
            );
            return Ok(());
        }

        if sell_price * sell_quantity < sell_venue.min_notional()
            || buy_price * buy_quantity < buy_venue.min_notional()
        {
            warn!(spec = %spec_key, "order notional below venue minimum, aborting");
            return Ok(());
        }

        let magic = generate_magic_number();
        info!(
            spec = %spec_key,
            magic = %magic,
            sell_price,
            buy_price,
            sell_quantity,
            buy_quantity,
            profit = current.profit_at_market,
            "launching arbitrage trade"
        );

        let created_at_ms = now_ms();
        let sell_request = OrderRequest {
            symbol: spec.sell_symbol.clone(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: sell_price,
            quantity: sell_quantity,
            client_order_id: magic.clone(),
        };
        let buy_request = OrderRequest {
            symbol: spec.buy_symbol.clone(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: buy_price,
            quantity: buy_quantity,
            client_order_id: magic.clone(),
        };

        let (sell_result, buy_result) = tokio::join!(
            sell_venue.place_order(sell_request),
            buy_venue.place_order(buy_request)
        );
        let (sell_order, buy_order) = match (sell_result, buy_result) {
            (Ok(sell), Ok(buy)) => (sell, buy),
            (Ok(sell), Err(err)) => {
                warn!(magic = %magic, "buy leg rejected, canceling sell leg");
                if let Err(cancel_err) = sell_venue.cancel_order(&sell).await {
                    error!(magic = %magic, error = %cancel_err, "failed to cancel orphaned sell leg");
                }
                return Err(err.context("buy leg rejected"));
            }
            (Err(err), Ok(buy)) => {
                warn!(magic = %magic, "sell leg rejected, canceling buy leg");
                if let Err(cancel_err) = buy_venue.cancel_order(&buy).await {
                    error!(magic = %magic, error = %cancel_err, "failed to cancel orphaned buy leg");
                }
                return Err(err.context("sell leg rejected"));
            }
            (Err(err), Err(_)) => return Err(err.context("both legs rejected")),
        };

        let mut launched = current;
        launched.magic_number = Some(magic.clone());
        launched.is_being_processed = true;
        launched.sell_quantity = sell_quantity;
        launched.created_at_ms = created_at_ms;

        {
            self.inner
                .processing
                .write()
                .insert(magic.clone(), launched.clone());
            let mut tracking = TradeTracking::new(launched.profit_at_market);
            tracking.sell_orders.push(sell_order);
            tracking.buy_orders.push(buy_order);
            self.inner.tracking.lock().insert(magic.clone(), tracking);
        }
        self.inner.pricing.mark_processed(&spec_key, &magic);
        self.persist()?;
        self.inner.bus.publish(BusEvent::TradeDetected(launched));

        if self.auto_management() {
            self.spawn_polling(&magic);
        }
        Ok(())
    }

    /// One reconciliation pass over a tracked trade. The polling task calls
    /// this on every tick; tests call it directly.
    pub async fn run_cycle(&self, magic: &str) -> Result<()> {
        let Some(snapshot) = self.inner.processing.read().get(magic).cloned() else {
            return Ok(());
        };
        let spec = &snapshot.spec;

        let sell_venue = self.inner.venues.get(spec.sell_symbol.venue)?;
        let buy_venue = self.inner.venues.get(spec.buy_symbol.venue)?;

        let since_ms = snapshot.created_at_ms - ORDER_LOOKBACK_MS;
        let sell_orders = sell_venue
            .orders_since(&spec.sell_symbol.token, since_ms, magic)
            .await?;
        let buy_orders = buy_venue
            .orders_since(&spec.buy_symbol.token, since_ms, magic)
            .await?;

        let sell_filled: f64 = sell_orders.iter().map(|o| o.filled_quantity).sum();
        let buy_filled: f64 = buy_orders.iter().map(|o| o.filled_quantity).sum();
        let open_orders: Vec<Order> = sell_orders
            .iter()
            .chain(buy_orders.iter())
            .filter(|o| o.is_open())
            .cloned()
            .collect();

        let (cumulative_sell, cumulative_buy, is_exiting, started_ms, last_checked_ms) = {
            let mut tracking = self.inner.tracking.lock();
            let t = tracking
                .get_mut(magic)
                .with_context(|| format!("no tracking state for trade {magic}"))?;
            t.cumulative_sell_filled = t.cumulative_sell_filled.max(sell_filled);
            t.cumulative_buy_filled = t.cumulative_buy_filled.max(buy_filled);
            t.sell_orders = sell_orders;
            t.buy_orders = buy_orders;
            (
                t.cumulative_sell_filled,
                t.cumulative_buy_filled,
                t.is_exiting,
                t.started_ms,
                t.last_checked_ms,
            )
        };

        let slack = spec.extra_buy_quantity + FILL_TOLERANCE;
        let imbalance = cumulative_buy - cumulative_sell;
        let total_filled = cumulative_buy + cumulative_sell;
        let now = now_ms();

        debug!(
            magic = %magic,
            sell_filled = cumulative_sell,
            buy_filled = cumulative_buy,
            open = open_orders.len(),
            is_exiting,
            "reconciliation cycle"
        );

        if open_orders.is_empty() {
            if imbalance.abs() <= slack {
                info!(
                    magic = %magic,
                    sell_filled = cumulative_sell,
                    buy_filled = cumulative_buy,
                    "trade complete, legs balanced"
                );
                self.remove_trade(magic)?;
                return Ok(());
            }
            self.handle_partial_execution(magic, imbalance).await?;
        } else if total_filled <= FILL_TOLERANCE
            && now - started_ms >= self.inner.config.stuck_order_timeout.as_millis() as i64
        {
            // Safety net regardless of exit mode: orders resting for this
            // long with zero fills on both legs will not converge.
            error!(
                magic = %magic,
                "trade stuck with zero fills past the safety timeout, force-canceling and abandoning"
            );
            self.cancel_orders(magic, &open_orders).await;
            self.remove_trade(magic)?;
            return Ok(());
        } else if !is_exiting {
            let waited =
                now - started_ms >= self.inner.config.initial_wait.as_millis() as i64;
            if waited && (total_filled <= FILL_TOLERANCE || imbalance.abs() > slack) {
                warn!(
                    magic = %magic,
                    total_filled,
                    imbalance,
                    "initial wait elapsed without balanced fills, entering exit mode"
                );
                self.enter_exit_mode(magic, &open_orders).await;
            }
        } else {
            // Exit mode with orders still resting on the venues.
            if now - last_checked_ms
                >= self.inner.config.exit_retry_timeout.as_millis() as i64
            {
                self.cancel_orders(magic, &open_orders).await;
                {
                    let mut tracking = self.inner.tracking.lock();
                    if let Some(t) = tracking.get_mut(magic) {
                        t.last_checked_ms = now;
                    }
                }
                // No corrective here: a fill can land while the cancels
                // resolve, so sizing waits for the next cycle's re-fetch to
                // fold it into the cumulative counters first.
            }
        }

        if let Some(current) = self.inner.processing.read().get(magic).cloned() {
            self.inner.bus.publish(BusEvent::TradeUpdated(current));
        }
        Ok(())
    }

    async fn enter_exit_mode(&self, magic: &str, open_orders: &[Order]) {
        {
            let mut tracking = self.inner.tracking.lock();
            if let Some(t) = tracking.get_mut(magic) {
                t.is_exiting = true;
                t.last_checked_ms = now_ms();
            }
        }
        self.cancel_orders(magic, open_orders).await;
    }

    async fn cancel_orders(&self, magic: &str, orders: &[Order]) {
        for order in orders {
            let connector = match self.inner.venues.get(order.venue) {
                Ok(connector) => connector,
                Err(err) => {
                    error!(magic = %magic, error = %err, "cannot cancel order on unknown venue");
                    continue;
                }
            };
            if let Err(err) = connector.cancel_order(order).await {
                warn!(
                    magic = %magic,
                    order_id = %order.order_id,
                    error = %err,
                    "order cancel failed"
                );
                continue;
            }
            let mut tracking = self.inner.tracking.lock();
            if let Some(t) = tracking.get_mut(magic) {
                match order.side {
                    Side::Sell => t.last_canceled_sell = Some(order.clone()),
                    Side::Buy => t.last_canceled_buy = Some(order.clone()),
                }
            }
        }
    }

    /// All orders are done but the legs are lopsided: place a corrective
    /// order for the imbalance. Positive imbalance means the buy leg is
    /// ahead, so the surplus is sold; negative means the sell leg is ahead,
    /// so the shortfall is bought back.
    async fn handle_partial_execution(&self, magic: &str, imbalance: f64) -> Result<()> {
        let slack = {
            let Some(snapshot) = self.inner.processing.read().get(magic).cloned() else {
                return Ok(());
            };
            snapshot.spec.extra_buy_quantity + FILL_TOLERANCE
        };
        {
            let mut tracking = self.inner.tracking.lock();
            if let Some(t) = tracking.get_mut(magic) {
                t.is_exiting = true;
            }
        }

        if imbalance.abs() <= slack {
            info!(magic = %magic, "legs balanced after cancel, trade complete");
            self.remove_trade(magic)?;
            return Ok(());
        }

        let (side, quantity) = if imbalance > 0.0 {
            (Side::Sell, imbalance)
        } else {
            (Side::Buy, -imbalance)
        };
        info!(
            magic = %magic,
            side = %side,
            quantity,
            "placing corrective order for leg imbalance"
        );
        self.place_matching_order(magic, side, quantity).await
    }

    async fn place_matching_order(&self, magic: &str, side: Side, quantity: f64) -> Result<()> {
        let Some(snapshot) = self.inner.processing.read().get(magic).cloned() else {
            return Ok(());
        };
        let spec = &snapshot.spec;
        let spec_key = spec.key();

        let (adjustment, floored) = {
            let mut tracking = self.inner.tracking.lock();
            let t = tracking
                .get_mut(magic)
                .with_context(|| format!("no tracking state for trade {magic}"))?;
            if t.floor_reached {
                debug!(magic = %magic, "loss floor already reached, not repricing further");
                return Ok(());
            }
            let has_partials = match side {
                Side::Sell => t.cumulative_sell_filled > FILL_TOLERANCE,
                Side::Buy => t.cumulative_buy_filled > FILL_TOLERANCE,
            };
            let step = if has_partials {
                ADJUSTMENT_STEP_PARTIAL
            } else {
                ADJUSTMENT_STEP_CLEAN
            };
            let (adjustment, floored) = next_adjustment(
                t.price_adjustment_percent,
                step,
                t.initial_profit_percent,
                self.inner.config.max_loss_percent,
            );
            t.price_adjustment_percent = adjustment;
            t.floor_reached = floored;
            (adjustment, floored)
        };
        if floored {
            warn!(
                magic = %magic,
                adjustment,
                "loss floor hit, placing one final corrective order"
            );
        }

        let symbol = match side {
            Side::Sell => &spec.sell_symbol,
            Side::Buy => &spec.buy_symbol,
        };
        let connector = self.inner.venues.get(symbol.venue)?;

        for attempt in 1..=MAX_PLACEMENT_ATTEMPTS {
            // Corrective pricing anchors on the current top of book: the ask
            // for a sell, the bid for a buy.
            let books = self.inner.pricing.books_for(&spec_key);
            let mut base_price = match (&books, side) {
                (Some((sell_book, _)), Side::Sell) => {
                    sell_book.best_ask().map(|l| l.price).unwrap_or(0.0)
                }
                (Some((_, buy_book)), Side::Buy) => {
                    buy_book.best_bid().map(|l| l.price).unwrap_or(0.0)
                }
                (None, _) => 0.0,
            };
            if base_price <= 0.0 {
                // No live book: fall back to the last adjusted price, then
                // to the price of the order we last canceled on this leg.
                let tracking = self.inner.tracking.lock();
                if let Some(t) = tracking.get(magic) {
                    let (last_adjusted, last_canceled) = match side {
                        Side::Sell => (t.last_adjusted_sell_price, &t.last_canceled_sell),
                        Side::Buy => (t.last_adjusted_buy_price, &t.last_canceled_buy),
                    };
                    base_price = if last_adjusted > 0.0 {
                        last_adjusted
                    } else {
                        last_canceled.as_ref().map(|o| o.price).unwrap_or(0.0)
                    };
                }
            }
            if base_price <= 0.0 {
                warn!(magic = %magic, attempt, "no reference price for corrective order");
                tokio::time::sleep(PLACEMENT_BACKOFF).await;
                continue;
            }

            let raw_quantity = match side {
                Side::Sell => {
                    let base = symbol
                        .base()
                        .context("corrective sell requires a spot symbol")?;
                    let balance = connector.balance(base).await?;
                    if balance.free + FILL_TOLERANCE < quantity {
                        warn!(
                            magic = %magic,
                            attempt,
                            free = balance.free,
                            needed = quantity,
                            "insufficient base balance for corrective sell"
                        );
                        tokio::time::sleep(PLACEMENT_BACKOFF).await;
                        continue;
                    }
                    quantity
                }
                Side::Buy => {
                    let quote = symbol
                        .quote()
                        .context("corrective buy requires a spot symbol")?;
                    let balance = connector.balance(quote).await?;
                    let batch_value = if spec.target_notional_value > 0.0 {
                        spec.target_notional_value
                    } else {
                        base_price * snapshot.sell_quantity
                    };
                    let batches = (balance.free / batch_value).floor();
                    if batches < 1.0 {
                        warn!(
                            magic = %magic,
                            attempt,
                            free = balance.free,
                            "insufficient quote balance for corrective buy"
                        );
                        tokio::time::sleep(PLACEMENT_BACKOFF).await;
                        continue;
                    }
                    quantity.min(batches * snapshot.sell_quantity)
                }
            };

            let price = normalize_price(base_price * (1.0 + adjustment / 100.0), symbol.tick_size);
            let order_quantity = floor_quantity(raw_quantity, symbol.lot_size);
            if order_quantity <= 0.0 {
                debug!(magic = %magic, "corrective quantity below one lot, nothing to do");
                return Ok(());
            }
            if price * order_quantity < connector.min_notional() {
                warn!(
                    magic = %magic,
                    notional = price * order_quantity,
                    minimum = connector.min_notional(),
                    "corrective order below venue minimum notional, leaving trade for the operator"
                );
                return Ok(());
            }

            let retry_count = {
                let mut tracking = self.inner.tracking.lock();
                let t = tracking
                    .get_mut(magic)
                    .with_context(|| format!("no tracking state for trade {magic}"))?;
                t.retry_count += 1;
                t.retry_count
            };
            let client_order_id = format!("{magic}-retry-{retry_count}");

            match connector
                .place_order(OrderRequest {
                    symbol: symbol.clone(),
                    side,
                    order_type: OrderType::Limit,
                    price,
                    quantity: order_quantity,
                    client_order_id,
                })
                .await
            {
                Ok(order) => {
                    info!(
                        magic = %magic,
                        side = %side,
                        price,
                        quantity = order_quantity,
                        adjustment,
                        "corrective order placed"
                    );
                    let mut tracking = self.inner.tracking.lock();
                    if let Some(t) = tracking.get_mut(magic) {
                        match side {
                            Side::Sell => {
                                t.last_adjusted_sell_price = price;
                                t.sell_orders.push(order);
                            }
                            Side::Buy => {
                                t.last_adjusted_buy_price = price;
                                t.buy_orders.push(order);
                            }
                        }
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        magic = %magic,
                        attempt,
                        error = %err,
                        "corrective order rejected"
                    );
                    tokio::time::sleep(PLACEMENT_BACKOFF).await;
                }
            }
        }

        error!(
            magic = %magic,
            "corrective order placement exhausted all attempts, trade stays tracked"
        );
        Ok(())
    }

    /// Cancel every open order across all tracked trades and forget them.
    pub async fn clear_all(&self) -> Result<()> {
        let open: Vec<Order> = {
            let tracking = self.inner.tracking.lock();
            tracking
                .values()
                .flat_map(|t| t.sell_orders.iter().chain(t.buy_orders.iter()))
                .filter(|o| o.is_open())
                .cloned()
                .collect()
        };
        self.cancel_orders("all", &open).await;

        let spec_keys: Vec<String> = self
            .inner
            .processing
            .read()
            .values()
            .map(|s| s.spec.key())
            .collect();
        for key in spec_keys {
            self.inner.pricing.mark_cleared(&key);
        }

        self.inner.processing.write().clear();
        self.inner.tracking.lock().clear();
        for (_, handle) in self.inner.tasks.lock().drain() {
            handle.abort();
        }
        self.inner.store.clear()?;
        self.inner
            .bus
            .publish(BusEvent::TradeCleared { magic_number: None });
        info!("cleared all tracked trades");
        Ok(())
    }

    fn remove_trade(&self, magic: &str) -> Result<()> {
        let removed = self.inner.processing.write().remove(magic);
        self.inner.tracking.lock().remove(magic);
        if let Some(snapshot) = removed {
            self.inner.pricing.mark_cleared(&snapshot.spec.key());
        }
        self.persist()?;
        self.inner.bus.publish(BusEvent::TradeCleared {
            magic_number: Some(magic.to_string()),
        });
        // Abort last: when called from inside the polling task this cancels
        // the task at its next await, after the state is already saved.
        if let Some(handle) = self.inner.tasks.lock().remove(magic) {
            handle.abort();
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        let mut trades: Vec<PersistedTrade> = self
            .inner
            .processing
            .read()
            .iter()
            .map(|(magic, snapshot)| PersistedTrade {
                magic_number: magic.clone(),
                snapshot: snapshot.clone(),
            })
            .collect();
        trades.sort_by(|a, b| a.snapshot.created_at_ms.cmp(&b.snapshot.created_at_ms));
        self.inner.store.save_all(&trades)
    }

    fn spawn_polling(&self, magic: &str) {
        let engine = self.clone();
        let magic_owned = magic.to_string();
        let interval = self.inner.config.poll_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if !engine.inner.processing.read().contains_key(&magic_owned) {
                    break;
                }
                if let Err(err) = engine.run_cycle(&magic_owned).await {
                    error!(magic = %magic_owned, error = %err, "reconciliation cycle failed");
                }
            }
        });
        self.inner.tasks.lock().insert(magic.to_string(), handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{DepthBook, DepthLevel};
    use crate::models::{SymbolMeta, Venue};
    use crate::pricing::ArbitrageSpec;
    use crate::store::MemoryTradeStore;
    use crate::venue::paper::PaperVenue;
    use crate::venue::VenueConnector;

    fn spec() -> ArbitrageSpec {
        ArbitrageSpec {
            sell_symbol: SymbolMeta::spot(Venue::GateIo, "XDCUSDT", "XDC", "USDT", 1.0, 0.00001, 5),
            buy_symbol: SymbolMeta::spot(Venue::Bitrue, "XDCUSDT", "XDC", "USDT", 1.0, 0.00001, 5),
            conversion_symbol: None,
            sell_quantity: 100.0,
            buy_quantity: 100.0,
            conversion_quantity: 0.0,
            target_alert_at_market: 0.5,
            target_alert_at_best_sell: 3.0,
            market_alert_enabled: true,
            limit_alert_enabled: false,
            auto_order_enabled: true,
            extra_buy_quantity: 0.0,
            target_notional_value: 0.0,
        }
    }

    struct Harness {
        engine: AutoOrderEngine,
        pricing: Arc<PricingService>,
        sell_venue: Arc<PaperVenue>,
        buy_venue: Arc<PaperVenue>,
        store: Arc<MemoryTradeStore>,
        bus: EventBus,
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(50),
            initial_wait: Duration::ZERO,
            exit_retry_timeout: Duration::ZERO,
            stuck_order_timeout: Duration::from_secs(300),
            min_profit_percent: 0.2,
            max_loss_percent: -0.2,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let bus = EventBus::new(64);
        let pricing = Arc::new(PricingService::new(bus.clone()));
        pricing.add_spec(spec());

        let sell_venue = Arc::new(PaperVenue::new(Venue::GateIo, 1.0));
        let buy_venue = Arc::new(PaperVenue::new(Venue::Bitrue, 1.0));
        sell_venue.set_balance("XDC", 100_000.0, 0.0);
        buy_venue.set_balance("USDT", 10_000.0, 0.0);

        let mut venues = Venues::new();
        venues.register(sell_venue.clone());
        venues.register(buy_venue.clone());

        let store = Arc::new(MemoryTradeStore::new());
        let engine = AutoOrderEngine::new(config, venues, pricing.clone(), store.clone(), bus.clone());
        Harness {
            engine,
            pricing,
            sell_venue,
            buy_venue,
            store,
            bus,
        }
    }

    fn book(key: &str, bids: &[(f64, f64)], asks: &[(f64, f64)]) -> DepthBook {
        DepthBook::new(
            key,
            bids.iter().map(|&(p, q)| DepthLevel::new(p, q, 1)).collect(),
            asks.iter().map(|&(p, q)| DepthLevel::new(p, q, 1)).collect(),
        )
    }

    /// 2% spread: sell leg bids 0.0510, buy leg asks 0.0500.
    fn feed_profitable_books(pricing: &PricingService) {
        pricing.on_depth_update(book(
            "gateio-XDCUSDT",
            &[(0.0510, 500.0)],
            &[(0.0511, 500.0)],
        ));
        pricing.on_depth_update(book("bitrue-XDCUSDT", &[(0.0499, 500.0)], &[(0.0500, 500.0)]));
    }

    async fn launch(h: &Harness) -> String {
        feed_profitable_books(&h.pricing);
        let alert = h.pricing.snapshots().pop().unwrap();
        h.engine.on_profit_alert(alert).await.unwrap();
        h.engine
            .processing_snapshots()
            .pop()
            .expect("trade should be processing")
            .magic_number
            .expect("processing trade must carry a magic number")
    }

    #[test]
    fn adjustment_steps_and_clamps_at_loss_floor() {
        // Clean leg: 0.1 steps, far from the floor.
        let (a, floored) = next_adjustment(0.0, 0.1, 0.5, -0.2);
        assert!((a + 0.1).abs() < 1e-9);
        assert!(!floored);

        // Exactly at the floor is allowed.
        let (a, floored) = next_adjustment(-0.6, 0.1, 0.5, -0.2);
        assert!((a + 0.7).abs() < 1e-9);
        assert!(!floored);

        // A step past the floor clamps to it and flags the stop.
        let (a, floored) = next_adjustment(-0.65, 0.2, 0.5, -0.2);
        assert!((a + 0.7).abs() < 1e-9);
        assert!(floored);
    }

    #[tokio::test]
    async fn alert_launches_both_legs() {
        let h = harness();
        let magic = launch(&h).await;

        let sell = h.sell_venue.order(&magic).expect("sell leg placed");
        let buy = h.buy_venue.order(&magic).expect("buy leg placed");
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.quantity, 100.0);
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.quantity, 100.0);
        assert_eq!(h.store.load_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_alert_is_ignored_while_processing() {
        let h = harness();
        launch(&h).await;

        let alert = h.pricing.snapshots().pop().unwrap();
        h.engine.on_profit_alert(alert).await.unwrap();

        let all = h
            .sell_venue
            .orders_since("XDCUSDT", 0, "t-")
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(h.engine.processing_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn launch_aborts_when_profit_evaporates() {
        let h = harness();
        feed_profitable_books(&h.pricing);
        let stale_alert = h.pricing.snapshots().pop().unwrap();

        // Spread collapses to zero before the alert is acted on.
        h.pricing
            .on_depth_update(book("gateio-XDCUSDT", &[(0.0500, 500.0)], &[(0.0501, 500.0)]));

        h.engine.on_profit_alert(stale_alert).await.unwrap();
        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.sell_venue.order("t-").is_none());
        assert!(h.sell_venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn launch_aborts_without_one_full_batch() {
        let h = harness();
        // Buy notional per batch is 100 * 0.05 = 5 USDT; 1 is not enough.
        h.buy_venue.set_balance("USDT", 1.0, 0.0);

        feed_profitable_books(&h.pricing);
        let alert = h.pricing.snapshots().pop().unwrap();
        h.engine.on_profit_alert(alert).await.unwrap();

        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.buy_venue.open_orders().is_empty());
    }

    #[tokio::test]
    async fn rejected_leg_cancels_its_sibling() {
        let h = harness();
        h.buy_venue.fail_next_place();

        feed_profitable_books(&h.pricing);
        let alert = h.pricing.snapshots().pop().unwrap();
        assert!(h.engine.on_profit_alert(alert).await.is_err());

        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.sell_venue.open_orders().is_empty());
        assert!(h.store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn balanced_fills_complete_the_trade() {
        let h = harness();
        let magic = launch(&h).await;
        let mut rx = h.bus.subscribe();

        h.sell_venue.fill(&magic, 100.0);
        h.buy_venue.fill(&magic, 100.0);
        h.engine.run_cycle(&magic).await.unwrap();

        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.store.load_all().unwrap().is_empty());
        loop {
            match rx.recv().await.unwrap() {
                BusEvent::TradeCleared { magic_number } => {
                    assert_eq!(magic_number.as_deref(), Some(magic.as_str()));
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn leg_imbalance_places_corrective_sell() {
        let h = harness();
        let magic = launch(&h).await;

        // Buy leg fills completely, sell leg only 70 of 100 before both
        // orders go off the book.
        h.buy_venue.fill(&magic, 100.0);
        h.sell_venue.fill(&magic, 70.0);
        let resting = h.sell_venue.order(&magic).unwrap();
        h.sell_venue.cancel_order(&resting).await.unwrap();

        h.engine.run_cycle(&magic).await.unwrap();

        // The sell leg has partial fills, so the first adjustment is -0.2%.
        let corrective = h
            .sell_venue
            .order(&format!("{magic}-retry-1"))
            .expect("corrective sell placed");
        assert_eq!(corrective.side, Side::Sell);
        assert_eq!(corrective.quantity, 30.0);
        // Best ask 0.0511 discounted by 0.2%.
        assert!((corrective.price - 0.05100).abs() < 1e-9);

        let progress = h.engine.progress(&magic).unwrap();
        assert!(progress.is_exiting);
        assert_eq!(progress.cumulative_sell_filled, 70.0);
        assert_eq!(progress.cumulative_buy_filled, 100.0);
        assert_eq!(progress.retry_count, 1);
        assert!((progress.price_adjustment_percent + 0.2).abs() < 1e-9);
        // Still tracked until the corrective order fills.
        assert_eq!(h.engine.processing_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn corrective_fill_completes_the_trade() {
        let h = harness();
        let magic = launch(&h).await;

        h.buy_venue.fill(&magic, 100.0);
        h.sell_venue.fill(&magic, 70.0);
        let resting = h.sell_venue.order(&magic).unwrap();
        h.sell_venue.cancel_order(&resting).await.unwrap();
        h.engine.run_cycle(&magic).await.unwrap();

        h.sell_venue.fill(&format!("{magic}-retry-1"), 30.0);
        h.engine.run_cycle(&magic).await.unwrap();

        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.store.load_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exit_mode_cancel_defers_corrective_to_next_cycle() {
        let h = harness();
        let magic = launch(&h).await;

        // Reach exit mode with a resting corrective: buy leg done, sell leg
        // stops at 70 and goes off the book.
        h.buy_venue.fill(&magic, 100.0);
        h.sell_venue.fill(&magic, 70.0);
        let resting = h.sell_venue.order(&magic).unwrap();
        h.sell_venue.cancel_order(&resting).await.unwrap();
        h.engine.run_cycle(&magic).await.unwrap();
        let retry1 = format!("{magic}-retry-1");
        assert!(h.sell_venue.order(&retry1).is_some());

        // Part of the corrective fills just as the retry timeout cancels it.
        h.sell_venue.fill(&retry1, 10.0);
        h.engine.run_cycle(&magic).await.unwrap();

        // The canceling cycle must not size a corrective from stale fills.
        assert!(h.sell_venue.order(&format!("{magic}-retry-2")).is_none());
        assert!(h.sell_venue.open_orders().is_empty());

        // The next cycle folds the cancel-time fill and corrects the rest.
        h.engine.run_cycle(&magic).await.unwrap();
        let retry2 = h
            .sell_venue
            .order(&format!("{magic}-retry-2"))
            .expect("re-sized corrective placed");
        assert_eq!(retry2.quantity, 20.0);
        assert_eq!(
            h.engine.progress(&magic).unwrap().cumulative_sell_filled,
            80.0
        );
    }

    #[tokio::test]
    async fn floored_corrective_is_final() {
        // Loss floor just under the 2% launch profit, so the first
        // repricing step already clamps.
        let mut config = test_config();
        config.max_loss_percent = 1.9;
        let h = harness_with(config);
        let magic = launch(&h).await;

        h.buy_venue.fill(&magic, 100.0);
        h.sell_venue.fill(&magic, 70.0);
        let resting = h.sell_venue.order(&magic).unwrap();
        h.sell_venue.cancel_order(&resting).await.unwrap();
        h.engine.run_cycle(&magic).await.unwrap();

        let corrective = h
            .sell_venue
            .order(&format!("{magic}-retry-1"))
            .expect("floored corrective placed");
        let progress = h.engine.progress(&magic).unwrap();
        assert!(progress.floor_reached);
        // Clamped to the floor: 1.9 - 2.0 = -0.1, not the full -0.2 step.
        assert!((progress.price_adjustment_percent + 0.1).abs() < 1e-6);

        // The floored order never fills; later cycles must not reprice.
        h.sell_venue.cancel_order(&corrective).await.unwrap();
        h.engine.run_cycle(&magic).await.unwrap();
        h.engine.run_cycle(&magic).await.unwrap();

        assert!(h.sell_venue.order(&format!("{magic}-retry-2")).is_none());
        let progress = h.engine.progress(&magic).unwrap();
        assert_eq!(progress.retry_count, 1);
        // The imbalance stays tracked for the operator.
        assert_eq!(h.engine.processing_snapshots().len(), 1);
    }

    #[tokio::test]
    async fn zero_fills_enter_exit_mode_and_cancel() {
        let h = harness();
        let magic = launch(&h).await;

        // Initial wait is zero in the test config, so the first cycle with
        // no fills flips straight into exit mode.
        h.engine.run_cycle(&magic).await.unwrap();

        assert!(h.engine.progress(&magic).unwrap().is_exiting);
        assert!(h.sell_venue.open_orders().is_empty());
        assert!(h.buy_venue.open_orders().is_empty());
        // Both legs are at zero, so no corrective order goes out yet.
        assert!(h.sell_venue.order(&format!("{magic}-retry-1")).is_none());
        assert!(h.buy_venue.order(&format!("{magic}-retry-1")).is_none());

        // Nothing filled on either leg, so the next cycle closes it out.
        h.engine.run_cycle(&magic).await.unwrap();
        assert!(h.engine.processing_snapshots().is_empty());
    }

    #[tokio::test]
    async fn restore_resumes_persisted_trades() {
        let h = harness();
        let magic = launch(&h).await;

        // Fresh engine sharing only the store, as after a process restart.
        let bus = EventBus::new(64);
        let pricing = Arc::new(PricingService::new(bus.clone()));
        pricing.add_spec(spec());
        let mut venues = Venues::new();
        venues.register(h.sell_venue.clone());
        venues.register(h.buy_venue.clone());
        let restarted = AutoOrderEngine::new(
            EngineConfig {
                poll_interval: Duration::from_millis(50),
                initial_wait: Duration::ZERO,
                exit_retry_timeout: Duration::ZERO,
                stuck_order_timeout: Duration::from_secs(300),
                min_profit_percent: 0.2,
                max_loss_percent: -0.2,
            },
            venues,
            pricing,
            h.store.clone(),
            bus,
        );

        assert_eq!(restarted.restore().unwrap(), 1);
        let snapshots = restarted.processing_snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].magic_number.as_deref(), Some(magic.as_str()));

        // The restored trade reconciles from venue order history.
        h.sell_venue.fill(&magic, 100.0);
        h.buy_venue.fill(&magic, 100.0);
        restarted.run_cycle(&magic).await.unwrap();
        assert!(restarted.processing_snapshots().is_empty());
    }

    #[tokio::test]
    async fn clear_all_cancels_and_forgets() {
        let h = harness();
        launch(&h).await;
        let mut rx = h.bus.subscribe();

        h.engine.clear_all().await.unwrap();

        assert!(h.engine.processing_snapshots().is_empty());
        assert!(h.store.load_all().unwrap().is_empty());
        assert!(h.sell_venue.open_orders().is_empty());
        assert!(h.buy_venue.open_orders().is_empty());
        assert!(matches!(
            rx.recv().await.unwrap(),
            BusEvent::TradeCleared { magic_number: None }
        ));

        // The pair is free to be traded again.
        let alert = h.pricing.snapshots().pop().unwrap();
        h.engine.on_profit_alert(alert).await.unwrap();
        assert_eq!(h.engine.processing_snapshots().len(), 1);
    }
}
