//! Depth-weighted pricing and profit calculation.
//!
//! Turns raw depth snapshots into executable prices and profit percentages
//! for each configured arbitrage pair, optionally through a currency
//! conversion leg, and raises profit alerts on the bus.

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::book::DepthBook;
use crate::bus::{BusEvent, EventBus};
use crate::models::{generate_magic_number, now_ms, OrderType, Side, SymbolKind, SymbolMeta};
use crate::venue::{OrderRequest, Venues};

/// Decimal places implied by a venue lot size (0.01 lot -> 2 places).
pub fn lot_decimals(lot_size: f64) -> u32 {
    if lot_size <= 0.0 {
        return 0;
    }
    let places = (1.0 / lot_size).log10();
    if places <= 0.0 {
        0
    } else {
        places.round() as u32
    }
}

/// Decimal places implied by a venue tick size (0.0001 tick -> 4 places).
pub fn tick_decimals(tick_size: f64) -> u32 {
    if tick_size <= 0.0 {
        return 0;
    }
    let places = -tick_size.log10();
    if places <= 0.0 {
        0
    } else {
        places.ceil() as u32
    }
}

fn pow10(decimals: u32) -> f64 {
    10f64.powi(decimals as i32)
}

/// Round a quantity to the lot-size precision. Used for display and
/// notional math only.
pub fn round_quantity(quantity: f64, lot_size: f64) -> f64 {
    let factor = pow10(lot_decimals(lot_size));
    (quantity * factor).round() / factor
}

/// Truncate a quantity to the lot-size precision. Always used before order
/// submission so a rounding error can never over-commit the position.
pub fn floor_quantity(quantity: f64, lot_size: f64) -> f64 {
    let factor = pow10(lot_decimals(lot_size));
    (quantity * factor).floor() / factor
}

/// Round a price to the tick-size precision.
pub fn normalize_price(price: f64, tick_size: f64) -> f64 {
    if price <= 0.0 || tick_size <= 0.0 {
        return price;
    }
    let factor = pow10(tick_decimals(tick_size));
    (price * factor).round() / factor
}

/// Immutable configuration for one directed arbitrage pair: sell on one
/// venue, buy the same asset back on another, optionally bridging quote
/// currencies through a conversion symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageSpec {
    pub sell_symbol: SymbolMeta,
    pub buy_symbol: SymbolMeta,
    pub conversion_symbol: Option<SymbolMeta>,
    pub sell_quantity: f64,
    pub buy_quantity: f64,
    pub conversion_quantity: f64,
    /// Market-profit alert threshold, percent
    pub target_alert_at_market: f64,
    /// Best-price-profit alert threshold, percent
    pub target_alert_at_best_sell: f64,
    pub market_alert_enabled: bool,
    pub limit_alert_enabled: bool,
    /// When set, alerts feed the auto-order engine
    pub auto_order_enabled: bool,
    /// Deliberate buy-side slack tolerated when judging leg balance
    pub extra_buy_quantity: f64,
    /// Per-batch notional cap; 0 disables quantity re-derivation
    pub target_notional_value: f64,
}

impl ArbitrageSpec {
    /// Identity of this pair across the system; the dedup key for launches.
    pub fn key(&self) -> String {
        match &self.conversion_symbol {
            Some(conv) => format!(
                "{}-{}-{}",
                self.sell_symbol.unique_key(),
                self.buy_symbol.unique_key(),
                conv.unique_key()
            ),
            None => format!(
                "{}-{}",
                self.sell_symbol.unique_key(),
                self.buy_symbol.unique_key()
            ),
        }
    }
}

/// Live calculation state for one spec, recomputed on every relevant depth
/// update. A plain value type: launching a trade clones it, insulating the
/// in-flight execution from further market movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageSnapshot {
    pub spec: ArbitrageSpec,
    /// Effective sell quantity; re-derived when a notional cap is set
    pub sell_quantity: f64,
    pub buy_quantity: f64,
    pub sell_market_price: f64,
    pub buy_market_price: f64,
    /// Top-of-book sell discounted by one tick (maker assumption)
    pub best_sell_price: f64,
    pub conversion_buy_price: f64,
    pub conversion_premium_percent: f64,
    pub profit_at_market: f64,
    pub profit_at_best_price: f64,
    /// Assigned once, at the moment a trade is actually launched
    pub magic_number: Option<String>,
    pub is_being_processed: bool,
    pub created_at_ms: i64,
}

impl ArbitrageSnapshot {
    pub fn from_spec(spec: ArbitrageSpec) -> Self {
        let sell_quantity = spec.sell_quantity;
        let buy_quantity = spec.buy_quantity;
        Self {
            spec,
            sell_quantity,
            buy_quantity,
            sell_market_price: 0.0,
            buy_market_price: 0.0,
            best_sell_price: 0.0,
            conversion_buy_price: 0.0,
            conversion_premium_percent: 0.0,
            profit_at_market: 0.0,
            profit_at_best_price: 0.0,
            magic_number: None,
            is_being_processed: false,
            created_at_ms: now_ms(),
        }
    }

    /// Recompute executable prices and profit figures from the given books.
    ///
    /// Aborts early (leaving prior values untouched) whenever a required
    /// price resolves to 0, i.e. the book has no usable depth yet.
    pub fn calculate(
        &mut self,
        sell_book: &DepthBook,
        buy_book: &DepthBook,
        conversion_book: Option<&DepthBook>,
    ) {
        let conversion_symbol = self.spec.conversion_symbol.clone();
        match (conversion_symbol, conversion_book) {
            (Some(conversion), Some(book)) => {
                self.calculate_with_conversion(conversion, sell_book, buy_book, book)
            }
            // Conversion configured but no snapshot received yet.
            (Some(_), None) => {}
            (None, _) => self.calculate_direct(sell_book, buy_book),
        }
    }

    fn calculate_direct(&mut self, sell_book: &DepthBook, buy_book: &DepthBook) {
        let mut sell_price = sell_book.executable_price(Side::Sell, self.sell_quantity);
        if sell_price <= 0.0 {
            return;
        }

        // Re-derive the sell quantity from the configured notional cap, then
        // re-price at the new depth.
        let notional = self.spec.target_notional_value;
        if notional > 0.0 {
            self.sell_quantity = notional / sell_price;
            sell_price = sell_book.executable_price(Side::Sell, self.sell_quantity);
            self.sell_quantity = round_quantity(self.sell_quantity, self.spec.sell_symbol.lot_size);
        }

        let buy_price = buy_book.executable_price(Side::Buy, self.buy_quantity);
        if buy_price <= 0.0 {
            return;
        }

        // The buy leg may be more expensive than the sell leg priced the
        // batch at; shrink once more so the buy notional stays under the cap.
        if notional > 0.0 && self.sell_quantity * buy_price > notional {
            self.sell_quantity =
                round_quantity(notional / buy_price, self.spec.sell_symbol.lot_size);
        }

        if let Some(best_ask) = sell_book.best_ask() {
            if best_ask.price > 0.0 {
                self.best_sell_price = best_ask.price - self.spec.sell_symbol.tick_size;
            }
        }

        self.sell_market_price = sell_price;
        self.buy_market_price = buy_price;
        self.profit_at_market = (sell_price - buy_price) / buy_price * 100.0;
        self.profit_at_best_price = (self.best_sell_price - buy_price) / buy_price * 100.0;
    }

    fn calculate_with_conversion(
        &mut self,
        conversion: SymbolMeta,
        sell_book: &DepthBook,
        buy_book: &DepthBook,
        conversion_book: &DepthBook,
    ) {
        let (SymbolKind::Spot { base: conv_base, quote: conv_quote },
             SymbolKind::Spot { quote: sell_quote, .. },
             SymbolKind::Spot { quote: buy_quote, .. }) = (
            &conversion.kind,
            &self.spec.sell_symbol.kind,
            &self.spec.buy_symbol.kind,
        ) else {
            error!(spec = %self.spec.key(), "invalid arbitrage configuration: conversion legs must be spot pairs");
            return;
        };

        if conv_base == buy_quote && conv_quote == sell_quote {
            // The conversion bridges the buy-leg quote currency into the
            // sell-leg quote currency; its buy price is a percentage premium
            // on the spread.
            let conversion_price =
                conversion_book.executable_price(Side::Buy, self.spec.conversion_quantity);
            if conversion_price <= 0.0 {
                return;
            }
            self.conversion_buy_price = conversion_price;
            self.conversion_premium_percent = (conversion_price - 1.0) * 100.0;

            let sell_price = sell_book.executable_price(Side::Sell, self.sell_quantity);
            if sell_price <= 0.0 {
                return;
            }
            let buy_price = buy_book.executable_price(Side::Buy, self.buy_quantity);
            if buy_price <= 0.0 {
                return;
            }

            if let Some(best_ask) = sell_book.best_ask() {
                if best_ask.price > 0.0 {
                    self.best_sell_price = best_ask.price - self.spec.sell_symbol.tick_size;
                }
            }

            self.sell_market_price = sell_price;
            self.buy_market_price = buy_price;
            self.profit_at_market = (sell_price - buy_price) / buy_price * 100.0
                - self.conversion_premium_percent;
            self.profit_at_best_price = (self.best_sell_price - buy_price) / buy_price * 100.0
                - self.conversion_premium_percent;
        } else if conv_base == sell_quote && conv_quote == buy_quote {
            // The sell leg proceeds are converted through the conversion
            // symbol into the buy-leg quote currency; compare notionals.
            let sell_price = sell_book.executable_price(Side::Sell, self.sell_quantity);
            if sell_price <= 0.0 {
                return;
            }
            let sell_value = sell_price * self.sell_quantity;

            let conversion_price =
                conversion_book.executable_price(Side::Sell, self.spec.conversion_quantity);
            if conversion_price <= 0.0 {
                return;
            }
            self.conversion_buy_price = conversion_price;
            let converted_value = sell_value * conversion_price;

            let buy_price = buy_book.executable_price(Side::Buy, self.buy_quantity);
            if buy_price <= 0.0 {
                return;
            }
            let buy_value = buy_price * self.sell_quantity;

            self.sell_market_price = sell_price;
            self.buy_market_price = buy_price;
            self.profit_at_market = (converted_value - buy_value) / buy_value * 100.0;
        } else {
            error!(
                spec = %self.spec.key(),
                conversion = %conversion.token,
                "invalid arbitrage configuration: conversion symbol bridges neither quote currency"
            );
        }
    }
}

struct PairState {
    snapshot: ArbitrageSnapshot,
    sell_book: DepthBook,
    buy_book: DepthBook,
    conversion_book: Option<DepthBook>,
}

/// Holds live calculation state for every configured pair, consumes depth
/// updates and raises profit alerts on the bus.
pub struct PricingService {
    pairs: RwLock<Vec<PairState>>,
    bus: EventBus,
}

impl PricingService {
    pub fn new(bus: EventBus) -> Self {
        Self {
            pairs: RwLock::new(Vec::new()),
            bus,
        }
    }

    pub fn add_spec(&self, spec: ArbitrageSpec) {
        let sell_key = spec.sell_symbol.unique_key();
        let buy_key = spec.buy_symbol.unique_key();
        let conversion_book = spec
            .conversion_symbol
            .as_ref()
            .map(|conv| DepthBook::empty(conv.unique_key()));
        info!(spec = %spec.key(), "registered arbitrage pair");
        self.pairs.write().push(PairState {
            snapshot: ArbitrageSnapshot::from_spec(spec),
            sell_book: DepthBook::empty(sell_key),
            buy_book: DepthBook::empty(buy_key),
            conversion_book,
        });
    }

    pub fn snapshots(&self) -> Vec<ArbitrageSnapshot> {
        self.pairs
            .read()
            .iter()
            .map(|pair| pair.snapshot.clone())
            .collect()
    }

    /// Replace the matching book(s) wholesale and recompute every pair the
    /// symbol participates in. Returns the alerts raised, already published
    /// on the bus.
    pub fn on_depth_update(&self, book: DepthBook) {
        let mut alerts = Vec::new();
        {
            let mut pairs = self.pairs.write();
            for pair in pairs.iter_mut() {
                let mut updated = false;

                if pair.sell_book.symbol_key == book.symbol_key {
                    pair.sell_book = book.clone();
                    updated = true;
                }
                if pair.buy_book.symbol_key == book.symbol_key {
                    pair.buy_book = book.clone();
                    updated = true;
                }
                if let Some(conversion) = pair.conversion_book.as_mut() {
                    if conversion.symbol_key == book.symbol_key {
                        *conversion = book.clone();
                        updated = true;
                    }
                }

                if updated {
                    pair.snapshot.calculate(
                        &pair.sell_book,
                        &pair.buy_book,
                        pair.conversion_book.as_ref(),
                    );
                    alerts.extend(raise_alerts(&pair.snapshot));
                }
            }
        }
        for alert in alerts {
            self.bus.publish(alert);
        }
    }

    /// Consume depth updates from the bus until the channel closes.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BusEvent::DepthUpdate(book)) => service.on_depth_update(book),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "pricing service lagged behind the depth feed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Recompute one pair from its current books and return the result.
    /// The engine calls this immediately before committing capital, so a
    /// stale alert can never launch a trade at vanished prices.
    pub fn recalculate(&self, spec_key: &str) -> Option<ArbitrageSnapshot> {
        let mut pairs = self.pairs.write();
        let pair = pairs.iter_mut().find(|p| p.snapshot.spec.key() == spec_key)?;
        pair.snapshot
            .calculate(&pair.sell_book, &pair.buy_book, pair.conversion_book.as_ref());
        Some(pair.snapshot.clone())
    }

    /// Flag the live pair as having an in-flight trade.
    pub fn mark_processed(&self, spec_key: &str, magic_number: &str) {
        let mut pairs = self.pairs.write();
        if let Some(pair) = pairs.iter_mut().find(|p| p.snapshot.spec.key() == spec_key) {
            pair.snapshot.is_being_processed = true;
            pair.snapshot.magic_number = Some(magic_number.to_string());
        }
    }

    /// Clear the in-flight flag once the trade completes or is abandoned.
    pub fn mark_cleared(&self, spec_key: &str) {
        let mut pairs = self.pairs.write();
        if let Some(pair) = pairs.iter_mut().find(|p| p.snapshot.spec.key() == spec_key) {
            pair.snapshot.is_being_processed = false;
            pair.snapshot.magic_number = None;
        }
    }

    /// Clone the current sell/buy books for a spec, for corrective pricing.
    pub fn books_for(&self, spec_key: &str) -> Option<(DepthBook, DepthBook)> {
        let pairs = self.pairs.read();
        let pair = pairs.iter().find(|p| p.snapshot.spec.key() == spec_key)?;
        Some((pair.sell_book.clone(), pair.buy_book.clone()))
    }

    /// Operator pass-through: place a maker sell at one tick inside the best
    /// ask, tagged with the pair's magic number (a fresh one if none yet).
    pub async fn place_limit_order(&self, venues: &Venues, spec_key: &str) -> Result<()> {
        let snapshot = self
            .snapshots()
            .into_iter()
            .find(|s| s.spec.key() == spec_key)
            .context("unknown arbitrage pair")?;
        if snapshot.best_sell_price <= 0.0 {
            bail!("no best sell price available for {spec_key}");
        }
        self.place_sell(venues, &snapshot, snapshot.best_sell_price)
            .await
    }

    /// Operator pass-through: place a sell at the depth-weighted market price.
    pub async fn place_market_order(&self, venues: &Venues, spec_key: &str) -> Result<()> {
        let snapshot = self
            .snapshots()
            .into_iter()
            .find(|s| s.spec.key() == spec_key)
            .context("unknown arbitrage pair")?;
        if snapshot.sell_market_price <= 0.0 {
            bail!("no executable sell price available for {spec_key}");
        }
        self.place_sell(venues, &snapshot, snapshot.sell_market_price)
            .await
    }

    async fn place_sell(
        &self,
        venues: &Venues,
        snapshot: &ArbitrageSnapshot,
        price: f64,
    ) -> Result<()> {
        let symbol = &snapshot.spec.sell_symbol;
        let magic = snapshot
            .magic_number
            .clone()
            .unwrap_or_else(generate_magic_number);
        let quantity = floor_quantity(snapshot.sell_quantity, symbol.lot_size);
        let price = normalize_price(price, symbol.tick_size);

        debug!(
            symbol = %symbol.token,
            venue = %symbol.venue,
            price,
            quantity,
            magic = %magic,
            "placing manual sell order"
        );

        let connector = venues.get(symbol.venue)?;
        connector
            .place_order(OrderRequest {
                symbol: symbol.clone(),
                side: Side::Sell,
                order_type: OrderType::Limit,
                price,
                quantity,
                client_order_id: magic,
            })
            .await?;
        Ok(())
    }
}

/// Threshold checks run after every recompute. Debouncing is the consumer's
/// concern.
fn raise_alerts(snapshot: &ArbitrageSnapshot) -> Vec<BusEvent> {
    let mut events = Vec::new();
    let spec = &snapshot.spec;

    if spec.market_alert_enabled && snapshot.profit_at_market > spec.target_alert_at_market {
        events.push(BusEvent::MarketProfitAlert(snapshot.clone()));
    }
    if spec.limit_alert_enabled && snapshot.profit_at_best_price > spec.target_alert_at_best_sell {
        events.push(BusEvent::LimitProfitAlert(snapshot.clone()));
    }
    events
}
