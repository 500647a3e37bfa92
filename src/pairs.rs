//! Pair configuration file: the symbols, coins and arbitrage pairs the
//! process watches. Pair legs are written as venue/token references and
//! resolved to full precision metadata through the symbol registry, so one
//! symbol definition serves every pair that trades it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::models::{SymbolMeta, Venue};
use crate::pricing::ArbitrageSpec;
use crate::registry::{CoinMeta, SymbolRegistry};

/// Reference to a registered symbol.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolRef {
    pub venue: Venue,
    pub token: String,
}

fn default_market_alert() -> f64 {
    1.0
}

fn default_limit_alert() -> f64 {
    3.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub sell: SymbolRef,
    pub buy: SymbolRef,
    pub conversion: Option<SymbolRef>,
    pub sell_quantity: f64,
    pub buy_quantity: f64,
    #[serde(default)]
    pub conversion_quantity: f64,
    #[serde(default = "default_market_alert")]
    pub target_alert_at_market: f64,
    #[serde(default = "default_limit_alert")]
    pub target_alert_at_best_sell: f64,
    #[serde(default)]
    pub market_alert_enabled: bool,
    #[serde(default)]
    pub limit_alert_enabled: bool,
    #[serde(default)]
    pub auto_order_enabled: bool,
    #[serde(default)]
    pub extra_buy_quantity: f64,
    #[serde(default)]
    pub target_notional_value: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PairsFile {
    #[serde(default)]
    pub symbols: Vec<SymbolMeta>,
    #[serde(default)]
    pub coins: Vec<CoinMeta>,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl PairsFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "no pairs file found, starting without pairs");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading pairs file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing pairs file {}", path.display()))
    }

    /// Seed the registry with every symbol and coin this file declares.
    pub fn register(&self, registry: &SymbolRegistry) {
        for symbol in &self.symbols {
            registry.register_symbol(symbol.clone());
        }
        for coin in &self.coins {
            registry.register_coin(coin.clone());
        }
    }

    /// Resolve every pair's legs through the registry. Pairs whose base
    /// coin has withdrawals disabled on either trading venue are skipped:
    /// inventory cannot be rebalanced across venues without withdrawals.
    pub fn build_specs(&self, registry: &SymbolRegistry) -> Result<Vec<ArbitrageSpec>> {
        let mut specs = Vec::new();
        for pair in &self.pairs {
            let sell_symbol = resolve(registry, &pair.sell)?;
            let buy_symbol = resolve(registry, &pair.buy)?;
            let conversion_symbol = pair
                .conversion
                .as_ref()
                .map(|reference| resolve(registry, reference))
                .transpose()?;

            if withdrawals_disabled(registry, &sell_symbol)
                || withdrawals_disabled(registry, &buy_symbol)
            {
                warn!(
                    sell = %sell_symbol.unique_key(),
                    buy = %buy_symbol.unique_key(),
                    "skipping pair, base coin withdrawals disabled"
                );
                continue;
            }

            specs.push(ArbitrageSpec {
                sell_symbol,
                buy_symbol,
                conversion_symbol,
                sell_quantity: pair.sell_quantity,
                buy_quantity: pair.buy_quantity,
                conversion_quantity: pair.conversion_quantity,
                target_alert_at_market: pair.target_alert_at_market,
                target_alert_at_best_sell: pair.target_alert_at_best_sell,
                market_alert_enabled: pair.market_alert_enabled,
                limit_alert_enabled: pair.limit_alert_enabled,
                auto_order_enabled: pair.auto_order_enabled,
                extra_buy_quantity: pair.extra_buy_quantity,
                target_notional_value: pair.target_notional_value,
            });
        }
        Ok(specs)
    }
}

fn resolve(registry: &SymbolRegistry, reference: &SymbolRef) -> Result<SymbolMeta> {
    registry
        .resolve_symbol(reference.venue, &reference.token)
        .with_context(|| {
            format!(
                "pairs file references unregistered symbol {}-{}",
                reference.venue, reference.token
            )
        })
}

fn withdrawals_disabled(registry: &SymbolRegistry, symbol: &SymbolMeta) -> bool {
    symbol
        .base()
        .and_then(|base| registry.resolve_coin(symbol.venue, base))
        .map(|coin| !coin.withdraw_enabled)
        .unwrap_or(false)
}
