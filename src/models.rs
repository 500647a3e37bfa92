use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Exchanges this system can route orders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    GateIo,
    Bitrue,
    Mexc,
    /// In-process simulated venue (tests and dry runs)
    Paper,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::GateIo => "gateio",
            Venue::Bitrue => "bitrue",
            Venue::Mexc => "mexc",
            Venue::Paper => "paper",
        }
    }
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction side of an order or a trade leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    PendingCancel,
    Rejected,
    Expired,
    PartiallyCanceled,
}

impl OrderStatus {
    /// An order still resting on the venue, able to produce further fills.
    pub fn is_open(&self) -> bool {
        !matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::PartiallyCanceled
        )
    }
}

/// Instrument kind, matched exhaustively wherever the base/quote split matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SymbolKind {
    /// Crypto spot pair with explicit base and quote currencies.
    Spot { base: String, quote: String },
    /// Synthetic instrument with no currency split (indexes, baskets).
    Index,
}

/// Precision metadata for one symbol on one venue, resolved once via the
/// registry and immutable for the lifetime of a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub venue: Venue,
    pub token: String,
    pub lot_size: f64,
    pub tick_size: f64,
    pub decimal_places: u32,
    pub kind: SymbolKind,
}

impl SymbolMeta {
    pub fn spot(
        venue: Venue,
        token: impl Into<String>,
        base: impl Into<String>,
        quote: impl Into<String>,
        lot_size: f64,
        tick_size: f64,
        decimal_places: u32,
    ) -> Self {
        Self {
            venue,
            token: token.into(),
            lot_size,
            tick_size,
            decimal_places,
            kind: SymbolKind::Spot {
                base: base.into(),
                quote: quote.into(),
            },
        }
    }

    /// Key that identifies this symbol across all venue feeds.
    pub fn unique_key(&self) -> String {
        format!("{}-{}", self.venue, self.token)
    }

    pub fn base(&self) -> Option<&str> {
        match &self.kind {
            SymbolKind::Spot { base, .. } => Some(base),
            SymbolKind::Index => None,
        }
    }

    pub fn quote(&self) -> Option<&str> {
        match &self.kind {
            SymbolKind::Spot { quote, .. } => Some(quote),
            SymbolKind::Index => None,
        }
    }
}

/// Free/locked balance of one coin on one venue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub free: f64,
    pub locked: f64,
}

impl Balance {
    pub fn total(&self) -> f64 {
        self.free + self.locked
    }
}

/// Order state as reported by a venue connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub venue: Venue,
    pub token: String,
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: f64,
    pub filled_quantity: f64,
    pub average_price: f64,
    pub status: OrderStatus,
    /// Venue-side creation time, epoch milliseconds.
    pub order_time_ms: i64,
    pub last_update_ms: i64,
}

impl Order {
    pub fn remaining_quantity(&self) -> f64 {
        self.quantity - self.filled_quantity
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// Epoch milliseconds, the time base used for order history queries and
/// polling-cycle timeouts.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a trade identifier: `t-` plus 27 alphanumerics, with the epoch
/// millis up front so identifiers sort roughly by creation time. Propagated
/// as a client order id prefix to correlate venue order updates.
pub fn generate_magic_number() -> String {
    let entropy = uuid::Uuid::new_v4().simple().to_string();
    format!("t-{}{}", now_ms(), &entropy[..14])
}

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// Per-trade polling interval in seconds
    pub poll_interval_secs: u64,
    /// Initial wait window (seconds) before an unfilled trade is canceled
    pub initial_wait_secs: u64,
    /// Time between adjustment attempts while in exit mode (seconds)
    pub exit_retry_timeout_secs: u64,
    /// Safety timeout for orders stuck open with no fills (seconds)
    pub stuck_order_timeout_secs: u64,
    /// Minimum profit (percent) required at the moment of submission
    pub min_profit_percent: f64,
    /// Maximum tolerated loss (percent) for corrective repricing
    pub max_loss_percent: f64,
    pub auto_order_management: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./spreadbot.db".to_string());

        let poll_interval_secs = env_parse("POLL_INTERVAL_SECS", 5);
        let initial_wait_secs = env_parse("INITIAL_WAIT_SECS", 5);
        let exit_retry_timeout_secs = env_parse("EXIT_RETRY_TIMEOUT_SECS", 10);
        let stuck_order_timeout_secs = env_parse("STUCK_ORDER_TIMEOUT_SECS", 300);
        let min_profit_percent = env_parse("MIN_PROFIT_PERCENT", 0.2);
        let max_loss_percent = env_parse("MAX_LOSS_PERCENT", -0.2);

        let auto_order_management = std::env::var("AUTO_ORDER_MANAGEMENT")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        Ok(Self {
            database_path,
            poll_interval_secs,
            initial_wait_secs,
            exit_retry_timeout_secs,
            stuck_order_timeout_secs,
            min_profit_percent,
            max_loss_percent,
            auto_order_management,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
