//! Typed event bus shared by the pricing service, venue connectors and the
//! auto-order engine. A closed enum over a tokio broadcast channel; slow or
//! absent receivers never block publishers.

use tokio::sync::broadcast;

use crate::book::DepthBook;
use crate::models::{Balance, Order, Venue};
use crate::pricing::ArbitrageSnapshot;

#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Wholesale depth snapshot replacement for one symbol.
    DepthUpdate(DepthBook),
    OrderUpdate(Order),
    BalanceUpdate {
        venue: Venue,
        coin: String,
        balance: Balance,
    },
    /// Profit at market crossed the configured threshold.
    MarketProfitAlert(ArbitrageSnapshot),
    /// Profit at best (maker) price crossed the configured threshold.
    LimitProfitAlert(ArbitrageSnapshot),
    TradeDetected(ArbitrageSnapshot),
    /// Fill or status change on a tracked trade.
    TradeUpdated(ArbitrageSnapshot),
    /// A tracked trade finished or was cleared; `None` means a bulk clear.
    TradeCleared { magic_number: Option<String> },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish, dropping the event when nobody is subscribed.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
