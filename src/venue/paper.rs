//! In-process simulated venue. Orders rest until a test scripts a fill;
//! balances are whatever the test sets. Rejections (min notional, scripted
//! failures) behave like the real connectors so the engine's error paths
//! get exercised.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::bus::{BusEvent, EventBus};
use crate::models::{now_ms, Balance, Order, OrderStatus, Venue};

use super::{OrderRequest, VenueConnector};

#[derive(Default)]
struct PaperState {
    next_order_id: u64,
    orders: Vec<Order>,
    balances: HashMap<String, Balance>,
    fail_next_place: bool,
}

pub struct PaperVenue {
    venue: Venue,
    min_notional: f64,
    state: Mutex<PaperState>,
    bus: Option<EventBus>,
}

impl PaperVenue {
    pub fn new(venue: Venue, min_notional: f64) -> Self {
        Self {
            venue,
            min_notional,
            state: Mutex::new(PaperState::default()),
            bus: None,
        }
    }

    /// Like a real connector, publish order and balance updates on the bus.
    pub fn with_bus(venue: Venue, min_notional: f64, bus: EventBus) -> Self {
        Self {
            bus: Some(bus),
            ..Self::new(venue, min_notional)
        }
    }

    fn publish(&self, event: BusEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    pub fn set_balance(&self, coin: &str, free: f64, locked: f64) {
        let balance = Balance { free, locked };
        self.state
            .lock()
            .balances
            .insert(coin.to_string(), balance);
        self.publish(BusEvent::BalanceUpdate {
            venue: self.venue,
            coin: coin.to_string(),
            balance,
        });
    }

    /// The next `place_order` call fails, simulating a venue rejection.
    pub fn fail_next_place(&self) {
        self.state.lock().fail_next_place = true;
    }

    /// Script a fill against a resting order, at the order's own price.
    pub fn fill(&self, client_order_id: &str, quantity: f64) {
        let updated = {
            let mut state = self.state.lock();
            let Some(order) = state
                .orders
                .iter_mut()
                .find(|o| o.client_order_id == client_order_id)
            else {
                return;
            };
            let fill = quantity.min(order.remaining_quantity());
            order.average_price = if order.filled_quantity + fill > 0.0 {
                (order.average_price * order.filled_quantity + order.price * fill)
                    / (order.filled_quantity + fill)
            } else {
                0.0
            };
            order.filled_quantity += fill;
            order.status = if order.remaining_quantity() <= f64::EPSILON {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            order.last_update_ms = now_ms();
            order.clone()
        };
        self.publish(BusEvent::OrderUpdate(updated));
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.state
            .lock()
            .orders
            .iter()
            .filter(|o| o.is_open())
            .cloned()
            .collect()
    }

    pub fn order(&self, client_order_id: &str) -> Option<Order> {
        self.state
            .lock()
            .orders
            .iter()
            .find(|o| o.client_order_id == client_order_id)
            .cloned()
    }
}

#[async_trait]
impl VenueConnector for PaperVenue {
    fn venue(&self) -> Venue {
        self.venue
    }

    fn min_notional(&self) -> f64 {
        self.min_notional
    }

    async fn place_order(&self, request: OrderRequest) -> Result<Order> {
        let mut state = self.state.lock();
        if state.fail_next_place {
            state.fail_next_place = false;
            bail!("paper venue: scripted order rejection");
        }
        if request.notional() < self.min_notional {
            bail!(
                "paper venue: order notional {:.8} below minimum {}",
                request.notional(),
                self.min_notional
            );
        }

        state.next_order_id += 1;
        let now = now_ms();
        let order = Order {
            venue: self.venue,
            token: request.symbol.token.clone(),
            order_id: state.next_order_id.to_string(),
            client_order_id: request.client_order_id,
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            filled_quantity: 0.0,
            average_price: 0.0,
            status: OrderStatus::New,
            order_time_ms: now,
            last_update_ms: now,
        };
        debug!(
            venue = %self.venue,
            token = %order.token,
            side = %order.side,
            price = order.price,
            quantity = order.quantity,
            client_order_id = %order.client_order_id,
            "paper order accepted"
        );
        state.orders.push(order.clone());
        drop(state);
        self.publish(BusEvent::OrderUpdate(order.clone()));
        Ok(order)
    }

    async fn cancel_order(&self, order: &Order) -> Result<()> {
        let updated = {
            let mut state = self.state.lock();
            let Some(resting) = state
                .orders
                .iter_mut()
                .find(|o| o.order_id == order.order_id)
            else {
                bail!("paper venue: unknown order {}", order.order_id);
            };
            if resting.is_open() {
                resting.status = if resting.filled_quantity > 0.0 {
                    OrderStatus::PartiallyCanceled
                } else {
                    OrderStatus::Cancelled
                };
                resting.last_update_ms = now_ms();
            }
            resting.clone()
        };
        self.publish(BusEvent::OrderUpdate(updated));
        Ok(())
    }

    async fn orders_since(
        &self,
        token: &str,
        since_ms: i64,
        client_id_prefix: &str,
    ) -> Result<Vec<Order>> {
        Ok(self
            .state
            .lock()
            .orders
            .iter()
            .filter(|o| {
                o.token == token
                    && o.order_time_ms >= since_ms
                    && o.client_order_id.starts_with(client_id_prefix)
            })
            .cloned()
            .collect())
    }

    async fn balance(&self, coin: &str) -> Result<Balance> {
        Ok(self
            .state
            .lock()
            .balances
            .get(coin)
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderType, Side, SymbolMeta};

    fn request(client_id: &str, price: f64, quantity: f64) -> OrderRequest {
        OrderRequest {
            symbol: SymbolMeta::spot(Venue::Paper, "XDCUSDT", "XDC", "USDT", 1.0, 0.00001, 5),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price,
            quantity,
            client_order_id: client_id.to_string(),
        }
    }

    #[tokio::test]
    async fn rejects_below_min_notional() {
        let venue = PaperVenue::new(Venue::Paper, 10.0);
        assert!(venue.place_order(request("t-1", 0.05, 100.0)).await.is_err());
        assert!(venue.place_order(request("t-2", 0.05, 500.0)).await.is_ok());
    }

    #[tokio::test]
    async fn fills_and_cancellation() {
        let venue = PaperVenue::new(Venue::Paper, 1.0);
        let order = venue.place_order(request("t-3", 0.05, 1000.0)).await.unwrap();

        venue.fill("t-3", 400.0);
        let partial = venue.order("t-3").unwrap();
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
        assert_eq!(partial.filled_quantity, 400.0);

        venue.cancel_order(&order).await.unwrap();
        let canceled = venue.order("t-3").unwrap();
        assert_eq!(canceled.status, OrderStatus::PartiallyCanceled);
        assert!(!canceled.is_open());
    }

    #[tokio::test]
    async fn history_filters_by_prefix_and_time() {
        let venue = PaperVenue::new(Venue::Paper, 1.0);
        venue.place_order(request("t-abc-1", 0.05, 1000.0)).await.unwrap();
        venue.place_order(request("t-abc-retry-1", 0.05, 1000.0)).await.unwrap();
        venue.place_order(request("t-xyz-1", 0.05, 1000.0)).await.unwrap();

        let mine = venue
            .orders_since("XDCUSDT", now_ms() - 5_000, "t-abc")
            .await
            .unwrap();
        assert_eq!(mine.len(), 2);

        let none = venue
            .orders_since("XDCUSDT", now_ms() + 5_000, "t-abc")
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
