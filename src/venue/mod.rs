//! Venue connector abstraction: the seam between the engine and exchange
//! APIs. The engine only ever talks to `VenueConnector`; the paper venue
//! implements it in-process for tests and dry runs.

pub mod paper;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{Balance, Order, OrderType, Side, SymbolMeta, Venue};

/// Everything a connector needs to submit one order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: SymbolMeta,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub quantity: f64,
    pub client_order_id: String,
}

impl OrderRequest {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

#[async_trait]
pub trait VenueConnector: Send + Sync {
    fn venue(&self) -> Venue;

    /// Smallest order notional (in quote currency) the venue accepts.
    fn min_notional(&self) -> f64;

    async fn place_order(&self, request: OrderRequest) -> Result<Order>;

    async fn cancel_order(&self, order: &Order) -> Result<()>;

    /// Orders created since `since_ms` whose client order id starts with
    /// `client_id_prefix`. This is the reconciliation engine's only view of
    /// fill progress.
    async fn orders_since(
        &self,
        token: &str,
        since_ms: i64,
        client_id_prefix: &str,
    ) -> Result<Vec<Order>>;

    async fn balance(&self, coin: &str) -> Result<Balance>;
}

/// Connector lookup by venue, shared across the engine and services.
#[derive(Clone, Default)]
pub struct Venues {
    connectors: HashMap<Venue, Arc<dyn VenueConnector>>,
}

impl Venues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn VenueConnector>) {
        self.connectors.insert(connector.venue(), connector);
    }

    pub fn get(&self, venue: Venue) -> Result<Arc<dyn VenueConnector>> {
        match self.connectors.get(&venue) {
            Some(connector) => Ok(Arc::clone(connector)),
            None => bail!("no connector registered for venue {venue}"),
        }
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn VenueConnector>> {
        self.connectors.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::paper::PaperVenue;

    #[test]
    fn lookup_by_venue() {
        let mut venues = Venues::new();
        venues.register(Arc::new(PaperVenue::new(Venue::Paper, 1.0)));

        assert!(venues.get(Venue::Paper).is_ok());
        assert!(venues.get(Venue::Mexc).is_err());
    }
}
