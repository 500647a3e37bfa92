//! Symbol and coin registry: resolves venue-specific precision metadata.
//! Populated once at startup from connector symbol dumps; read-only lookups
//! afterwards.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::models::{SymbolMeta, Venue};

/// Per-coin metadata a venue exposes outside of any trading pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinMeta {
    pub venue: Venue,
    pub coin: String,
    pub withdraw_enabled: bool,
}

#[derive(Default)]
pub struct SymbolRegistry {
    symbols: RwLock<HashMap<String, SymbolMeta>>,
    coins: RwLock<HashMap<String, CoinMeta>>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_symbol(&self, meta: SymbolMeta) {
        self.symbols.write().insert(meta.unique_key(), meta);
    }

    pub fn register_coin(&self, meta: CoinMeta) {
        let key = format!("{}-{}", meta.venue, meta.coin);
        self.coins.write().insert(key, meta);
    }

    pub fn resolve_symbol(&self, venue: Venue, token: &str) -> Option<SymbolMeta> {
        self.symbols
            .read()
            .get(&format!("{venue}-{token}"))
            .cloned()
    }

    pub fn resolve_coin(&self, venue: Venue, coin: &str) -> Option<CoinMeta> {
        self.coins.read().get(&format!("{venue}-{coin}")).cloned()
    }
}
