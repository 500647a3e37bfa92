//! Cross-exchange arbitrage toolkit: depth-weighted pricing of paired
//! sell/buy opportunities and an auto-order engine that executes and
//! reconciles them.
//!
//! The moving parts talk through a typed broadcast bus: venue connectors
//! publish depth and order updates, the pricing service recomputes pair
//! profitability and raises alerts, and the engine turns alerts into
//! paired orders it polls to completion.

pub mod book;
pub mod bus;
pub mod engine;
pub mod models;
pub mod pairs;
pub mod pricing;
pub mod registry;
pub mod store;
pub mod venue;
