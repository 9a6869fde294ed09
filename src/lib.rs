pub mod common;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod model;
pub mod notif;
pub mod offer;
pub mod offerer;
pub mod persist;
pub mod protocol;
pub mod services;
pub mod taker;
pub mod task;
pub mod testing;
pub mod trade;

pub use error::FiatSwapError;
pub use manager::TradeManager;
pub use notif::TradeNotif;
pub use trade::{Trade, TradeState};
