mod confidence;
mod contract;
mod state;
mod trade;

pub use confidence::ConfidenceWatch;
pub use contract::Contract;
pub use state::TradeState;
pub use trade::{Trade, TradeSnapshot};
