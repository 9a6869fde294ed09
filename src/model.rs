mod party;
mod record;
mod shared;
mod task_owned;

pub use party::{LocalKeys, OffererModel, PartyIdentity, TakerModel};
pub use record::{PersistedModel, CLOSED_TRADE_NAMESPACE};
pub use shared::{NodeContext, SharedTradeModel};
pub use task_owned::TaskOwned;

pub(crate) fn persistence_key(model_type_name: &str, trade_id: crate::common::TradeId) -> String {
    format!("{}_{}", model_type_name, trade_id)
}
