mod model;
mod tasks;

pub use model::{BuyerAsOffererModel, BuyerAsOffererRecord};
pub use tasks::BuyerAsOffererTask;
