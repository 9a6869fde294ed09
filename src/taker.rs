mod model;
mod tasks;

pub use model::{SellerAsTakerModel, SellerAsTakerRecord};
pub use tasks::SellerAsTakerTask;
