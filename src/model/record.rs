use serde::{Deserialize, Serialize};

use crate::{
    error::FiatSwapError,
    offerer::{BuyerAsOffererModel, BuyerAsOffererRecord},
    taker::{SellerAsTakerModel, SellerAsTakerRecord},
    trade::TradeSnapshot,
};

pub const CLOSED_TRADE_NAMESPACE: &str = "ClosedTrade";

/// Persisted form of a role model. The tag names the model type, so restoring
/// is a typed decode.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "model")]
pub enum PersistedModel {
    BuyerAsOfferer(BuyerAsOffererRecord),
    SellerAsTaker(SellerAsTakerRecord),
}

impl PersistedModel {
    pub fn model_type_name(&self) -> &'static str {
        match self {
            PersistedModel::BuyerAsOfferer(_) => BuyerAsOffererModel::MODEL_TYPE_NAME,
            PersistedModel::SellerAsTaker(_) => SellerAsTakerModel::MODEL_TYPE_NAME,
        }
    }

    pub fn trade_snapshot(&self) -> &TradeSnapshot {
        match self {
            PersistedModel::BuyerAsOfferer(record) => &record.trade,
            PersistedModel::SellerAsTaker(record) => &record.trade,
        }
    }

    pub fn decode(blob: &str) -> Result<Self, FiatSwapError> {
        Ok(serde_json::from_str(blob)?)
    }

    pub fn encode(&self) -> Result<String, FiatSwapError> {
        Ok(serde_json::to_string(self)?)
    }
}
