use std::time::SystemTime;

use bitcoin::Amount;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    common::{PeerRef, TradeId},
    error::FiatSwapError,
};

/// Direction from the offerer's point of view. A `Buy` offer means the offerer
/// buys bitcoin and pays fiat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub direction: Direction,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub min_amount: Amount,
    pub price: f64, // fiat units per BTC
    pub currency_code: String,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub security_deposit: Amount,
    pub fiat_account_id: String,
    pub offerer_message_pub_key: PublicKey,
    pub offerer_peer: PeerRef,
    pub creation_date: SystemTime,
}

impl Offer {
    pub fn trade_id(&self) -> TradeId {
        TradeId::from_offer_id(self.id)
    }

    pub fn validate(&self) -> Result<(), FiatSwapError> {
        if self.amount == Amount::ZERO {
            return Err(FiatSwapError::simple(format!(
                "Offer {} amount must be larger than zero",
                self.id
            )));
        }
        if self.min_amount > self.amount {
            return Err(FiatSwapError::simple(format!(
                "Offer {} min amount {} exceeds amount {}",
                self.id, self.min_amount, self.amount
            )));
        }
        if self.security_deposit == Amount::ZERO {
            return Err(FiatSwapError::simple(format!(
                "Offer {} requires a security deposit",
                self.id
            )));
        }
        let locked = self
            .amount
            .checked_add(self.security_deposit)
            .filter(|locked| *locked <= Amount::MAX_MONEY);
        if locked.is_none() {
            return Err(FiatSwapError::simple(format!(
                "Offer {} amount {} plus security deposit {} out of range",
                self.id, self.amount, self.security_deposit
            )));
        }
        if !(self.price.is_finite() && self.price > 0.0) {
            return Err(FiatSwapError::simple(format!(
                "Offer {} price {} is not valid",
                self.id, self.price
            )));
        }
        Ok(())
    }

    pub fn validate_trade_amount(&self, trade_amount: Amount) -> Result<(), FiatSwapError> {
        if trade_amount < self.min_amount || trade_amount > self.amount {
            return Err(FiatSwapError::simple(format!(
                "Trade amount {} outside of offer {} range {} - {}",
                trade_amount, self.id, self.min_amount, self.amount
            )));
        }
        Ok(())
    }
}
