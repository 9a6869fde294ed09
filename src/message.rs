use bitcoin::{Amount, Txid};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    common::{FiatAccount, PeerRef, SignedTx, TradeId},
    services::{DepositInputs, PayoutTerms},
    trade::Contract,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProtocolMessage {
    RequestIsOfferAvailable {
        offer_id: Uuid,
        taker_peer: PeerRef,
    },
    ReportOfferAvailability {
        offer_id: Uuid,
        is_available: bool,
    },
    RequestTakeOffer {
        trade_id: TradeId,
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        trade_amount: Amount,
        take_offer_fee_txid: Txid,
        taker_account_id: String,
        taker_pub_key: PublicKey,
        taker_message_pub_key: PublicKey,
        taker_fiat_account: FiatAccount,
        taker_peer: PeerRef,
    },
    RespondToTakeOfferRequest {
        trade_id: TradeId,
        offerer_account_id: String,
        offerer_registration_pub_key: PublicKey,
        offerer_pub_key: PublicKey,
        offerer_fiat_account: FiatAccount,
        offerer_deposit_inputs: DepositInputs,
        contract: Contract,
        contract_signature: Vec<u8>,
    },
    DepositTxPublished {
        trade_id: TradeId,
        deposit_tx: SignedTx,
        #[serde(with = "bitcoin::amount::serde::as_sat")]
        taker_contribution: Amount,
        taker_payout_address: String,
    },
    FiatTransferStarted {
        trade_id: TradeId,
        offerer_signature: Vec<u8>,
        payout_terms: PayoutTerms,
    },
    PayoutTxPublished {
        trade_id: TradeId,
        payout_tx: SignedTx,
    },
}

impl ProtocolMessage {
    /// `None` for the offer availability exchange, which precedes any trade.
    pub fn trade_id(&self) -> Option<TradeId> {
        match self {
            ProtocolMessage::RequestIsOfferAvailable { .. }
            | ProtocolMessage::ReportOfferAvailability { .. } => None,
            ProtocolMessage::RequestTakeOffer { trade_id, .. }
            | ProtocolMessage::RespondToTakeOfferRequest { trade_id, .. }
            | ProtocolMessage::DepositTxPublished { trade_id, .. }
            | ProtocolMessage::FiatTransferStarted { trade_id, .. }
            | ProtocolMessage::PayoutTxPublished { trade_id, .. } => Some(*trade_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::RequestIsOfferAvailable { .. } => "RequestIsOfferAvailable",
            ProtocolMessage::ReportOfferAvailability { .. } => "ReportOfferAvailability",
            ProtocolMessage::RequestTakeOffer { .. } => "RequestTakeOffer",
            ProtocolMessage::RespondToTakeOfferRequest { .. } => "RespondToTakeOfferRequest",
            ProtocolMessage::DepositTxPublished { .. } => "DepositTxPublished",
            ProtocolMessage::FiatTransferStarted { .. } => "FiatTransferStarted",
            ProtocolMessage::PayoutTxPublished { .. } => "PayoutTxPublished",
        }
    }
}
