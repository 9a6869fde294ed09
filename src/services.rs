//! Narrow capability interfaces the protocol consumes. Wallet, chain lookup,
//! signing, storage and transport all live outside this crate; a trade's
//! models only ever see them through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{
    hashes::{sha256, Hash},
    Amount, Txid,
};
use secp256k1::{ecdsa::Signature, All, KeyPair, Message, PublicKey, Secp256k1};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    common::{
        AddressEntry, FeePolicy, FiatAccount, PeerRef, SignedTx, TradeId, TxConfidence,
    },
    error::FiatSwapError,
    message::ProtocolMessage,
    persist::Persistence,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeTxKind {
    TakeOfferFee,
    Deposit,
    Payout,
}

/// Offerer's half of the multisig deposit, handed to the taker for completion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositInputs {
    pub raw: Vec<u8>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub contribution: Amount,
}

#[derive(Clone, Debug)]
pub struct DepositTxRequest {
    pub offerer_inputs: DepositInputs,
    pub offerer_pub_key: PublicKey,
    pub taker_pub_key: PublicKey,
    pub taker_contribution: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutTerms {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub offerer_amount: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub taker_amount: Amount,
    pub offerer_address: String,
    pub taker_address: String,
}

impl PayoutTerms {
    /// Splits the locked deposit. The buying offerer gets the trade amount and
    /// everything it locked itself; the selling taker gets back what it locked
    /// beyond the trade amount, less the payout fee. Overpaid security deposits
    /// flow back to whoever overpaid.
    pub fn for_buyer_as_offerer(
        trade_amount: Amount,
        offerer_contribution: Amount,
        taker_contribution: Amount,
        offerer_address: impl Into<String>,
        taker_address: impl Into<String>,
    ) -> Result<Self, FiatSwapError> {
        let needed = trade_amount.checked_add(FeePolicy::TX_FEE).ok_or_else(|| {
            FiatSwapError::simple(format!("Trade amount {} out of range", trade_amount))
        })?;
        let taker_amount = taker_contribution.checked_sub(needed).ok_or(
            FiatSwapError::InsufficientFunds {
                needed,
                available: taker_contribution,
            },
        )?;
        locked_total(offerer_contribution, taker_contribution).ok_or_else(|| {
            FiatSwapError::simple(format!(
                "Deposit contributions {} and {} out of range",
                offerer_contribution, taker_contribution
            ))
        })?;
        let offerer_amount = trade_amount
            .checked_add(offerer_contribution)
            .ok_or_else(|| {
                FiatSwapError::simple(format!(
                    "Offerer contribution {} out of range",
                    offerer_contribution
                ))
            })?;
        Ok(Self {
            offerer_amount,
            taker_amount,
            offerer_address: offerer_address.into(),
            taker_address: taker_address.into(),
        })
    }
}

/// What the 2-of-2 deposit locks, or `None` when it cannot be represented.
pub fn locked_total(offerer_contribution: Amount, taker_contribution: Amount) -> Option<Amount> {
    offerer_contribution
        .checked_add(taker_contribution)
        .filter(|total| *total <= Amount::MAX_MONEY)
}

#[async_trait]
pub trait WalletService: Send + Sync {
    fn address_entry(&self, trade_id: TradeId) -> AddressEntry;

    fn registration_address_entry(&self) -> AddressEntry;

    fn balance_for_address(&self, address: &str) -> Amount;

    fn confidence_for_txid(&self, txid: &Txid) -> Option<TxConfidence>;

    /// Dropping the receiver ends the subscription.
    fn subscribe_tx_confidence(&self, txid: &Txid) -> mpsc::Receiver<TxConfidence>;

    /// Looks up a transaction this wallet already broadcast for the trade.
    fn find_trade_tx(&self, trade_id: TradeId, kind: TradeTxKind) -> Option<SignedTx>;

    async fn pay_take_offer_fee(&self, trade_id: TradeId) -> Result<SignedTx, FiatSwapError>;

    async fn create_deposit_inputs(
        &self,
        trade_id: TradeId,
        contribution: Amount,
    ) -> Result<DepositInputs, FiatSwapError>;

    async fn sign_and_publish_deposit_tx(
        &self,
        trade_id: TradeId,
        request: DepositTxRequest,
    ) -> Result<SignedTx, FiatSwapError>;

    fn payout_sighash(
        &self,
        deposit_tx: &SignedTx,
        terms: &PayoutTerms,
    ) -> Result<Vec<u8>, FiatSwapError>;

    async fn sign_and_publish_payout_tx(
        &self,
        trade_id: TradeId,
        deposit_tx: &SignedTx,
        terms: &PayoutTerms,
        offerer_signature: &[u8],
    ) -> Result<SignedTx, FiatSwapError>;

    async fn send_funds(
        &self,
        from_address: &str,
        to_address: &str,
        amount: Amount,
    ) -> Result<SignedTx, FiatSwapError>;
}

pub trait BlockChainService: Send + Sync {
    fn verify_account_registration(&self, account_id: &str) -> bool;

    fn is_account_black_listed(&self, account_id: &str, fiat_account: &FiatAccount) -> bool;
}

pub trait SignatureService: Send + Sync {
    fn sign(&self, key_pair: &KeyPair, payload: &[u8]) -> Result<Vec<u8>, FiatSwapError>;

    fn verify(&self, pub_key: &PublicKey, payload: &[u8], signature: &[u8]) -> bool;
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send_message(
        &self,
        peer: &PeerRef,
        message: ProtocolMessage,
    ) -> Result<(), FiatSwapError>;
}

/// ECDSA over secp256k1, signing the SHA-256 digest of the payload.
pub struct EcdsaSignatureService {
    secp: Secp256k1<All>,
}

impl EcdsaSignatureService {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn digest(payload: &[u8]) -> Result<Message, FiatSwapError> {
        let hash = sha256::Hash::hash(payload);
        Ok(Message::from_slice(hash.as_ref())?)
    }
}

impl Default for EcdsaSignatureService {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureService for EcdsaSignatureService {
    fn sign(&self, key_pair: &KeyPair, payload: &[u8]) -> Result<Vec<u8>, FiatSwapError> {
        let message = Self::digest(payload)?;
        let signature = self.secp.sign_ecdsa(&message, &key_pair.secret_key());
        Ok(signature.serialize_der().to_vec())
    }

    fn verify(&self, pub_key: &PublicKey, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(message) = Self::digest(payload) else {
            return false;
        };
        let Ok(signature) = Signature::from_der(signature) else {
            return false;
        };
        self.secp
            .verify_ecdsa(&message, &signature, pub_key)
            .is_ok()
    }
}

/// Service handles injected into every model. Shared across trades; the
/// protocol never assumes exclusive access to any of them.
#[derive(Clone)]
pub struct TradeServices {
    pub wallet: Arc<dyn WalletService>,
    pub block_chain: Arc<dyn BlockChainService>,
    pub signature: Arc<dyn SignatureService>,
    pub transport: Arc<dyn MessageTransport>,
    pub persistence: Arc<dyn Persistence>,
}
