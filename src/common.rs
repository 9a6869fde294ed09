use std::{fmt, str::FromStr};

use bitcoin::{Address, Amount, Network, Txid};
use secp256k1::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::FiatSwapError;

/// Identifies one trade. A trade takes the id of the offer it originated from,
/// so both peers agree on it without negotiating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(Uuid);

impl TradeId {
    pub fn from_offer_id(offer_id: Uuid) -> Self {
        TradeId(offer_id)
    }

    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Offerer,
    Taker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "Offerer"),
            Role::Taker => write!(f, "Taker"),
        }
    }
}

/// Where protocol messages for a peer are delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRef {
    pub address: Url,
}

impl PeerRef {
    pub fn new(address: Url) -> Self {
        Self { address }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Handle to a transaction that is fully signed and can be broadcast or has
/// been broadcast already. The raw bytes are opaque to the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub txid: Txid,
    pub raw: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxConfidence {
    Unknown,
    Pending,
    Building { depth: u32 },
    Dead,
}

impl TxConfidence {
    pub fn is_building(&self) -> bool {
        matches!(self, TxConfidence::Building { .. })
    }
}

#[derive(Clone, Debug)]
pub struct AddressEntry {
    pub address: String,
    pub pub_key: PublicKey,
    pub key_pair: KeyPair,
}

/// Bank account metadata is owned elsewhere, the protocol only passes it on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiatAccount {
    pub id: String,
    pub holder_name: String,
    pub account_details: String,
}

/// Local identity of the user running this node.
#[derive(Clone, Debug)]
pub struct UserIdentity {
    pub account_id: String,
    pub message_pub_key: PublicKey,
    pub fiat_accounts: Vec<FiatAccount>,
}

impl UserIdentity {
    pub fn fiat_account(&self, fiat_account_id: impl AsRef<str>) -> Option<FiatAccount> {
        self.fiat_accounts
            .iter()
            .find(|account| account.id == fiat_account_id.as_ref())
            .cloned()
    }
}

pub struct FeePolicy {}

impl FeePolicy {
    pub const TX_FEE: Amount = Amount::from_sat(10_000);
    pub const TAKE_OFFER_FEE: Amount = Amount::from_sat(100_000);

    /// What the selling taker locks into the deposit: the trade amount, its
    /// security deposit and the payout fee. `None` when not representable.
    pub fn taker_contribution(trade_amount: Amount, security_deposit: Amount) -> Option<Amount> {
        trade_amount
            .checked_add(security_deposit)?
            .checked_add(Self::TX_FEE)
            .filter(|contribution| *contribution <= Amount::MAX_MONEY)
    }
}

pub fn parse_address(
    address: impl AsRef<str>,
    network: Network,
) -> Result<Address, FiatSwapError> {
    let unchecked_addr =
        Address::from_str(address.as_ref()).map_err(|error| FiatSwapError::InvalidAddress {
            address: address.as_ref().to_owned(),
            description: error.to_string(),
        })?;
    unchecked_addr
        .require_network(network)
        .map_err(|error| FiatSwapError::InvalidAddress {
            address: address.as_ref().to_owned(),
            description: format!("not {} - {}", network, error),
        })
}
