use bitcoin::Amount;
use secp256k1::{KeyPair, PublicKey};
use serde::{Deserialize, Serialize};

use crate::{
    common::{AddressEntry, FiatAccount, PeerRef, Role, TradeId, UserIdentity},
    error::FiatSwapError,
    services::{DepositInputs, WalletService},
};

use super::task_owned::TaskOwned;

/// Keys this node derives for itself. Never persisted, always taken from the
/// live wallet.
#[derive(Clone, Debug)]
pub struct LocalKeys {
    pub registration_pub_key: PublicKey,
    pub registration_key_pair: KeyPair,
    pub address_entry: AddressEntry,
}

impl LocalKeys {
    pub fn derive(wallet: &dyn WalletService, trade_id: TradeId) -> Self {
        let registration = wallet.registration_address_entry();
        Self {
            registration_pub_key: registration.pub_key,
            registration_key_pair: registration.key_pair,
            address_entry: wallet.address_entry(trade_id),
        }
    }
}

/// Identity of one party of the trade. For the local party every field is
/// filled at construction; for the counterparty the fields stay absent until
/// the processing task for the disclosing message fills them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PartyIdentity {
    #[serde(skip)]
    local: Option<LocalKeys>,
    pub account_id: TaskOwned<String>,
    pub registration_pub_key: TaskOwned<PublicKey>,
    pub pub_key: TaskOwned<PublicKey>,
    pub message_pub_key: TaskOwned<PublicKey>,
    pub fiat_account: TaskOwned<FiatAccount>,
    pub peer: Option<PeerRef>,
}

impl PartyIdentity {
    pub(crate) fn attach_local(
        &mut self,
        keys: LocalKeys,
        user: &UserIdentity,
        fiat_account: FiatAccount,
        peer: PeerRef,
    ) {
        self.account_id.assign_local(user.account_id.clone());
        self.registration_pub_key
            .assign_local(keys.registration_pub_key);
        self.pub_key.assign_local(keys.address_entry.pub_key);
        self.message_pub_key.assign_local(user.message_pub_key);
        self.fiat_account.assign_local(fiat_account);
        self.peer = Some(peer);
        self.local = Some(keys);
    }

    pub fn local_keys(&self) -> Option<&LocalKeys> {
        self.local.as_ref()
    }

    pub(crate) fn require_local_keys(&self) -> Result<&LocalKeys, FiatSwapError> {
        self.local
            .as_ref()
            .ok_or_else(|| FiatSwapError::contract("local keys requested for the counterparty"))
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub(crate) fn require_peer(&self) -> Result<&PeerRef, FiatSwapError> {
        self.peer
            .as_ref()
            .ok_or_else(|| FiatSwapError::contract("peer read before it was known"))
    }

    /// Mandatory fields of the local party. Persisting without them is a
    /// programming error.
    pub(crate) fn ensure_local_complete(&self, role: Role) -> Result<(), FiatSwapError> {
        let complete = self.local.is_some()
            && self.account_id.is_set()
            && self.registration_pub_key.is_set()
            && self.pub_key.is_set()
            && self.message_pub_key.is_set()
            && self.fiat_account.is_set();
        if !complete {
            return Err(FiatSwapError::contract(format!(
                "{} identity incomplete at persist",
                role
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OffererModel {
    pub identity: PartyIdentity,
    pub deposit_inputs: TaskOwned<DepositInputs>,
    pub contract_signature: TaskOwned<Vec<u8>>,
    pub payout_signature: TaskOwned<Vec<u8>>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TakerModel {
    pub identity: PartyIdentity,
    #[serde(with = "super::task_owned::amount_as_sat")]
    pub contribution: TaskOwned<Amount>,
    pub payout_address: TaskOwned<String>,
}
