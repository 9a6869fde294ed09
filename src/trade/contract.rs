use bitcoin::{Amount, Txid};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};

use crate::{common::FiatAccount, error::FiatSwapError, offer::Offer};

/// Terms both parties commit to before any deposit is locked. The offerer
/// assembles and signs it once the take offer request is verified; the taker
/// rebuilds it from what it knows itself and accepts only an identical copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub offer: Offer,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub trade_amount: Amount,
    pub take_offer_fee_txid: Txid,
    pub offerer_account_id: String,
    pub taker_account_id: String,
    pub offerer_fiat_account: FiatAccount,
    pub taker_fiat_account: FiatAccount,
    pub offerer_message_pub_key: PublicKey,
    pub taker_message_pub_key: PublicKey,
}

impl Contract {
    /// Bytes the offerer's registration key signs.
    pub fn signing_payload(&self) -> Result<Vec<u8>, FiatSwapError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::hashes::Hash;

    use crate::{
        services::{EcdsaSignatureService, SignatureService, WalletService},
        testing::{SomeTestParams, TestWallet},
    };

    use super::*;

    fn some_contract() -> Contract {
        let offer = SomeTestParams::buy_offer();
        let offerer = SomeTestParams::offerer_identity();
        let taker = SomeTestParams::taker_identity();
        Contract {
            trade_amount: offer.amount,
            offer,
            take_offer_fee_txid: Txid::from_byte_array([7; 32]),
            offerer_account_id: offerer.account_id.clone(),
            taker_account_id: taker.account_id.clone(),
            offerer_fiat_account: offerer.fiat_accounts[0].clone(),
            taker_fiat_account: taker.fiat_accounts[0].clone(),
            offerer_message_pub_key: offerer.message_pub_key,
            taker_message_pub_key: taker.message_pub_key,
        }
    }

    #[test]
    fn test_signature_binds_every_term() {
        let wallet = TestWallet::new(SomeTestParams::offerer_secret_key());
        let registration = wallet.registration_address_entry();
        let service = EcdsaSignatureService::new();

        let contract = some_contract();
        let signature = service
            .sign(&registration.key_pair, &contract.signing_payload().unwrap())
            .unwrap();
        assert!(service.verify(
            &registration.pub_key,
            &contract.signing_payload().unwrap(),
            &signature
        ));

        let mut altered = contract.clone();
        altered.taker_fiat_account.account_details = "GB33 BUKB 2020 1555 5555 55".to_string();
        assert_ne!(altered, contract);
        assert!(!service.verify(
            &registration.pub_key,
            &altered.signing_payload().unwrap(),
            &signature
        ));
    }

    #[test]
    fn test_trade_amount_serialized_in_sats() {
        let json = serde_json::to_value(some_contract()).unwrap();
        assert_eq!(json["trade_amount"], serde_json::json!(1_000_000u64));
        assert_eq!(json["offer"]["amount"], serde_json::json!(1_000_000u64));
    }
}
