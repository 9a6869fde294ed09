use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    common::{parse_address, FeePolicy, TxConfidence},
    error::FiatSwapError,
    message::ProtocolMessage,
    services::{locked_total, PayoutTerms},
    task::{Task, TaskOutcome, TaskResult},
    trade::{Contract, TradeState},
};

use super::model::BuyerAsOffererModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuyerAsOffererTask {
    ProcessRequestTakeOffer,
    VerifyTakeOfferFeePayment,
    VerifyTakerAccount,
    CreateDepositInputs,
    CreateAndSignContract,
    RespondToTakeOfferRequest,
    ProcessDepositTxPublished,
    SetDepositPublished,
    SignPayoutTx,
    SendFiatTransferStarted,
    SetFiatPaymentStarted,
    ProcessPayoutTxPublished,
}

#[async_trait]
impl Task<BuyerAsOffererModel> for BuyerAsOffererTask {
    async fn run(&self, model: &mut BuyerAsOffererModel) -> TaskResult {
        match self {
            BuyerAsOffererTask::ProcessRequestTakeOffer => process_request_take_offer(model),
            BuyerAsOffererTask::VerifyTakeOfferFeePayment => verify_take_offer_fee_payment(model),
            BuyerAsOffererTask::VerifyTakerAccount => verify_taker_account(model),
            BuyerAsOffererTask::CreateDepositInputs => create_deposit_inputs(model).await,
            BuyerAsOffererTask::CreateAndSignContract => create_and_sign_contract(model),
            BuyerAsOffererTask::RespondToTakeOfferRequest => {
                respond_to_take_offer_request(model).await
            }
            BuyerAsOffererTask::ProcessDepositTxPublished => process_deposit_tx_published(model),
            BuyerAsOffererTask::SetDepositPublished => set_deposit_published(model),
            BuyerAsOffererTask::SignPayoutTx => sign_payout_tx(model),
            BuyerAsOffererTask::SendFiatTransferStarted => send_fiat_transfer_started(model).await,
            BuyerAsOffererTask::SetFiatPaymentStarted => {
                model.trade.set_state(TradeState::FiatPaymentStarted)?;
                Ok(TaskOutcome::Complete)
            }
            BuyerAsOffererTask::ProcessPayoutTxPublished => process_payout_tx_published(model),
        }
    }
}

fn missing_inbound(task: &str) -> FiatSwapError {
    FiatSwapError::contract(format!("{} ran without its inbound message", task))
}

fn process_request_take_offer(model: &mut BuyerAsOffererModel) -> TaskResult {
    let Some(ProtocolMessage::RequestTakeOffer {
        trade_amount,
        take_offer_fee_txid,
        taker_account_id,
        taker_pub_key,
        taker_message_pub_key,
        taker_fiat_account,
        taker_peer,
        ..
    }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("ProcessRequestTakeOffer"));
    };

    if trade_amount != model.trade.trade_amount() {
        return Ok(TaskOutcome::failed_verification(format!(
            "Requested amount {} does not match trade amount {}.",
            trade_amount,
            model.trade.trade_amount()
        )));
    }

    let taker = &mut model.taker.identity;
    taker.account_id.set("taker.account_id", taker_account_id)?;
    taker.pub_key.set("taker.pub_key", taker_pub_key)?;
    taker
        .message_pub_key
        .set("taker.message_pub_key", taker_message_pub_key)?;
    taker
        .fiat_account
        .set("taker.fiat_account", taker_fiat_account)?;
    taker.peer = Some(taker_peer);
    model
        .take_offer_fee_txid
        .set("take_offer_fee_txid", take_offer_fee_txid)?;
    Ok(TaskOutcome::Complete)
}

fn verify_take_offer_fee_payment(model: &mut BuyerAsOffererModel) -> TaskResult {
    let txid = *model.take_offer_fee_txid.require("take_offer_fee_txid")?;
    match model.shared.wallet().confidence_for_txid(&txid) {
        Some(TxConfidence::Pending) | Some(TxConfidence::Building { .. }) => {
            Ok(TaskOutcome::Complete)
        }
        _ => Ok(TaskOutcome::failed_verification(format!(
            "Take offer fee payment {} not found.",
            txid
        ))),
    }
}

fn verify_taker_account(model: &mut BuyerAsOffererModel) -> TaskResult {
    let account_id = model.taker.identity.account_id.require("taker.account_id")?;
    if !model
        .shared
        .block_chain()
        .verify_account_registration(account_id)
    {
        return Ok(TaskOutcome::failed_verification(
            "Account registration validation for peer faultHandler.onFault.",
        ));
    }
    Ok(TaskOutcome::Complete)
}

async fn create_deposit_inputs(model: &mut BuyerAsOffererModel) -> TaskResult {
    if model.offerer.deposit_inputs.is_set() {
        return Ok(TaskOutcome::Complete);
    }
    let contribution = model.trade.security_deposit();
    let inputs = match model
        .shared
        .wallet()
        .create_deposit_inputs(model.trade.id(), contribution)
        .await
    {
        Ok(inputs) => inputs,
        Err(error) => return TaskOutcome::from_service_error(error),
    };
    model
        .offerer
        .deposit_inputs
        .set("offerer.deposit_inputs", inputs)?;
    Ok(TaskOutcome::Complete)
}

fn create_and_sign_contract(model: &mut BuyerAsOffererModel) -> TaskResult {
    if model.trade.contract().is_some() && model.offerer.contract_signature.is_set() {
        return Ok(TaskOutcome::Complete);
    }
    let offerer = &model.offerer.identity;
    let taker = &model.taker.identity;
    let contract = Contract {
        offer: model.trade.offer().clone(),
        trade_amount: model.trade.trade_amount(),
        take_offer_fee_txid: *model.take_offer_fee_txid.require("take_offer_fee_txid")?,
        offerer_account_id: offerer.account_id.require("offerer.account_id")?.clone(),
        taker_account_id: taker.account_id.require("taker.account_id")?.clone(),
        offerer_fiat_account: offerer.fiat_account.require("offerer.fiat_account")?.clone(),
        taker_fiat_account: taker.fiat_account.require("taker.fiat_account")?.clone(),
        offerer_message_pub_key: *offerer
            .message_pub_key
            .require("offerer.message_pub_key")?,
        taker_message_pub_key: *taker.message_pub_key.require("taker.message_pub_key")?,
    };
    let keys = offerer.require_local_keys()?;
    let signature = match model
        .shared
        .signature()
        .sign(&keys.registration_key_pair, &contract.signing_payload()?)
    {
        Ok(signature) => signature,
        Err(error) => return TaskOutcome::from_service_error(error),
    };

    model
        .offerer
        .contract_signature
        .set("offerer.contract_signature", signature)?;
    model.trade.set_contract(contract)?;
    Ok(TaskOutcome::Complete)
}

async fn respond_to_take_offer_request(model: &mut BuyerAsOffererModel) -> TaskResult {
    let offerer = &model.offerer;
    let message = ProtocolMessage::RespondToTakeOfferRequest {
        trade_id: model.trade.id(),
        offerer_account_id: offerer
            .identity
            .account_id
            .require("offerer.account_id")?
            .clone(),
        offerer_registration_pub_key: *offerer
            .identity
            .registration_pub_key
            .require("offerer.registration_pub_key")?,
        offerer_pub_key: *offerer.identity.pub_key.require("offerer.pub_key")?,
        offerer_fiat_account: offerer
            .identity
            .fiat_account
            .require("offerer.fiat_account")?
            .clone(),
        offerer_deposit_inputs: offerer
            .deposit_inputs
            .require("offerer.deposit_inputs")?
            .clone(),
        contract: model
            .trade
            .contract()
            .ok_or_else(|| FiatSwapError::contract("RespondToTakeOfferRequest without a contract"))?,
        contract_signature: offerer
            .contract_signature
            .require("offerer.contract_signature")?
            .clone(),
    };
    let peer = model.taker.identity.require_peer()?.clone();
    model.shared.send_message(&peer, message).await
}

fn process_deposit_tx_published(model: &mut BuyerAsOffererModel) -> TaskResult {
    let Some(ProtocolMessage::DepositTxPublished {
        deposit_tx,
        taker_contribution,
        taker_payout_address,
        ..
    }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("ProcessDepositTxPublished"));
    };

    let taker = &model.taker.identity;
    let account_id = taker.account_id.require("taker.account_id")?;
    let fiat_account = taker.fiat_account.require("taker.fiat_account")?;
    if model
        .shared
        .block_chain()
        .is_account_black_listed(account_id, fiat_account)
    {
        return Ok(TaskOutcome::failed_verification("Taker is blacklisted."));
    }

    let Some(required) =
        FeePolicy::taker_contribution(model.trade.trade_amount(), model.trade.security_deposit())
    else {
        return Ok(TaskOutcome::failed_verification(format!(
            "Trade amount {} out of range.",
            model.trade.trade_amount()
        )));
    };
    if taker_contribution < required {
        return Ok(TaskOutcome::failed_verification(format!(
            "Taker contribution {} below required {}.",
            taker_contribution, required
        )));
    }
    let offerer_contribution = model
        .offerer
        .deposit_inputs
        .require("offerer.deposit_inputs")?
        .contribution;
    if locked_total(offerer_contribution, taker_contribution).is_none() {
        return Ok(TaskOutcome::failed_verification(format!(
            "Taker contribution {} out of range.",
            taker_contribution
        )));
    }
    if let Err(error) = parse_address(&taker_payout_address, model.shared.config().network) {
        return Ok(TaskOutcome::failed_verification(format!(
            "Taker payout address rejected - {}",
            error
        )));
    }

    let taker = &mut model.taker;
    taker
        .contribution
        .set("taker.contribution", taker_contribution)?;
    taker
        .payout_address
        .set("taker.payout_address", taker_payout_address)?;
    model
        .published_deposit_tx
        .set("published_deposit_tx", deposit_tx)?;
    Ok(TaskOutcome::Complete)
}

fn set_deposit_published(model: &mut BuyerAsOffererModel) -> TaskResult {
    let deposit_tx = model
        .published_deposit_tx
        .require("published_deposit_tx")?
        .clone();
    info!(
        "Trade w/ TradeID {} deposit {} published by taker",
        model.trade.id(),
        deposit_tx.txid
    );
    model.trade.publish_deposit(deposit_tx)?;
    Ok(TaskOutcome::Complete)
}

fn sign_payout_tx(model: &mut BuyerAsOffererModel) -> TaskResult {
    if model.payout_terms.is_set() && model.offerer.payout_signature.is_set() {
        return Ok(TaskOutcome::Complete);
    }
    let deposit_tx = model
        .trade
        .deposit_tx()
        .ok_or_else(|| FiatSwapError::contract("SignPayoutTx without a deposit tx"))?;
    let keys = model.offerer.identity.require_local_keys()?.clone();
    let offerer_contribution = model
        .offerer
        .deposit_inputs
        .require("offerer.deposit_inputs")?
        .contribution;
    let taker_contribution = *model.taker.contribution.require("taker.contribution")?;
    let taker_address = model
        .taker
        .payout_address
        .require("taker.payout_address")?
        .clone();

    let terms = match PayoutTerms::for_buyer_as_offerer(
        model.trade.trade_amount(),
        offerer_contribution,
        taker_contribution,
        keys.address_entry.address.clone(),
        taker_address,
    ) {
        Ok(terms) => terms,
        Err(error) => {
            return Ok(TaskOutcome::failed_verification(format!(
                "Locked deposit cannot be paid out - {}",
                error
            )))
        }
    };
    let sighash = match model.shared.wallet().payout_sighash(&deposit_tx, &terms) {
        Ok(sighash) => sighash,
        Err(error) => return TaskOutcome::from_service_error(error),
    };
    let signature = match model
        .shared
        .signature()
        .sign(&keys.address_entry.key_pair, &sighash)
    {
        Ok(signature) => signature,
        Err(error) => return TaskOutcome::from_service_error(error),
    };

    model.payout_terms.set("payout_terms", terms)?;
    model
        .offerer
        .payout_signature
        .set("offerer.payout_signature", signature)?;
    Ok(TaskOutcome::Complete)
}

async fn send_fiat_transfer_started(model: &mut BuyerAsOffererModel) -> TaskResult {
    let message = ProtocolMessage::FiatTransferStarted {
        trade_id: model.trade.id(),
        offerer_signature: model
            .offerer
            .payout_signature
            .require("offerer.payout_signature")?
            .clone(),
        payout_terms: model.payout_terms.require("payout_terms")?.clone(),
    };
    let peer = model.taker.identity.require_peer()?.clone();
    model.shared.send_message(&peer, message).await
}

fn process_payout_tx_published(model: &mut BuyerAsOffererModel) -> TaskResult {
    let Some(ProtocolMessage::PayoutTxPublished { payout_tx, .. }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("ProcessPayoutTxPublished"));
    };
    info!(
        "Trade w/ TradeID {} payout {} published by taker",
        model.trade.id(),
        payout_tx.txid
    );
    model.trade.publish_payout(payout_tx)?;
    Ok(TaskOutcome::Complete)
}
