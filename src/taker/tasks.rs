use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    common::{parse_address, FeePolicy},
    error::FiatSwapError,
    message::ProtocolMessage,
    services::{locked_total, DepositTxRequest, PayoutTerms, TradeTxKind},
    task::{Task, TaskOutcome, TaskResult},
    trade::{Contract, TradeState},
};

use super::model::SellerAsTakerModel;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SellerAsTakerTask {
    PayTakeOfferFee,
    SendTakeOfferRequest,
    ProcessRespondToTakeOfferRequest,
    VerifyOffererAccount,
    VerifyContract,
    SignAndPublishDepositTx,
    SendDepositTxPublished,
    ProcessFiatTransferStarted,
    SetFiatPaymentStarted,
    VerifyOffererPayoutSignature,
    SetFiatPaymentReceived,
    SignAndPublishPayoutTx,
    SendPayoutTxPublished,
}

#[async_trait]
impl Task<SellerAsTakerModel> for SellerAsTakerTask {
    async fn run(&self, model: &mut SellerAsTakerModel) -> TaskResult {
        match self {
            SellerAsTakerTask::PayTakeOfferFee => pay_take_offer_fee(model).await,
            SellerAsTakerTask::SendTakeOfferRequest => send_take_offer_request(model).await,
            SellerAsTakerTask::ProcessRespondToTakeOfferRequest => {
                process_respond_to_take_offer_request(model)
            }
            SellerAsTakerTask::VerifyOffererAccount => verify_offerer_account(model),
            SellerAsTakerTask::VerifyContract => verify_contract(model),
            SellerAsTakerTask::SignAndPublishDepositTx => sign_and_publish_deposit_tx(model).await,
            SellerAsTakerTask::SendDepositTxPublished => send_deposit_tx_published(model).await,
            SellerAsTakerTask::ProcessFiatTransferStarted => process_fiat_transfer_started(model),
            SellerAsTakerTask::SetFiatPaymentStarted => {
                model.trade.set_state(TradeState::FiatPaymentStarted)?;
                Ok(TaskOutcome::Complete)
            }
            SellerAsTakerTask::VerifyOffererPayoutSignature => {
                verify_offerer_payout_signature(model)
            }
            SellerAsTakerTask::SetFiatPaymentReceived => {
                model.trade.set_state(TradeState::FiatPaymentReceived)?;
                Ok(TaskOutcome::Complete)
            }
            SellerAsTakerTask::SignAndPublishPayoutTx => sign_and_publish_payout_tx(model).await,
            SellerAsTakerTask::SendPayoutTxPublished => send_payout_tx_published(model).await,
        }
    }
}

fn missing_inbound(task: &str) -> FiatSwapError {
    FiatSwapError::contract(format!("{} ran without its inbound message", task))
}

async fn pay_take_offer_fee(model: &mut SellerAsTakerModel) -> TaskResult {
    let trade_id = model.trade.id();
    if !model.take_offer_fee_tx.is_set() {
        // A crash between broadcast and persist leaves the fee only in the wallet.
        let fee_tx = match model
            .shared
            .wallet()
            .find_trade_tx(trade_id, TradeTxKind::TakeOfferFee)
        {
            Some(fee_tx) => {
                debug!("Trade w/ TradeID {} reusing fee tx {}", trade_id, fee_tx.txid);
                fee_tx
            }
            None => match model.shared.wallet().pay_take_offer_fee(trade_id).await {
                Ok(fee_tx) => fee_tx,
                Err(error) => return TaskOutcome::from_service_error(error),
            },
        };
        info!("Trade w/ TradeID {} take offer fee paid in {}", trade_id, fee_tx.txid);
        model.take_offer_fee_tx.set("take_offer_fee_tx", fee_tx)?;
    }
    model.trade.set_state(TradeState::TakeOfferFeePaid)?;
    Ok(TaskOutcome::Complete)
}

async fn send_take_offer_request(model: &mut SellerAsTakerModel) -> TaskResult {
    let taker = &model.taker.identity;
    let message = ProtocolMessage::RequestTakeOffer {
        trade_id: model.trade.id(),
        trade_amount: model.trade.trade_amount(),
        take_offer_fee_txid: model.take_offer_fee_tx.require("take_offer_fee_tx")?.txid,
        taker_account_id: taker.account_id.require("taker.account_id")?.clone(),
        taker_pub_key: *taker.pub_key.require("taker.pub_key")?,
        taker_message_pub_key: *taker.message_pub_key.require("taker.message_pub_key")?,
        taker_fiat_account: taker.fiat_account.require("taker.fiat_account")?.clone(),
        taker_peer: taker.require_peer()?.clone(),
    };
    let peer = model.offerer.identity.require_peer()?.clone();
    model.shared.send_message(&peer, message).await
}

fn process_respond_to_take_offer_request(model: &mut SellerAsTakerModel) -> TaskResult {
    let Some(ProtocolMessage::RespondToTakeOfferRequest {
        offerer_account_id,
        offerer_registration_pub_key,
        offerer_pub_key,
        offerer_fiat_account,
        offerer_deposit_inputs,
        ..
    }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("ProcessRespondToTakeOfferRequest"));
    };

    let required = model.trade.security_deposit();
    if offerer_deposit_inputs.contribution < required {
        return Ok(TaskOutcome::failed_verification(format!(
            "Offerer contribution {} below required {}.",
            offerer_deposit_inputs.contribution, required
        )));
    }
    let Some(taker_contribution) =
        FeePolicy::taker_contribution(model.trade.trade_amount(), model.trade.security_deposit())
    else {
        return Ok(TaskOutcome::failed_verification(format!(
            "Trade amount {} out of range.",
            model.trade.trade_amount()
        )));
    };
    if locked_total(offerer_deposit_inputs.contribution, taker_contribution).is_none() {
        return Ok(TaskOutcome::failed_verification(format!(
            "Offerer contribution {} out of range.",
            offerer_deposit_inputs.contribution
        )));
    }

    let offerer = &mut model.offerer;
    offerer
        .identity
        .account_id
        .set("offerer.account_id", offerer_account_id)?;
    offerer
        .identity
        .registration_pub_key
        .set("offerer.registration_pub_key", offerer_registration_pub_key)?;
    offerer
        .identity
        .pub_key
        .set("offerer.pub_key", offerer_pub_key)?;
    offerer
        .identity
        .fiat_account
        .set("offerer.fiat_account", offerer_fiat_account)?;
    offerer
        .deposit_inputs
        .set("offerer.deposit_inputs", offerer_deposit_inputs)?;
    Ok(TaskOutcome::Complete)
}

fn verify_offerer_account(model: &mut SellerAsTakerModel) -> TaskResult {
    let identity = &model.offerer.identity;
    let account_id = identity.account_id.require("offerer.account_id")?;
    if !model
        .shared
        .block_chain()
        .verify_account_registration(account_id)
    {
        return Ok(TaskOutcome::failed_verification(
            "Account registration validation for peer faultHandler.onFault.",
        ));
    }
    let fiat_account = identity.fiat_account.require("offerer.fiat_account")?;
    if model
        .shared
        .block_chain()
        .is_account_black_listed(account_id, fiat_account)
    {
        return Ok(TaskOutcome::failed_verification("Offerer is blacklisted."));
    }
    Ok(TaskOutcome::Complete)
}

/// The offerer's copy must equal the one rebuilt from what this side knows,
/// and carry a valid signature by the offerer's registration key.
fn verify_contract(model: &mut SellerAsTakerModel) -> TaskResult {
    let Some(ProtocolMessage::RespondToTakeOfferRequest {
        contract,
        contract_signature,
        ..
    }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("VerifyContract"));
    };

    let offerer = &model.offerer.identity;
    let taker = &model.taker.identity;
    let expected = Contract {
        offer: model.trade.offer().clone(),
        trade_amount: model.trade.trade_amount(),
        take_offer_fee_txid: model.take_offer_fee_tx.require("take_offer_fee_tx")?.txid,
        offerer_account_id: offerer.account_id.require("offerer.account_id")?.clone(),
        taker_account_id: taker.account_id.require("taker.account_id")?.clone(),
        offerer_fiat_account: offerer.fiat_account.require("offerer.fiat_account")?.clone(),
        taker_fiat_account: taker.fiat_account.require("taker.fiat_account")?.clone(),
        offerer_message_pub_key: *offerer
            .message_pub_key
            .require("offerer.message_pub_key")?,
        taker_message_pub_key: *taker.message_pub_key.require("taker.message_pub_key")?,
    };
    if contract != expected {
        return Ok(TaskOutcome::failed_verification(
            "Contract does not match the negotiated trade.",
        ));
    }
    let registration_pub_key = offerer
        .registration_pub_key
        .require("offerer.registration_pub_key")?;
    if !model.shared.signature().verify(
        registration_pub_key,
        &contract.signing_payload()?,
        &contract_signature,
    ) {
        return Ok(TaskOutcome::failed_verification(
            "Offerer contract signature is invalid.",
        ));
    }

    model
        .offerer
        .contract_signature
        .set("offerer.contract_signature", contract_signature)?;
    model.trade.set_contract(contract)?;
    Ok(TaskOutcome::Complete)
}

async fn sign_and_publish_deposit_tx(model: &mut SellerAsTakerModel) -> TaskResult {
    let trade_id = model.trade.id();
    let Some(contribution) =
        FeePolicy::taker_contribution(model.trade.trade_amount(), model.trade.security_deposit())
    else {
        return Ok(TaskOutcome::failed_verification(format!(
            "Trade amount {} out of range.",
            model.trade.trade_amount()
        )));
    };

    if !model.published_deposit_tx.is_set() {
        let deposit_tx = match model
            .shared
            .wallet()
            .find_trade_tx(trade_id, TradeTxKind::Deposit)
        {
            Some(deposit_tx) => deposit_tx,
            None => {
                let request = DepositTxRequest {
                    offerer_inputs: model
                        .offerer
                        .deposit_inputs
                        .require("offerer.deposit_inputs")?
                        .clone(),
                    offerer_pub_key: *model.offerer.identity.pub_key.require("offerer.pub_key")?,
                    taker_pub_key: *model.taker.identity.pub_key.require("taker.pub_key")?,
                    taker_contribution: contribution,
                };
                match model
                    .shared
                    .wallet()
                    .sign_and_publish_deposit_tx(trade_id, request)
                    .await
                {
                    Ok(deposit_tx) => deposit_tx,
                    Err(error) => return TaskOutcome::from_service_error(error),
                }
            }
        };
        model
            .published_deposit_tx
            .set("published_deposit_tx", deposit_tx)?;
    }

    model
        .taker
        .contribution
        .set("taker.contribution", contribution)?;
    let deposit_tx = model
        .published_deposit_tx
        .require("published_deposit_tx")?
        .clone();
    info!(
        "Trade w/ TradeID {} deposit {} published",
        trade_id, deposit_tx.txid
    );
    model.trade.publish_deposit(deposit_tx)?;
    Ok(TaskOutcome::Complete)
}

async fn send_deposit_tx_published(model: &mut SellerAsTakerModel) -> TaskResult {
    let taker = &model.taker;
    let message = ProtocolMessage::DepositTxPublished {
        trade_id: model.trade.id(),
        deposit_tx: model
            .published_deposit_tx
            .require("published_deposit_tx")?
            .clone(),
        taker_contribution: *taker.contribution.require("taker.contribution")?,
        taker_payout_address: taker
            .payout_address
            .require("taker.payout_address")?
            .clone(),
    };
    let peer = model.offerer.identity.require_peer()?.clone();
    model.shared.send_message(&peer, message).await
}

fn process_fiat_transfer_started(model: &mut SellerAsTakerModel) -> TaskResult {
    let Some(ProtocolMessage::FiatTransferStarted {
        offerer_signature,
        payout_terms,
        ..
    }) = model.inbound_message.clone()
    else {
        return Err(missing_inbound("ProcessFiatTransferStarted"));
    };

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

    // The offerer picks its own payout address, everything else is fixed by
    // what both sides locked.
    let expected = match PayoutTerms::for_buyer_as_offerer(
        model.trade.trade_amount(),
        offerer_contribution,
        taker_contribution,
        payout_terms.offerer_address.clone(),
        taker_address,
    ) {
        Ok(expected) => expected,
        Err(error) => {
            return Ok(TaskOutcome::failed_verification(format!(
                "Locked deposit cannot be paid out - {}",
                error
            )))
        }
    };
    if expected != payout_terms {
        return Ok(TaskOutcome::failed_verification(
            "Payout terms do not match the locked deposit.",
        ));
    }
    if let Err(error) = parse_address(&payout_terms.offerer_address, model.shared.config().network)
    {
        return Ok(TaskOutcome::failed_verification(format!(
            "Offerer payout address rejected - {}",
            error
        )));
    }

    model.payout_terms.set("payout_terms", payout_terms)?;
    model
        .offerer
        .payout_signature
        .set("offerer.payout_signature", offerer_signature)?;
    Ok(TaskOutcome::Complete)
}

fn verify_offerer_payout_signature(model: &mut SellerAsTakerModel) -> TaskResult {
    let deposit_tx = model
        .trade
        .deposit_tx()
        .ok_or_else(|| FiatSwapError::contract("payout signature checked without a deposit tx"))?;
    let terms = model.payout_terms.require("payout_terms")?;
    let signature = model
        .offerer
        .payout_signature
        .require("offerer.payout_signature")?;
    let offerer_pub_key = model.offerer.identity.pub_key.require("offerer.pub_key")?;

    let sighash = match model.shared.wallet().payout_sighash(&deposit_tx, terms) {
        Ok(sighash) => sighash,
        Err(error) => return TaskOutcome::from_service_error(error),
    };
    if !model
        .shared
        .signature()
        .verify(offerer_pub_key, &sighash, signature)
    {
        return Ok(TaskOutcome::failed_verification(
            "Offerer payout signature is invalid.",
        ));
    }
    Ok(TaskOutcome::Complete)
}

async fn sign_and_publish_payout_tx(model: &mut SellerAsTakerModel) -> TaskResult {
    if model.trade.payout_tx().is_some() {
        return Ok(TaskOutcome::Complete);
    }
    let trade_id = model.trade.id();
    let payout_tx = match model
        .shared
        .wallet()
        .find_trade_tx(trade_id, TradeTxKind::Payout)
    {
        Some(payout_tx) => payout_tx,
        None => {
            let deposit_tx = model.trade.deposit_tx().ok_or_else(|| {
                FiatSwapError::contract("SignAndPublishPayoutTx without a deposit tx")
            })?;
            let terms = model.payout_terms.require("payout_terms")?;
            let signature = model
                .offerer
                .payout_signature
                .require("offerer.payout_signature")?;
            match model
                .shared
                .wallet()
                .sign_and_publish_payout_tx(trade_id, &deposit_tx, terms, signature)
                .await
            {
                Ok(payout_tx) => payout_tx,
                Err(error) => return TaskOutcome::from_service_error(error),
            }
        }
    };
    info!(
        "Trade w/ TradeID {} payout {} published",
        trade_id, payout_tx.txid
    );
    model.trade.publish_payout(payout_tx)?;
    Ok(TaskOutcome::Complete)
}

async fn send_payout_tx_published(model: &mut SellerAsTakerModel) -> TaskResult {
    let payout_tx = model
        .trade
        .payout_tx()
        .ok_or_else(|| FiatSwapError::contract("SendPayoutTxPublished without a payout tx"))?;
    let message = ProtocolMessage::PayoutTxPublished {
        trade_id: model.trade.id(),
        payout_tx,
    };
    let peer = model.offerer.identity.require_peer()?.clone();
    model.shared.send_message(&peer, message).await
}
