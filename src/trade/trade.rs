use std::{
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::SystemTime,
};

use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{
    common::{SignedTx, TradeId},
    error::FiatSwapError,
    offer::Offer,
};

use super::{contract::Contract, state::TradeState};

/// Serialized form of a trade, embedded in the persisted model record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeSnapshot {
    pub id: TradeId,
    pub offer: Offer,
    pub state: TradeState,
    pub deposit_tx: Option<SignedTx>,
    pub payout_tx: Option<SignedTx>,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub trade_amount: Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub security_deposit: Amount,
    pub creation_date: SystemTime,
    #[serde(default)]
    pub contract: Option<Contract>,
    pub failure_reason: Option<String>,
}

#[derive(Debug)]
struct TradeStore {
    state: TradeState,
    deposit_tx: Option<SignedTx>,
    payout_tx: Option<SignedTx>,
    contract: Option<Contract>,
    failure_reason: Option<String>,
}

/// Aggregate root of one negotiation. Cloning yields another handle to the
/// same trade. Every state change is published on a watch channel.
#[derive(Clone)]
pub struct Trade {
    id: TradeId,
    offer: Arc<Offer>,
    trade_amount: Amount,
    security_deposit: Amount,
    creation_date: SystemTime,
    store: Arc<RwLock<TradeStore>>,
    state_tx: Arc<watch::Sender<TradeState>>,
}

impl Trade {
    pub fn new(offer: Offer, trade_amount: Amount) -> Self {
        let store = TradeStore {
            state: TradeState::Preparation,
            deposit_tx: None,
            payout_tx: None,
            contract: None,
            failure_reason: None,
        };
        let security_deposit = offer.security_deposit;
        Self::assemble(offer, trade_amount, security_deposit, SystemTime::now(), store)
    }

    pub fn from_snapshot(snapshot: TradeSnapshot) -> Result<Self, FiatSwapError> {
        if snapshot.id != snapshot.offer.trade_id() {
            return Err(FiatSwapError::contract(format!(
                "Trade snapshot id {} does not match offer {}",
                snapshot.id, snapshot.offer.id
            )));
        }
        if snapshot.state.requires_deposit_tx() && snapshot.deposit_tx.is_none() {
            return Err(FiatSwapError::contract(format!(
                "Trade snapshot {} in state {} without deposit tx",
                snapshot.id, snapshot.state
            )));
        }
        let store = TradeStore {
            state: snapshot.state,
            deposit_tx: snapshot.deposit_tx,
            payout_tx: snapshot.payout_tx,
            contract: snapshot.contract,
            failure_reason: snapshot.failure_reason,
        };
        Ok(Self::assemble(
            snapshot.offer,
            snapshot.trade_amount,
            snapshot.security_deposit,
            snapshot.creation_date,
            store,
        ))
    }

    fn assemble(
        offer: Offer,
        trade_amount: Amount,
        security_deposit: Amount,
        creation_date: SystemTime,
        store: TradeStore,
    ) -> Self {
        let (state_tx, _) = watch::channel(store.state);
        Self {
            id: offer.trade_id(),
            offer: Arc::new(offer),
            trade_amount,
            security_deposit,
            creation_date,
            store: Arc::new(RwLock::new(store)),
            state_tx: Arc::new(state_tx),
        }
    }

    fn read_store(&self) -> RwLockReadGuard<'_, TradeStore> {
        match self.store.read() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error reading trade store - {}", error);
            }
        }
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, TradeStore> {
        match self.store.write() {
            Ok(store) => store,
            Err(error) => {
                panic!("Error writing trade store - {}", error);
            }
        }
    }

    pub fn snapshot(&self) -> TradeSnapshot {
        let store = self.read_store();
        TradeSnapshot {
            id: self.id,
            offer: self.offer.as_ref().clone(),
            state: store.state,
            deposit_tx: store.deposit_tx.clone(),
            payout_tx: store.payout_tx.clone(),
            trade_amount: self.trade_amount,
            security_deposit: self.security_deposit,
            creation_date: self.creation_date,
            contract: store.contract.clone(),
            failure_reason: store.failure_reason.clone(),
        }
    }

    pub fn id(&self) -> TradeId {
        self.id
    }

    pub fn offer(&self) -> &Offer {
        &self.offer
    }

    pub fn trade_amount(&self) -> Amount {
        self.trade_amount
    }

    pub fn security_deposit(&self) -> Amount {
        self.security_deposit
    }

    pub fn creation_date(&self) -> SystemTime {
        self.creation_date
    }

    pub fn state(&self) -> TradeState {
        self.read_store().state
    }

    pub fn deposit_tx(&self) -> Option<SignedTx> {
        self.read_store().deposit_tx.clone()
    }

    pub fn payout_tx(&self) -> Option<SignedTx> {
        self.read_store().payout_tx.clone()
    }

    pub fn contract(&self) -> Option<Contract> {
        self.read_store().contract.clone()
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.read_store().failure_reason.clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<TradeState> {
        self.state_tx.subscribe()
    }

    fn transition(
        &self,
        store: &mut TradeStore,
        next: TradeState,
    ) -> Result<(), FiatSwapError> {
        if !store.state.can_transition_to(next) {
            return Err(FiatSwapError::OutOfPhase {
                trade_id: self.id,
                description: format!("cannot move from {} to {}", store.state, next),
            });
        }
        if next.requires_deposit_tx() && store.deposit_tx.is_none() {
            return Err(FiatSwapError::contract(format!(
                "Trade w/ TradeID {} cannot enter {} without a deposit tx",
                self.id, next
            )));
        }
        if next.requires_payout_tx() && store.payout_tx.is_none() {
            return Err(FiatSwapError::contract(format!(
                "Trade w/ TradeID {} cannot enter {} without a payout tx",
                self.id, next
            )));
        }
        debug!("Trade w/ TradeID {} {} -> {}", self.id, store.state, next);
        store.state = next;
        Ok(())
    }

    fn publish_state(&self, state: TradeState) {
        self.state_tx.send_replace(state);
    }

    /// Moves to `next`. Re-entering the current state is a no-op so that tasks
    /// re-run after a restart stay harmless.
    pub fn set_state(&self, next: TradeState) -> Result<(), FiatSwapError> {
        {
            let mut store = self.write_store();
            if store.state == next {
                trace!("Trade w/ TradeID {} already in {}", self.id, next);
                return Ok(());
            }
            self.transition(&mut store, next)?;
        }
        self.publish_state(next);
        Ok(())
    }

    pub fn publish_deposit(&self, deposit_tx: SignedTx) -> Result<(), FiatSwapError> {
        {
            let mut store = self.write_store();
            if let Some(existing) = &store.deposit_tx {
                if *existing == deposit_tx {
                    return Ok(());
                }
                return Err(FiatSwapError::contract(format!(
                    "Trade w/ TradeID {} already has deposit tx {}",
                    self.id, existing.txid
                )));
            }
            if !store.state.can_transition_to(TradeState::DepositPublished) {
                return Err(FiatSwapError::OutOfPhase {
                    trade_id: self.id,
                    description: format!("cannot publish deposit in {}", store.state),
                });
            }
            store.deposit_tx = Some(deposit_tx);
            self.transition(&mut store, TradeState::DepositPublished)?;
        }
        self.publish_state(TradeState::DepositPublished);
        Ok(())
    }

    /// Settles the contract once. Settling the same contract again is a no-op.
    pub fn set_contract(&self, contract: Contract) -> Result<(), FiatSwapError> {
        let mut store = self.write_store();
        match &store.contract {
            Some(existing) if *existing == contract => Ok(()),
            Some(_) => Err(FiatSwapError::contract(format!(
                "Trade w/ TradeID {} already holds a different contract",
                self.id
            ))),
            None => {
                debug!("Trade w/ TradeID {} contract settled", self.id);
                store.contract = Some(contract);
                Ok(())
            }
        }
    }

    /// Fires only from `DepositPublished`. Returns whether it fired.
    pub fn confirm_deposit(&self) -> bool {
        {
            let mut store = self.write_store();
            if store.state != TradeState::DepositPublished {
                return false;
            }
            if self
                .transition(&mut store, TradeState::DepositConfirmed)
                .is_err()
            {
                return false;
            }
        }
        self.publish_state(TradeState::DepositConfirmed);
        true
    }

    pub fn publish_payout(&self, payout_tx: SignedTx) -> Result<(), FiatSwapError> {
        {
            let mut store = self.write_store();
            if let Some(existing) = &store.payout_tx {
                if *existing == payout_tx {
                    return Ok(());
                }
                return Err(FiatSwapError::contract(format!(
                    "Trade w/ TradeID {} already has payout tx {}",
                    self.id, existing.txid
                )));
            }
            if !store.state.can_transition_to(TradeState::PayoutTxPublished) {
                return Err(FiatSwapError::OutOfPhase {
                    trade_id: self.id,
                    description: format!("cannot publish payout in {}", store.state),
                });
            }
            store.payout_tx = Some(payout_tx);
            self.transition(&mut store, TradeState::PayoutTxPublished)?;
        }
        self.publish_state(TradeState::PayoutTxPublished);
        Ok(())
    }

    /// Fires only from `PayoutTxPublished`. Returns whether it fired.
    pub fn confirm_payout(&self) -> bool {
        {
            let mut store = self.write_store();
            if store.state != TradeState::PayoutTxPublished {
                return false;
            }
            if self.transition(&mut store, TradeState::Completed).is_err() {
                return false;
            }
        }
        self.publish_state(TradeState::Completed);
        true
    }

    pub fn fail(&self, reason: impl Into<String>) -> Result<(), FiatSwapError> {
        {
            let mut store = self.write_store();
            self.transition(&mut store, TradeState::Failed)?;
            store.failure_reason = Some(reason.into());
        }
        self.publish_state(TradeState::Failed);
        Ok(())
    }
}

impl std::fmt::Debug for Trade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trade")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("trade_amount", &self.trade_amount)
            .finish()
    }
}
