use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeState {
    Preparation,
    TakeOfferFeePaid,
    DepositPublished,
    DepositConfirmed,
    FiatPaymentStarted,
    FiatPaymentReceived,
    PayoutTxPublished,
    Completed,
    Failed,
}

impl TradeState {
    /// Position on the forward path. `Failed` sits beside it.
    fn rank(&self) -> Option<u8> {
        match self {
            TradeState::Preparation => Some(0),
            TradeState::TakeOfferFeePaid => Some(1),
            TradeState::DepositPublished => Some(2),
            TradeState::DepositConfirmed => Some(3),
            TradeState::FiatPaymentStarted => Some(4),
            TradeState::FiatPaymentReceived => Some(5),
            TradeState::PayoutTxPublished => Some(6),
            TradeState::Completed => Some(7),
            TradeState::Failed => None,
        }
    }

    // The offerer never pays a take offer fee, and only the taker passes
    // through FiatPaymentReceived, hence the two-entry lists.
    fn predecessors(&self) -> &'static [TradeState] {
        match self {
            TradeState::Preparation => &[],
            TradeState::TakeOfferFeePaid => &[TradeState::Preparation],
            TradeState::DepositPublished => {
                &[TradeState::Preparation, TradeState::TakeOfferFeePaid]
            }
            TradeState::DepositConfirmed => &[TradeState::DepositPublished],
            TradeState::FiatPaymentStarted => &[TradeState::DepositConfirmed],
            TradeState::FiatPaymentReceived => &[TradeState::FiatPaymentStarted],
            TradeState::PayoutTxPublished => &[
                TradeState::FiatPaymentStarted,
                TradeState::FiatPaymentReceived,
            ],
            TradeState::Completed => &[TradeState::PayoutTxPublished],
            TradeState::Failed => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Completed | TradeState::Failed)
    }

    pub fn can_transition_to(&self, next: TradeState) -> bool {
        match next {
            TradeState::Failed => !self.is_terminal(),
            _ => next.predecessors().contains(self),
        }
    }

    pub fn requires_deposit_tx(&self) -> bool {
        self.rank() >= TradeState::DepositPublished.rank()
    }

    pub fn requires_payout_tx(&self) -> bool {
        self.rank() >= TradeState::PayoutTxPublished.rank()
    }

    /// Funds are multisig locked from here on; only payout remains.
    pub fn is_deposit_confirmed(&self) -> bool {
        self.rank() >= TradeState::DepositConfirmed.rank()
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TradeState; 9] = [
        TradeState::Preparation,
        TradeState::TakeOfferFeePaid,
        TradeState::DepositPublished,
        TradeState::DepositConfirmed,
        TradeState::FiatPaymentStarted,
        TradeState::FiatPaymentReceived,
        TradeState::PayoutTxPublished,
        TradeState::Completed,
        TradeState::Failed,
    ];

    #[test]
    fn test_transitions_only_move_forward() {
        for from in ALL {
            for to in ALL {
                if to == TradeState::Failed || !from.can_transition_to(to) {
                    continue;
                }
                assert!(
                    from.rank() < to.rank(),
                    "{} -> {} regresses",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        for from in ALL {
            assert_eq!(from.can_transition_to(TradeState::Failed), !from.is_terminal());
        }
    }

    #[test]
    fn test_deposit_confirmation_requires_published() {
        assert!(TradeState::DepositPublished.can_transition_to(TradeState::DepositConfirmed));
        assert!(!TradeState::Preparation.can_transition_to(TradeState::DepositConfirmed));
        assert!(!TradeState::DepositConfirmed.can_transition_to(TradeState::DepositConfirmed));
        assert!(!TradeState::FiatPaymentStarted.can_transition_to(TradeState::FiatPaymentStarted));
    }

    #[test]
    fn test_requires_deposit_and_payout() {
        assert!(!TradeState::TakeOfferFeePaid.requires_deposit_tx());
        assert!(TradeState::DepositPublished.requires_deposit_tx());
        assert!(TradeState::Completed.requires_deposit_tx());
        assert!(!TradeState::Failed.requires_deposit_tx());
        assert!(!TradeState::FiatPaymentReceived.requires_payout_tx());
        assert!(TradeState::PayoutTxPublished.requires_payout_tx());
    }
}
