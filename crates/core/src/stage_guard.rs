//! Stage transition guard.
//!
//! Every stage proposal made by a reconciliation handler is decided here and
//! nowhere else. The guard only looks at the deal's current stage and payment
//! status, so the outcome depends on persisted state rather than on the order
//! in which provider notifications happened to arrive.

use serde::{Deserialize, Serialize};

use crate::domain::deal::{DealSnapshot, DealStage, PaymentStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The proposed stage sits before the current one.
    Regression { current: DealStage, proposed: DealStage },
    /// Funds cannot be requested while a payment is in flight or settled.
    PaymentInFlight { payment_status: PaymentStatus },
    /// Funds cannot be requested once they have already been provided.
    FundsAlreadyProvided { current: DealStage },
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Regression { current, proposed } => write!(
                f,
                "stage `{}` would regress from `{}`",
                proposed.as_str(),
                current.as_str()
            ),
            Self::PaymentInFlight { payment_status } => write!(
                f,
                "funds already in flight (payment status `{}`)",
                payment_status.as_str()
            ),
            Self::FundsAlreadyProvided { current } => {
                write!(f, "deal already at `{}`", current.as_str())
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision", content = "reason")]
pub enum GuardDecision {
    Allow,
    Deny(DenyReason),
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

pub struct StageGuard;

impl StageGuard {
    /// Rules, in order:
    /// 1. never regress;
    /// 2. entering `FundsRequested` is denied while payment is pending or paid, or once
    ///    the deal has reached `FundsProvided`;
    /// 3. otherwise allow.
    pub fn evaluate(current: DealSnapshot, proposed: DealStage) -> GuardDecision {
        if let GuardDecision::Deny(reason) = Self::evaluate_terminal(current, proposed) {
            return GuardDecision::Deny(reason);
        }

        if proposed == DealStage::FundsRequested {
            if matches!(current.payment_status, PaymentStatus::Pending | PaymentStatus::Paid) {
                return GuardDecision::Deny(DenyReason::PaymentInFlight {
                    payment_status: current.payment_status,
                });
            }
            if current.stage.index() >= DealStage::FundsProvided.index() {
                return GuardDecision::Deny(DenyReason::FundsAlreadyProvided {
                    current: current.stage,
                });
            }
        }

        GuardDecision::Allow
    }

    /// Regression rule only. Used for closing, which is legal whatever the payment state.
    pub fn evaluate_terminal(current: DealSnapshot, proposed: DealStage) -> GuardDecision {
        if proposed.index() < current.stage.index() {
            return GuardDecision::Deny(DenyReason::Regression {
                current: current.stage,
                proposed,
            });
        }
        GuardDecision::Allow
    }
}
