//! The deterministic outcome engine (C6): a pure function from loan facts
//! and evidence to exactly one outcome and transaction type. No I/O; the
//! caller gathers evidence and supplies the clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::psbt::TxType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    CooperativeClose,
    Default,
    Liquidation,
    Cancellation,
    Recovery,
    UnderReview,
}

/// Facts gathered by the caller (C4/C9/transport) before invoking
/// `decide`. The engine itself performs no I/O to collect these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub repayment_confirmed_by_borrower: bool,
    pub repayment_received_by_lender: bool,
    pub current_ltv: Option<f64>,
    pub liquidation_ltv_threshold: f64,
    pub maturity_date: Option<DateTime<Utc>>,
    pub grace_days: i64,
    pub deposit_confirmed_at: Option<DateTime<Utc>>,
    pub fiat_sent_by_lender: bool,
    pub funding_deadline: Option<DateTime<Utc>>,
    pub borrower_signed_recovery: bool,
    pub admin_override: Option<AdminOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminOverride {
    pub outcome: Outcome,
    pub tx_type: Option<TxType>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub rule_fired: &'static str,
    pub tx_type_to_use: Option<TxType>,
    pub reasoning: String,
}

/// Evaluates the rule table in order; first match wins.
/// Never takes a side — the side is picked by which rule fires, not by any
/// preference encoded here.
pub fn decide(evidence: &Evidence, now: DateTime<Utc>) -> Decision {
    // R1 — cooperative close.
    if evidence.repayment_confirmed_by_borrower && evidence.repayment_received_by_lender {
        return Decision {
            outcome: Outcome::CooperativeClose,
            rule_fired: "R1",
            tx_type_to_use: Some(TxType::Repayment),
            reasoning: "both parties confirmed repayment".into(),
        };
    }

    // R2 — default after maturity + grace.
    if let Some(maturity) = evidence.maturity_date {
        let grace_end = maturity + chrono::Duration::days(evidence.grace_days);
        if now > grace_end && !evidence.repayment_received_by_lender {
            return Decision {
                outcome: Outcome::Default,
                rule_fired: "R2",
                tx_type_to_use: Some(TxType::Default),
                reasoning: format!("now {} is past maturity+grace {} with no repayment received", now, grace_end),
            };
        }
    }

    // R3 — LTV liquidation trigger.
    if let Some(ltv) = evidence.current_ltv {
        if ltv >= evidence.liquidation_ltv_threshold {
            return Decision {
                outcome: Outcome::Liquidation,
                rule_fired: "R3",
                tx_type_to_use: Some(TxType::Liquidation),
                reasoning: format!("ltv {:.4} >= threshold {:.4}", ltv, evidence.liquidation_ltv_threshold),
            };
        }
    }

    // R4 — cancellation: deposit confirmed, lender never sent fiat, deadline passed.
    if let (Some(_), Some(deadline)) = (evidence.deposit_confirmed_at, evidence.funding_deadline) {
        if !evidence.fiat_sent_by_lender && now > deadline {
            return if evidence.borrower_signed_recovery {
                Decision {
                    outcome: Outcome::Cancellation,
                    rule_fired: "R4",
                    tx_type_to_use: Some(TxType::Recovery),
                    reasoning: "lender never funded by deadline; borrower-signed recovery used".into(),
                }
            } else {
                Decision {
                    outcome: Outcome::UnderReview,
                    rule_fired: "R4",
                    tx_type_to_use: None,
                    reasoning: "lender never funded by deadline; no borrower-signed recovery, escalating".into(),
                }
            };
        }
    }

    // R5 — explicit admin override.
    if let Some(ref ov) = evidence.admin_override {
        return Decision {
            outcome: ov.outcome,
            rule_fired: "R5",
            tx_type_to_use: ov.tx_type,
            reasoning: "admin-supplied override decision".into(),
        };
    }

    // R6 — default to human review.
    Decision {
        outcome: Outcome::UnderReview,
        rule_fired: "R6",
        tx_type_to_use: None,
        reasoning: "no rule matched".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_evidence() -> Evidence {
        Evidence {
            repayment_confirmed_by_borrower: false,
            repayment_received_by_lender: false,
            current_ltv: None,
            liquidation_ltv_threshold: 0.90,
            maturity_date: None,
            grace_days: 7,
            deposit_confirmed_at: None,
            fiat_sent_by_lender: false,
            funding_deadline: None,
            borrower_signed_recovery: false,
            admin_override: None,
        }
    }

    #[test]
    fn r1_cooperative_close() {
        let mut e = base_evidence();
        e.repayment_confirmed_by_borrower = true;
        e.repayment_received_by_lender = true;
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::CooperativeClose);
        assert_eq!(d.rule_fired, "R1");
    }

    #[test]
    fn r2_default_after_grace() {
        let mut e = base_evidence();
        e.maturity_date = Some(Utc::now() - chrono::Duration::days(10));
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::Default);
        assert_eq!(d.tx_type_to_use, Some(TxType::Default));
    }

    #[test]
    fn r2_does_not_fire_within_grace() {
        let mut e = base_evidence();
        e.maturity_date = Some(Utc::now() - chrono::Duration::days(2));
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::UnderReview);
    }

    #[test]
    fn r3_liquidation_trigger() {
        let mut e = base_evidence();
        e.current_ltv = Some(1.28);
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::Liquidation);
        assert_eq!(d.rule_fired, "R3");
    }

    #[test]
    fn r3_beats_r2_ordering() {
        // R2 is checked before R3 in the table; if maturity hasn't passed
        // but LTV has breached, R3 must still fire.
        let mut e = base_evidence();
        e.maturity_date = Some(Utc::now() + chrono::Duration::days(30));
        e.current_ltv = Some(0.95);
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::Liquidation);
    }

    #[test]
    fn r4_cancellation_with_borrower_recovery_signature() {
        let mut e = base_evidence();
        e.deposit_confirmed_at = Some(Utc::now() - chrono::Duration::days(5));
        e.funding_deadline = Some(Utc::now() - chrono::Duration::days(1));
        e.borrower_signed_recovery = true;
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::Cancellation);
        assert_eq!(d.tx_type_to_use, Some(TxType::Recovery));
    }

    #[test]
    fn r4_without_recovery_signature_escalates() {
        let mut e = base_evidence();
        e.deposit_confirmed_at = Some(Utc::now() - chrono::Duration::days(5));
        e.funding_deadline = Some(Utc::now() - chrono::Duration::days(1));
        e.borrower_signed_recovery = false;
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::UnderReview);
        assert!(d.tx_type_to_use.is_none());
    }

    #[test]
    fn r6_fallthrough_is_under_review() {
        let e = base_evidence();
        let d = decide(&e, Utc::now());
        assert_eq!(d.outcome, Outcome::UnderReview);
        assert_eq!(d.rule_fired, "R6");
    }
}
