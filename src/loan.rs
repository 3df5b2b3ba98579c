//! The loan aggregate and its two state machines (C9).
//!
//! Owns the `Loan` root type, its coarse `status` and fine `escrow_state`
//! transition rules, and the role-gated authorization for who may drive
//! which transition. Mutated only through the methods here — no caller
//! writes a status or escrow_state field directly.

use std::collections::HashMap;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::psbt::TxType;
use crate::{EscrowError, Result};

/// Loan identifiers are a `Txid`-shaped 32-byte id, generated at creation
/// time from a CSPRNG nonce — there is no sequential integer id to collide
/// across replicas and no fixed relationship to any on-chain transaction
/// until the escrow is actually funded.
pub type LoanId = Txid;

/// Computes the satoshi collateral a borrower must deposit to open a loan
/// at `target_ltv_percent` (by default the engine's `initial_target_ltv_percent`).
/// Pure arithmetic, no I/O; the caller supplies a freshly fetched BTC price.
pub fn required_collateral_sats(
    principal_minor_units: u64,
    btc_price_fiat: f64,
    target_ltv_percent: f64,
) -> Result<u64> {
    if btc_price_fiat <= 0.0 || target_ltv_percent <= 0.0 {
        return Err(EscrowError::InvalidConfig(
            "btc_price and target_ltv_percent must be > 0".into(),
        ));
    }
    let principal_major = principal_minor_units as f64 / 100.0;
    let collateral_value_fiat = principal_major / target_ltv_percent;
    Ok((collateral_value_fiat / btc_price_fiat * 100_000_000.0).round() as u64)
}

/// Generates a fresh, non-predictable loan id.
pub fn new_loan_id() -> LoanId {
    use bitcoin::hashes::Hash;
    let mut buf = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buf);
    Txid::from_raw_hash(bitcoin::hashes::sha256d::Hash::hash(&buf))
}

/// Currency code for the fiat leg of the loan. Fiat settlement itself is
/// out of scope; this only labels amounts.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    GBP,
    Custom(String),
}

impl Currency {
    pub fn code(&self) -> &str {
        match self {
            Currency::USD => "USD",
            Currency::EUR => "EUR",
            Currency::GBP => "GBP",
            Currency::Custom(s) => s.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LenderPayoutPreference {
    Fiat,
    Btc,
}

/// Coarse loan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatus {
    Posted,
    Funded,
    EscrowCreated,
    DepositPending,
    Active,
    RepaymentPending,
    Completed,
    Defaulted,
    Liquidated,
    Recovered,
    Cancelled,
}

impl LoanStatus {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            LoanStatus::Completed
                | LoanStatus::Defaulted
                | LoanStatus::Liquidated
                | LoanStatus::Recovered
                | LoanStatus::Cancelled
        )
    }

    /// Whether `self -> next` is one of the monotone edges this machine
    /// allows. Re-entering the current state is always allowed (submission
    /// idempotency), a terminal state never allows any edge.
    fn allows(self, next: LoanStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        use LoanStatus::*;
        matches!(
            (self, next),
            (Posted, Funded)
                | (Funded, EscrowCreated)
                | (EscrowCreated, DepositPending)
                | (DepositPending, Active)
                | (Active, RepaymentPending)
                | (RepaymentPending, Completed)
                | (Active, Defaulted)
                | (Active, Liquidated)
                | (Active, Recovered)
                | (Active, Cancelled)
                | (DepositPending, Cancelled)
                | (EscrowCreated, Cancelled)
        )
    }
}

/// Fine escrow sub-state, meaningful between `funded` and `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    AwaitingBorrowerKey,
    EscrowCreated,
    DepositPending,
    DepositConfirmed,
    TemplatesSigned,
    CollateralReleased,
}

impl EscrowState {
    fn allows(self, next: EscrowState) -> bool {
        if self == next {
            return true;
        }
        if self == EscrowState::CollateralReleased {
            return false;
        }
        use EscrowState::*;
        matches!(
            (self, next),
            (AwaitingBorrowerKey, EscrowCreated)
                | (EscrowCreated, DepositPending)
                | (DepositPending, DepositConfirmed)
                | (DepositConfirmed, TemplatesSigned)
                | (TemplatesSigned, CollateralReleased)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeStatus {
    None,
    UnderReview,
    PendingLenderSignature,
    Resolved,
}

/// The actor driving a transition, used to authorize which transitions are
/// permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Borrower,
    Lender,
    Platform,
}

/// A snapshot of an in-flight resolution attempt, stashed on the loan while
/// the resolution executor works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingResolution {
    pub outcome: crate::outcome::Outcome,
    pub lender_sats: u64,
    pub borrower_sats: u64,
    pub price_used: f64,
    pub psbt_bytes: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loan {
    pub id: LoanId,
    pub borrower: String,
    pub lender: Option<String>,

    pub principal_minor_units: u64,
    pub currency: Currency,
    pub interest_rate_percent: f64,
    pub term_months: u32,

    pub collateral_required_sats: u64,

    pub status: LoanStatus,
    pub escrow_state: EscrowState,
    pub dispute_status: DisputeStatus,

    pub borrower_pubkey: Option<PublicKey>,
    pub lender_pubkey: Option<PublicKey>,
    pub platform_pubkey: PublicKey,

    #[serde(with = "crate::storage::script_serde")]
    pub witness_script: Option<bitcoin::ScriptBuf>,
    #[serde(with = "crate::storage::address_serde")]
    pub escrow_address: Option<Address>,

    pub funding_txid: Option<Txid>,
    pub funding_vout: Option<u32>,
    pub confirmed_amount_sats: Option<u64>,
    pub confirmations: u32,

    #[serde(with = "crate::storage::address_serde")]
    pub borrower_return_address: Option<Address>,
    #[serde(with = "crate::storage::address_serde")]
    pub lender_return_address: Option<Address>,
    pub lender_payout_preference: LenderPayoutPreference,

    pub funded_at: Option<DateTime<Utc>>,
    pub maturity_at: Option<DateTime<Utc>>,
    pub deposit_confirmed_at: Option<DateTime<Utc>>,

    /// Deadline by which the lender must send fiat after the collateral
    /// deposit confirms, set from `commit_funding` time.
    pub funding_deadline: Option<DateTime<Utc>>,
    pub fiat_sent_by_lender: bool,
    pub fiat_sent_at: Option<DateTime<Utc>>,

    pub top_up_monitoring_active: bool,
    pub pending_top_up_sats: Option<u64>,
    pub previous_collateral_sats: Option<u64>,

    pub collateral_released: bool,
    pub collateral_release_txid: Option<Txid>,
    pub collateral_release_error: Option<String>,

    pub pending_resolution: Option<PendingResolution>,

    pub encrypted_lender_privkey: Option<Vec<u8>>,
    pub lender_privkey_nonce: Option<[u8; 12]>,

    pub borrower_signing_complete: bool,

    pub created_at: DateTime<Utc>,
}

impl Loan {
    pub fn new(
        borrower: String,
        principal_minor_units: u64,
        currency: Currency,
        interest_rate_percent: f64,
        term_months: u32,
        collateral_required_sats: u64,
        platform_pubkey: PublicKey,
    ) -> Result<Self> {
        if principal_minor_units == 0 {
            return Err(EscrowError::InvalidConfig("principal must be > 0".into()));
        }
        if interest_rate_percent < 0.0 {
            return Err(EscrowError::InvalidConfig("interest rate must be >= 0".into()));
        }
        if term_months < 1 {
            return Err(EscrowError::InvalidConfig("term_months must be >= 1".into()));
        }
        if collateral_required_sats == 0 {
            return Err(EscrowError::InvalidConfig("collateral must be > 0".into()));
        }

        Ok(Self {
            id: new_loan_id(),
            borrower,
            lender: None,
            principal_minor_units,
            currency,
            interest_rate_percent,
            term_months,
            collateral_required_sats,
            status: LoanStatus::Posted,
            escrow_state: EscrowState::AwaitingBorrowerKey,
            dispute_status: DisputeStatus::None,
            borrower_pubkey: None,
            lender_pubkey: None,
            platform_pubkey,
            witness_script: None,
            escrow_address: None,
            funding_txid: None,
            funding_vout: None,
            confirmed_amount_sats: None,
            confirmations: 0,
            borrower_return_address: None,
            lender_return_address: None,
            lender_payout_preference: LenderPayoutPreference::Fiat,
            funded_at: None,
            maturity_at: None,
            deposit_confirmed_at: None,
            funding_deadline: None,
            fiat_sent_by_lender: false,
            fiat_sent_at: None,
            top_up_monitoring_active: false,
            pending_top_up_sats: None,
            previous_collateral_sats: None,
            collateral_released: false,
            collateral_release_txid: None,
            collateral_release_error: None,
            pending_resolution: None,
            encrypted_lender_privkey: None,
            lender_privkey_nonce: None,
            borrower_signing_complete: false,
            created_at: Utc::now(),
        })
    }

    /// Transitions `status`, refusing non-monotone moves and moves out of a
    /// terminal state. A repeated transition to the current state is a
    /// harmless no-op (submission idempotency).
    pub fn transition_status(&mut self, next: LoanStatus) -> Result<()> {
        if !self.status.allows(next) {
            return Err(EscrowError::InvalidTransition(
                self.id,
                format!("{:?} -> {:?}", self.status, next),
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn transition_escrow_state(&mut self, next: EscrowState) -> Result<()> {
        if !self.escrow_state.allows(next) {
            return Err(EscrowError::InvalidTransition(
                self.id,
                format!("escrow_state {:?} -> {:?}", self.escrow_state, next),
            ));
        }
        self.escrow_state = next;
        Ok(())
    }

    /// Sets the three pubkeys, refusing to write any pair that collides.
    /// Enforces the loan invariant "the three stored pubkeys, when all
    /// present, are pairwise distinct" at write time rather than leaving it
    /// to be checked later and possibly missed.
    pub fn set_borrower_pubkey(&mut self, pubkey: PublicKey) -> Result<()> {
        if self.lender_pubkey == Some(pubkey) || self.platform_pubkey == pubkey {
            return Err(EscrowError::DuplicateKeys);
        }
        self.borrower_pubkey = Some(pubkey);
        Ok(())
    }

    pub fn set_lender_pubkey(&mut self, pubkey: PublicKey) -> Result<()> {
        if self.borrower_pubkey == Some(pubkey) || self.platform_pubkey == pubkey {
            return Err(EscrowError::DuplicateKeys);
        }
        self.lender_pubkey = Some(pubkey);
        Ok(())
    }

    /// Records the first confirmed deposit. Idempotent: a second call with
    /// the same txid is a no-op; `funding_txid` never changes once
    /// `deposit_confirmed_at` is set.
    pub fn confirm_deposit(&mut self, txid: Txid, vout: u32, amount_sats: u64) -> Result<()> {
        if self.deposit_confirmed_at.is_some() {
            if self.funding_txid == Some(txid) {
                return Ok(());
            }
            return Err(EscrowError::InvalidTransition(
                self.id,
                "deposit already confirmed with a different txid".into(),
            ));
        }
        self.funding_txid = Some(txid);
        self.funding_vout = Some(vout);
        self.confirmed_amount_sats = Some(amount_sats);
        let confirmed_at = Utc::now();
        self.deposit_confirmed_at = Some(confirmed_at);
        if self.maturity_at.is_none() {
            self.maturity_at = Some(confirmed_at + chrono::Duration::days(self.term_months as i64 * 30));
        }
        self.transition_escrow_state(EscrowState::DepositConfirmed)?;
        self.transition_status(LoanStatus::Active)
    }

    /// Records the lender's confirmation that the fiat principal has been
    /// sent. Idempotent: a second confirmation leaves the original
    /// timestamp untouched.
    pub fn confirm_fiat_sent(&mut self) {
        if !self.fiat_sent_by_lender {
            self.fiat_sent_by_lender = true;
            self.fiat_sent_at = Some(Utc::now());
        }
    }

    pub fn mark_collateral_released(&mut self, txid: Txid) -> Result<()> {
        self.collateral_released = true;
        self.collateral_release_txid = Some(txid);
        self.collateral_release_error = None;
        self.transition_escrow_state(EscrowState::CollateralReleased)
    }

    /// Requests a top-up from the borrower: the chain monitor will now
    /// watch for an additional UTXO of roughly `additional_sats` landing at
    /// the escrow address. A no-op if a request for the same amount is
    /// already outstanding.
    pub fn request_top_up(&mut self, additional_sats: u64) {
        if self.pending_top_up_sats == Some(additional_sats) {
            return;
        }
        self.top_up_monitoring_active = true;
        self.pending_top_up_sats = Some(additional_sats);
    }

    /// Records a confirmed top-up UTXO, folding it into the tracked
    /// collateral balance and clearing the outstanding request.
    pub fn confirm_top_up(&mut self, _txid: Txid, amount_sats: u64) {
        self.confirmed_amount_sats = Some(self.confirmed_amount_sats.unwrap_or(0) + amount_sats);
        self.top_up_monitoring_active = false;
        self.pending_top_up_sats = None;
    }

    /// Current loan-to-value ratio given a BTC/fiat price, or `None` if
    /// there is no confirmed collateral yet to divide by.
    pub fn current_ltv(&self, btc_price_fiat: f64) -> Option<f64> {
        let sats = self.confirmed_amount_sats?;
        if sats == 0 || btc_price_fiat <= 0.0 {
            return None;
        }
        let collateral_value = (sats as f64 / 100_000_000.0) * btc_price_fiat;
        Some(self.debt_with_interest_fiat() / collateral_value)
    }

    /// Principal plus simple interest prorated for the loan's term, in
    /// major fiat units. `interest_rate_percent` is an annual rate.
    pub fn debt_with_interest_fiat(&self) -> f64 {
        let principal = self.principal_minor_units as f64 / 100.0;
        let term_fraction = self.term_months as f64 / 12.0;
        principal * (1.0 + (self.interest_rate_percent / 100.0) * term_fraction)
    }
}

/// Authorization table for who may drive which coarse-status transition.
pub fn authorize(actor: Actor, from: LoanStatus, to: LoanStatus) -> Result<()> {
    use LoanStatus::*;
    let allowed = match (from, to) {
        (Posted, Funded) => actor == Actor::Lender,
        (Funded, EscrowCreated) => actor == Actor::Borrower,
        (EscrowCreated, DepositPending) => actor == Actor::Borrower,
        (DepositPending, Active) => true, // driven by the chain monitor, not a human actor
        (Active, RepaymentPending) => actor == Actor::Borrower,
        (RepaymentPending, Completed) => actor == Actor::Lender || actor == Actor::Platform,
        (Active, Defaulted) | (Active, Liquidated) | (Active, Recovered) | (Active, Cancelled) => {
            actor == Actor::Platform
        }
        (a, b) if a == b => true,
        _ => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(EscrowError::InvalidTransition(
            Txid::all_zeros(),
            format!("actor {:?} may not drive {:?} -> {:?}", actor, from, to),
        ))
    }
}

/// Used only by [`authorize`]'s error path, which has no loan id in scope.
trait AllZeros {
    fn all_zeros() -> Self;
}
impl AllZeros for Txid {
    fn all_zeros() -> Self {
        use bitcoin::hashes::Hash;
        Txid::from_raw_hash(bitcoin::hashes::sha256d::Hash::all_zeros())
    }
}

/// In-memory index used by the storage adapter's loan lock.
pub type LoanLocks = HashMap<LoanId, std::sync::Arc<tokio::sync::Mutex<()>>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_loan() -> Loan {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let sk = bitcoin::secp256k1::SecretKey::new(&mut rand::thread_rng());
        let platform_pub = PublicKey::from_secret_key(&secp, &sk);
        Loan::new(
            "borrower-1".into(),
            1_000_000,
            Currency::EUR,
            10.0,
            3,
            40_000_000,
            platform_pub,
        )
        .unwrap()
    }

    #[test]
    fn rejects_non_monotone_status_transition() {
        let mut loan = sample_loan();
        assert!(loan.transition_status(LoanStatus::Active).is_err());
    }

    #[test]
    fn terminal_status_is_immutable() {
        let mut loan = sample_loan();
        loan.transition_status(LoanStatus::Funded).unwrap();
        loan.transition_status(LoanStatus::EscrowCreated).unwrap();
        loan.transition_status(LoanStatus::DepositPending).unwrap();
        loan.transition_status(LoanStatus::Active).unwrap();
        loan.transition_status(LoanStatus::Defaulted).unwrap();
        assert!(loan.transition_status(LoanStatus::Active).is_err());
    }

    #[test]
    fn confirm_deposit_is_idempotent() {
        let mut loan = sample_loan();
        loan.transition_status(LoanStatus::Funded).unwrap();
        loan.transition_status(LoanStatus::EscrowCreated).unwrap();
        loan.transition_status(LoanStatus::DepositPending).unwrap();
        loan.transition_escrow_state(EscrowState::EscrowCreated).unwrap();
        loan.transition_escrow_state(EscrowState::DepositPending).unwrap();

        let txid = new_loan_id();
        loan.confirm_deposit(txid, 0, 40_000_000).unwrap();
        assert_eq!(loan.status, LoanStatus::Active);

        // Second call with same txid is a no-op, not an error.
        loan.confirm_deposit(txid, 0, 40_000_000).unwrap();
        assert_eq!(loan.confirmed_amount_sats, Some(40_000_000));
    }

    #[test]
    fn required_collateral_sizes_to_target_ltv() {
        // 10_000 EUR principal at 50_000 EUR/BTC, 50% target LTV -> 0.4 BTC.
        let sats = required_collateral_sats(1_000_000, 50_000.0, 0.50).unwrap();
        assert_eq!(sats, 40_000_000);
    }

    #[test]
    fn confirm_fiat_sent_is_idempotent() {
        let mut loan = sample_loan();
        loan.confirm_fiat_sent();
        let first = loan.fiat_sent_at;
        loan.confirm_fiat_sent();
        assert_eq!(loan.fiat_sent_at, first);
    }

    #[test]
    fn duplicate_pubkey_rejected_at_write_time() {
        let mut loan = sample_loan();
        let platform = loan.platform_pubkey;
        assert!(matches!(
            loan.set_borrower_pubkey(platform),
            Err(EscrowError::DuplicateKeys)
        ));
    }

    #[test]
    fn interest_prorates_by_term_not_full_annual_rate() {
        // 10_000 EUR at 10% annual over a 3-month term -> 10_250 EUR, not 11_000 EUR.
        let loan = sample_loan();
        assert_eq!(loan.debt_with_interest_fiat(), 10_250.0);
    }

    #[test]
    fn loan_debt_feeds_fair_split_with_prorated_interest() {
        let loan = sample_loan();
        let debt_minor_units = (loan.debt_with_interest_fiat() * 100.0).round() as u64;
        assert_eq!(debt_minor_units, 1_025_000);

        let result = crate::fair_split::compute_split(
            debt_minor_units,
            loan.collateral_required_sats,
            50_000.0,
            2_000,
            crate::fair_split::DustPreference::MergeIntoLender,
        );
        assert_eq!(result.lender_sats, 20_500_000);
        assert_eq!(result.borrower_sats, 19_498_000);
        assert!(!result.underwater);
    }
}
