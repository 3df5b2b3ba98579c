//! Escrow protocol engine for a Bitcoin-collateralized peer-to-peer fiat
//! lending rail.
//!
//! The nine inbound control operations are exposed as plain
//! async methods on [`EscrowEngine`], which wires together the key ceremony
//! (`keys`), PSBT builder (`psbt`), signature store (`signatures`), chain
//! monitor (`chain_monitor`), price oracle (`price_oracle`), outcome engine
//! (`outcome`), fair-split calculator (`fair_split`), resolution executor
//! (`resolution`), the loan aggregate (`loan`), and the persistence adapter
//! (`storage`). See `src/bin/` for the three long-running processes that
//! drive the engine in production: `escrow-lend-cli`, `escrow-lend-monitor`,
//! `escrow-lend-resolver`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Txid};
use chrono::Utc;

pub mod chain_monitor;
pub mod config;
pub mod error;
pub mod fair_split;
pub mod keys;
pub mod loan;
pub mod outcome;
pub mod price_oracle;
pub mod psbt;
pub mod resolution;
pub mod signatures;
pub mod storage;

pub use chain_monitor::ChainIndexer;
pub use config::EngineConfig;
pub use error::{EscrowError, Result};
pub use loan::{Currency, DisputeStatus, EscrowState, LenderPayoutPreference, Loan, LoanId, LoanStatus};
pub use outcome::{AdminOverride, Decision, Evidence, Outcome};
pub use price_oracle::PriceFeed;
pub use psbt::TxType;
pub use resolution::DisputeAuditLog;
pub use storage::StorageAdapter;

/// The escrow protocol engine: a facade over every component, one async
/// method per inbound control operation. Owns the one
/// platform signing key and KMS data-encryption key shared by every loan
/// this instance services.
pub struct EscrowEngine {
    config: EngineConfig,
    storage: StorageAdapter,
    indexer: Box<dyn ChainIndexer>,
    price_feed: Box<dyn PriceFeed>,
    platform_secret_key: SecretKey,
    kms_key: [u8; 32],
    emergency_recovery_windows: StdMutex<HashMap<LoanId, signatures::SubmissionWindow>>,
}

impl EscrowEngine {
    pub fn new(
        config: EngineConfig,
        storage: StorageAdapter,
        indexer: Box<dyn ChainIndexer>,
        price_feed: Box<dyn PriceFeed>,
        platform_secret_key: SecretKey,
        kms_key: [u8; 32],
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage,
            indexer,
            price_feed,
            platform_secret_key,
            kms_key,
            emergency_recovery_windows: StdMutex::new(HashMap::new()),
        })
    }

    pub fn platform_pubkey(&self) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &self.platform_secret_key)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn parse_address(&self, s: &str) -> Result<Address> {
        s.parse::<Address<_>>()
            .map_err(|e| EscrowError::InvalidConfig(format!("bad address {}: {}", s, e)))?
            .require_network(self.config.bitcoin_network)
            .map_err(|e| EscrowError::InvalidConfig(e.to_string()))
    }

    fn executor(&self) -> resolution::ResolutionExecutor<'_> {
        resolution::ResolutionExecutor {
            storage: &self.storage,
            indexer: self.indexer.as_ref(),
            config: &self.config,
            platform_secret_key: self.platform_secret_key,
            kms_key: self.kms_key,
        }
    }

    // --- Read-only passthroughs ---

    pub fn get_loan(&self, loan_id: LoanId) -> Result<Loan> {
        self.storage.get_loan(loan_id)
    }

    pub fn list_loans(&self) -> Result<Vec<Loan>> {
        self.storage.list_loans()
    }

    pub fn list_loans_by_status(&self, status: LoanStatus) -> Result<Vec<Loan>> {
        self.storage.list_loans_by_status(status)
    }

    pub fn list_audit_log(&self, loan_id: LoanId) -> Result<Vec<DisputeAuditLog>> {
        self.storage.list_audit_log_for_loan(loan_id)
    }

    // --- Inbound control operations ---

    /// `createLoan`: posts a loan offer. Sizes `collateral_required_sats`
    /// from a freshly fetched BTC price and `initial_target_ltv_percent`.
    pub async fn create_loan(
        &self,
        borrower: String,
        principal_minor_units: u64,
        currency: Currency,
        interest_rate_percent: f64,
        term_months: u32,
    ) -> Result<LoanId> {
        let quote = self.price_feed.get_price().await?;
        let btc_price = price_oracle::price_for_currency(&quote, &currency)?;
        let collateral_required_sats = loan::required_collateral_sats(
            principal_minor_units,
            btc_price,
            self.config.initial_target_ltv_percent,
        )?;

        let platform_pub = self.platform_pubkey();
        let loan = Loan::new(
            borrower,
            principal_minor_units,
            currency,
            interest_rate_percent,
            term_months,
            collateral_required_sats,
            platform_pub,
        )?;
        let loan_id = loan.id;
        self.storage.insert_loan(&loan)?;
        log::info!(
            "loan {}: posted, requires {} sat collateral at {:?} price",
            loan_id,
            collateral_required_sats,
            quote.source
        );
        Ok(loan_id)
    }

    /// `commitFunding`: a lender accepts the offer. Generates a sealed,
    /// platform-operated lender keypair when the lender has no Bitcoin key
    /// of their own.
    pub async fn commit_funding(
        &self,
        loan_id: LoanId,
        lender: String,
        payout_preference: LenderPayoutPreference,
        lender_return_address: Option<String>,
    ) -> Result<()> {
        let parsed_return_address = match lender_return_address {
            Some(ref a) => Some(self.parse_address(a)?),
            None => None,
        };

        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                loan::authorize(loan::Actor::Lender, loan.status, LoanStatus::Funded)?;

                let sealed = keys::generate_sealed_lender_key(&self.kms_key)?;
                loan.lender = Some(lender);
                loan.set_lender_pubkey(sealed.public_key)?;
                loan.encrypted_lender_privkey = Some(sealed.encrypted_privkey);
                loan.lender_privkey_nonce = Some(sealed.nonce);
                loan.lender_payout_preference = payout_preference;
                if let Some(addr) = parsed_return_address {
                    loan.lender_return_address = Some(addr);
                }

                let now = Utc::now();
                loan.funded_at = Some(now);
                loan.funding_deadline = Some(now + chrono::Duration::days(self.config.funding_deadline_days));

                loan.transition_status(LoanStatus::Funded)?;
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: funded by lender, awaiting borrower key", loan_id);
                Ok(())
            })
            .await
    }

    /// `provideBorrowerKey`: the borrower supplies their pubkey and return
    /// address. Builds the escrow address and emits the four unsigned
    /// pre-signed templates.
    pub async fn provide_borrower_key(
        &self,
        loan_id: LoanId,
        borrower_pubkey_hex: &str,
        borrower_return_address: &str,
    ) -> Result<keys::EscrowAddress> {
        let borrower_pub = keys::parse_pubkey(borrower_pubkey_hex)?;
        let return_addr = self.parse_address(borrower_return_address)?;
        let quote = self.price_feed.get_price().await?;
        let fee_rate = self.indexer.fee_estimate().await.unwrap_or(self.config.fee_rate_fallback_sat_vb);

        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                loan::authorize(loan::Actor::Borrower, loan.status, LoanStatus::EscrowCreated)?;

                let lender_pub = loan
                    .lender_pubkey
                    .ok_or_else(|| EscrowError::InvalidConfig("lender has not committed funding yet".into()))?;

                loan.set_borrower_pubkey(borrower_pub)?;
                loan.borrower_return_address = Some(return_addr.clone());

                let escrow = keys::build_escrow(borrower_pub, lender_pub, loan.platform_pubkey, self.config.bitcoin_network)?;
                let timelocked = keys::build_timelocked_escrow(
                    borrower_pub,
                    lender_pub,
                    loan.platform_pubkey,
                    self.config.bitcoin_network,
                    self.config.recovery_timelock_blocks,
                )?;

                loan.witness_script = Some(escrow.witness_script.clone());
                loan.escrow_address = Some(escrow.address.clone());

                let btc_price = price_oracle::price_for_currency(&quote, &loan.currency)?;
                let split = fair_split::compute_split(
                    loan.principal_minor_units_with_interest(),
                    loan.collateral_required_sats,
                    btc_price,
                    (fee_rate * 200.0).ceil() as u64,
                    fair_split::DustPreference::MergeIntoLender,
                );
                let lender_destination = match loan.lender_payout_preference {
                    LenderPayoutPreference::Fiat => self.parse_address(&self.config.platform_btc_address)?,
                    LenderPayoutPreference::Btc => loan
                        .lender_return_address
                        .clone()
                        .ok_or_else(|| EscrowError::InvalidConfig("no lender return address on file".into()))?,
                };

                let valid_after =
                    Utc::now() + chrono::Duration::minutes(10 * self.config.recovery_timelock_blocks as i64);

                let repayment = psbt::build_repayment(
                    loan_id,
                    &escrow.witness_script,
                    None,
                    loan.collateral_required_sats,
                    return_addr.clone(),
                    fee_rate,
                )?;
                let default_tmpl = psbt::build_default_or_liquidation(
                    loan_id,
                    TxType::Default,
                    &escrow.witness_script,
                    None,
                    loan.collateral_required_sats,
                    lender_destination.clone(),
                    split.lender_sats,
                    return_addr.clone(),
                    fee_rate,
                )?;
                let liquidation_tmpl = psbt::build_default_or_liquidation(
                    loan_id,
                    TxType::Liquidation,
                    &escrow.witness_script,
                    None,
                    loan.collateral_required_sats,
                    lender_destination,
                    split.lender_sats,
                    return_addr.clone(),
                    fee_rate,
                )?;
                let recovery_tmpl = psbt::build_recovery(
                    loan_id,
                    &timelocked.witness_script,
                    None,
                    loan.collateral_required_sats,
                    return_addr,
                    fee_rate,
                    self.config.recovery_timelock_blocks,
                )?;

                for (assembled, tmpl_valid_after) in [
                    (&repayment, None),
                    (&default_tmpl, None),
                    (&liquidation_tmpl, None),
                    (&recovery_tmpl, Some(valid_after)),
                ] {
                    self.storage.insert_template(psbt::PreSignedTemplate {
                        id: 0,
                        loan_id,
                        tx_type: assembled.canonical.tx_type,
                        party_role: psbt::PartyRole::UnsignedTemplate,
                        psbt_bytes: assembled.psbt_bytes.clone(),
                        signature_der: None,
                        canonical_tx_hash: assembled.canonical_tx_hash,
                        valid_after: tmpl_valid_after,
                        broadcast_status: psbt::BroadcastStatus::NotBroadcast,
                        broadcast_txid: None,
                        created_at: Utc::now(),
                    })?;
                    self.storage.insert_canonical_template(&assembled.canonical)?;
                }

                loan.transition_status(LoanStatus::EscrowCreated)?;
                loan.transition_escrow_state(EscrowState::EscrowCreated)?;
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: escrow address {} built, four unsigned templates emitted", loan_id, escrow.address);
                Ok(escrow)
            })
            .await
    }

    /// `submitBorrowerSignatures`: the borrower signs some or all of the
    /// four unsigned templates in one batch. Returns whether all four are
    /// now signed.
    pub async fn submit_borrower_signatures(
        &self,
        loan_id: LoanId,
        submissions: HashMap<TxType, signatures::Submission>,
    ) -> Result<bool> {
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                let borrower_pub = loan
                    .borrower_pubkey
                    .ok_or_else(|| EscrowError::InvalidConfig("no borrower pubkey on file".into()))?;
                let lender_pub = loan
                    .lender_pubkey
                    .ok_or_else(|| EscrowError::InvalidConfig("no lender pubkey on file".into()))?;
                let witness_script = loan
                    .witness_script
                    .clone()
                    .ok_or_else(|| EscrowError::WitnessScriptMismatch(loan_id))?;
                let timelocked_script = keys::build_timelocked_escrow(
                    borrower_pub,
                    lender_pub,
                    loan.platform_pubkey,
                    self.config.bitcoin_network,
                    self.config.recovery_timelock_blocks,
                )?
                .witness_script;
                let input_value = loan.confirmed_amount_sats.unwrap_or(loan.collateral_required_sats);

                for (tx_type, submission) in submissions {
                    self.storage.check_submission_rate_limit(
                        loan_id,
                        tx_type,
                        self.config.max_signature_submissions_per_window,
                        self.config.signature_submission_window_sec,
                        Utc::now(),
                    )?;

                    let unsigned = self
                        .storage
                        .get_unsigned_template(loan_id, tx_type)?
                        .ok_or(EscrowError::TemplateMissing(loan_id, tx_type))?;
                    let script_for_type = if tx_type == TxType::Recovery { &timelocked_script } else { &witness_script };
                    let canonical = self.storage.get_canonical_template(loan_id, tx_type)?;

                    let der = signatures::verify_submission(
                        &submission,
                        &unsigned.psbt_bytes,
                        &borrower_pub,
                        script_for_type,
                        input_value,
                        canonical.as_ref(),
                    )?;

                    self.storage.insert_template(psbt::PreSignedTemplate {
                        id: 0,
                        loan_id,
                        tx_type,
                        party_role: psbt::PartyRole::Borrower,
                        psbt_bytes: unsigned.psbt_bytes.clone(),
                        signature_der: Some(der),
                        canonical_tx_hash: unsigned.canonical_tx_hash,
                        valid_after: unsigned.valid_after,
                        broadcast_status: psbt::BroadcastStatus::NotBroadcast,
                        broadcast_txid: None,
                        created_at: Utc::now(),
                    })?;
                    log::info!("loan {}: borrower signature accepted for {:?}", loan_id, tx_type);
                }

                let all_four = [TxType::Repayment, TxType::Default, TxType::Liquidation, TxType::Recovery]
                    .iter()
                    .all(|t| matches!(self.storage.newest_borrower_signed(loan_id, *t), Ok(Some(_))));
                loan.borrower_signing_complete = all_four;
                self.storage.save_loan(&loan)?;
                Ok(all_four)
            })
            .await
    }

    /// `confirmDeposit`: the borrower signals that the on-chain deposit was
    /// sent. Enables chain monitoring; the coarse status does not reach
    /// `Active` until [`EscrowEngine::record_deposit_confirmed`] observes
    /// the confirmation on-chain.
    pub async fn confirm_deposit(&self, loan_id: LoanId) -> Result<()> {
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                if loan.status == LoanStatus::DepositPending {
                    return Ok(()); // idempotent re-submission
                }
                loan::authorize(loan::Actor::Borrower, loan.status, LoanStatus::DepositPending)?;
                loan.transition_status(LoanStatus::DepositPending)?;
                loan.transition_escrow_state(EscrowState::DepositPending)?;
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: borrower signaled deposit sent, monitoring enabled", loan_id);
                Ok(())
            })
            .await
    }

    /// Driven by the chain-monitor background loop (`escrow-lend-monitor`),
    /// not a human actor — records a deposit the indexer has confirmed to
    /// `confirmation_threshold`.
    pub async fn record_deposit_confirmed(&self, loan_id: LoanId, txid: Txid, vout: u32, amount_sats: u64) -> Result<()> {
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                loan.confirm_deposit(txid, vout, amount_sats)?;
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: deposit confirmed txid={} amount={}sat", loan_id, txid, amount_sats);
                Ok(())
            })
            .await
    }

    /// `confirmRepaymentSent`: the borrower signals fiat repayment was sent.
    pub async fn confirm_repayment_sent(&self, loan_id: LoanId) -> Result<()> {
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                loan::authorize(loan::Actor::Borrower, loan.status, LoanStatus::RepaymentPending)?;
                loan.transition_status(LoanStatus::RepaymentPending)?;
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: borrower confirmed repayment sent", loan_id);
                Ok(())
            })
            .await
    }

    /// The lender-gated counterpart of `confirmRepaymentSent`: R4's "fiat
    /// sent" signal, separate from the borrower's repayment flow. Records
    /// that the lender sent the original fiat principal.
    pub async fn confirm_fiat_sent(&self, loan_id: LoanId) -> Result<()> {
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                loan.confirm_fiat_sent();
                self.storage.save_loan(&loan)?;
                log::info!("loan {}: lender confirmed fiat sent", loan_id);
                Ok(())
            })
            .await
    }

    async fn gather_evidence(
        &self,
        loan: &Loan,
        repayment_received_by_lender: bool,
        admin_override: Option<AdminOverride>,
    ) -> Result<(Evidence, Option<f64>)> {
        let quote = self.price_feed.get_price().await?;
        let btc_price = price_oracle::price_for_currency(&quote, &loan.currency).ok();
        let current_ltv = btc_price.and_then(|p| loan.current_ltv(p));
        let borrower_signed_recovery = self.storage.newest_borrower_signed(loan.id, TxType::Recovery)?.is_some();

        Ok((
            Evidence {
                repayment_confirmed_by_borrower: loan.status == LoanStatus::RepaymentPending,
                repayment_received_by_lender,
                current_ltv,
                liquidation_ltv_threshold: self.config.liquidation_ltv_percent,
                maturity_date: loan.maturity_at,
                grace_days: self.config.grace_days,
                deposit_confirmed_at: loan.deposit_confirmed_at,
                fiat_sent_by_lender: loan.fiat_sent_by_lender,
                funding_deadline: loan.funding_deadline,
                borrower_signed_recovery,
                admin_override,
            },
            btc_price,
        ))
    }

    /// `confirmRepaymentReceived`: the lender signals the fiat repayment
    /// arrived. Runs the outcome engine (R1 fires here in the common case)
    /// and, if a transaction results, broadcasts it.
    pub async fn confirm_repayment_received(&self, loan_id: LoanId) -> Result<DisputeAuditLog> {
        let loan = self.storage.get_loan(loan_id)?;
        loan::authorize(loan::Actor::Lender, loan.status, LoanStatus::Completed)?;

        let (evidence, btc_price) = self.gather_evidence(&loan, true, None).await?;
        let now = Utc::now();
        let decision = outcome::decide(&evidence, now);
        let snapshot = serde_json::to_value(&evidence)?;
        let fee_rate = self.indexer.fee_estimate().await.unwrap_or(self.config.fee_rate_fallback_sat_vb);

        log::info!("loan {}: confirmRepaymentReceived -> rule {} outcome {:?}", loan_id, decision.rule_fired, decision.outcome);
        self.executor()
            .resolve(loan_id, decision, snapshot, "lender", btc_price, fee_rate, now)
            .await
    }

    /// `resolveDispute`: re-evaluates the outcome engine for a loan, with an
    /// optional admin override. Used for LTV-triggered
    /// liquidations, maturity-triggered defaults, and human-escalated
    /// disputes alike.
    pub async fn resolve_dispute(&self, loan_id: LoanId, admin_override: Option<AdminOverride>, actor: &str) -> Result<DisputeAuditLog> {
        let loan = self.storage.get_loan(loan_id)?;
        let (evidence, btc_price) = self.gather_evidence(&loan, false, admin_override).await?;
        let now = Utc::now();
        let decision = outcome::decide(&evidence, now);
        let snapshot = serde_json::to_value(&evidence)?;
        let fee_rate = self.indexer.fee_estimate().await.unwrap_or(self.config.fee_rate_fallback_sat_vb);

        log::info!("loan {}: resolveDispute({}) -> rule {} outcome {:?}", loan_id, actor, decision.rule_fired, decision.outcome);
        self.executor()
            .resolve(loan_id, decision, snapshot, actor, btc_price, fee_rate, now)
            .await
    }

    /// `emergencyRecovery`: intentionally unauthenticated (anyone who knows
    /// the loan id may call it) but rate-limited per loan. Hands back the
    /// newest borrower-signed RECOVERY PSBT once its timelock has matured,
    /// for the borrower to broadcast themselves.
    pub async fn emergency_recovery(&self, loan_id: LoanId) -> Result<Vec<u8>> {
        {
            let mut windows = self.emergency_recovery_windows.lock().expect("emergency recovery rate limiter poisoned");
            windows
                .entry(loan_id)
                .or_default()
                .record_and_check(self.config.max_emergency_recovery_per_hour, 3600, Utc::now())?;
        }

        let template = self
            .storage
            .newest_borrower_signed(loan_id, TxType::Recovery)?
            .ok_or(EscrowError::TemplateMissing(loan_id, TxType::Recovery))?;
        let valid_after = template.valid_after.ok_or(EscrowError::TimelockNotMet)?;
        if !self.config.dev_mode_timelock_override && Utc::now() < valid_after {
            return Err(EscrowError::TimelockNotMet);
        }
        log::info!("loan {}: emergency recovery PSBT handed out", loan_id);
        Ok(template.psbt_bytes)
    }

    // --- Background-process drivers ---

    /// One chain-monitor sweep: checks every loan awaiting a deposit for a
    /// qualifying, sufficiently-confirmed UTXO.
    pub async fn poll_deposits_once(&self) -> Result<()> {
        for status in [LoanStatus::EscrowCreated, LoanStatus::DepositPending] {
            for loan in self.storage.list_loans_by_status(status)? {
                if let Some((txid, vout, amount, confirmations)) =
                    chain_monitor::check_deposit(self.indexer.as_ref(), &loan, self.config.confirmation_threshold).await?
                {
                    log::info!("loan {}: deposit candidate txid={} confirmations={}", loan.id, txid, confirmations);
                    self.record_deposit_confirmed(loan.id, txid, vout, amount).await?;
                }
            }
        }
        self.poll_top_ups_once().await
    }

    /// One top-up sweep: for every active loan the LTV monitor flagged as
    /// needing additional collateral, checks for a qualifying UTXO and
    /// folds it into the tracked balance.
    pub async fn poll_top_ups_once(&self) -> Result<()> {
        for loan in self.storage.list_loans_by_status(LoanStatus::Active)? {
            if !loan.top_up_monitoring_active {
                continue;
            }
            if let Some((txid, _vout, amount)) = chain_monitor::check_top_up(self.indexer.as_ref(), &loan).await? {
                let loan_id = loan.id;
                self.storage
                    .with_loan_lock(loan_id, move || async move {
                        let mut loan = self.storage.get_loan(loan_id)?;
                        loan.confirm_top_up(txid, amount);
                        self.storage.save_loan(&loan)?;
                        log::info!("loan {}: top-up confirmed txid={} amount={}sat", loan_id, txid, amount);
                        Ok(())
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Flags a loan as needing additional collateral to return to the
    /// configured initial target LTV at the given price, and enables the
    /// chain monitor's top-up watch for it.
    async fn request_top_up_to_target(&self, loan_id: LoanId, btc_price: f64) -> Result<()> {
        if btc_price <= 0.0 {
            return Ok(());
        }
        self.storage
            .with_loan_lock(loan_id, move || async move {
                let mut loan = self.storage.get_loan(loan_id)?;
                let debt = loan.debt_with_interest_fiat();
                let target_collateral_value = debt / self.config.initial_target_ltv_percent;
                let target_sats = ((target_collateral_value / btc_price) * 100_000_000.0) as u64;
                let current_sats = loan.confirmed_amount_sats.unwrap_or(0);
                if target_sats > current_sats {
                    loan.request_top_up(target_sats - current_sats);
                    self.storage.save_loan(&loan)?;
                }
                Ok(())
            })
            .await
    }

    /// One LTV-monitor sweep over every active loan: logs warning/critical
    /// bands and automatically resolves loans that crossed the liquidation
    /// trigger.
    pub async fn poll_ltv_once(&self) -> Result<()> {
        let quote = self.price_feed.get_price().await?;
        for loan in self.storage.list_loans_by_status(LoanStatus::Active)? {
            let Ok(price) = price_oracle::price_for_currency(&quote, &loan.currency) else {
                continue;
            };
            let Some(ltv) = loan.current_ltv(price) else {
                continue;
            };
            let band = chain_monitor::classify_ltv(
                ltv,
                self.config.warning_ltv_percent,
                self.config.critical_ltv_percent,
                self.config.liquidation_ltv_percent,
            );
            match band {
                chain_monitor::LtvBand::Healthy => {}
                chain_monitor::LtvBand::Warning => {
                    log::warn!("loan {}: ltv {:.4} in warning band", loan.id, ltv);
                    self.request_top_up_to_target(loan.id, price).await?;
                }
                chain_monitor::LtvBand::Critical => {
                    log::warn!("loan {}: ltv {:.4} in critical band", loan.id, ltv);
                    self.request_top_up_to_target(loan.id, price).await?;
                }
                chain_monitor::LtvBand::LiquidationTrigger => {
                    log::error!("loan {}: ltv {:.4} past liquidation trigger, resolving", loan.id, ltv);
                    if let Err(e) = self.resolve_dispute(loan.id, None, "chain-monitor").await {
                        log::error!("loan {}: automatic liquidation resolution failed: {}", loan.id, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// One retry-sweep pass (`escrow-lend-resolver`): re-runs resolution
    /// for any loan whose last broadcast attempt failed.
    pub async fn retry_failed_broadcasts_once(&self) -> Result<()> {
        for loan in self.storage.list_loans()? {
            if loan.collateral_release_error.is_some() && !loan.collateral_released {
                log::warn!("loan {}: retrying broadcast after prior failure: {:?}", loan.id, loan.collateral_release_error);
                if let Err(e) = self.resolve_dispute(loan.id, None, "retry-sweep").await {
                    log::error!("loan {}: retry sweep resolution failed again: {}", loan.id, e);
                }
            }
        }
        Ok(())
    }

    /// Long-running chain-monitor loop (`escrow-lend-monitor`): polls for
    /// deposits every 60 seconds until the shutdown signal fires.
    pub async fn run_chain_monitor_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_deposits_once().await {
                        log::error!("chain monitor iteration failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("chain monitor loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Long-running LTV-monitor loop (`escrow-lend-monitor`): polls at
    /// `EngineConfig::ltv_check_interval_sec` until the shutdown signal
    /// fires.
    pub async fn run_ltv_monitor_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let interval = std::time::Duration::from_secs(self.config.ltv_check_interval_sec);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.poll_ltv_once().await {
                        log::error!("ltv monitor iteration failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("ltv monitor loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Long-running broadcast-retry loop (`escrow-lend-resolver`): sweeps
    /// every 5 minutes until the shutdown signal fires.
    pub async fn run_retry_sweep_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.retry_failed_broadcasts_once().await {
                        log::error!("retry sweep iteration failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("retry sweep loop shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::price_oracle::FixedPriceFeed;
    use bitcoin::Network;
    use tempfile::TempDir;

    struct NullIndexer;

    #[async_trait::async_trait]
    impl ChainIndexer for NullIndexer {
        async fn get_utxos(&self, _address: &Address) -> Result<Vec<chain_monitor::Utxo>> {
            Ok(vec![])
        }
        async fn get_tx(&self, txid: Txid) -> Result<chain_monitor::TxInfo> {
            Ok(chain_monitor::TxInfo { txid, confirmations: 0, outputs: vec![] })
        }
        async fn broadcast(&self, _raw: &[u8]) -> Result<chain_monitor::BroadcastOutcome> {
            Err(EscrowError::InvalidConfig("not used in this test".into()))
        }
        async fn fee_estimate(&self) -> Result<f64> {
            Ok(10.0)
        }
    }

    fn test_engine() -> (EscrowEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();
        let secp = Secp256k1::new();
        let platform_sk = SecretKey::new(&mut rand::thread_rng());
        let mut config = EngineConfig::testnet();
        config.platform_pubkey = PublicKey::from_secret_key(&secp, &platform_sk).to_string();
        config.platform_btc_address = Address::p2wsh(&bitcoin::ScriptBuf::new(), Network::Testnet).to_string();

        let engine = EscrowEngine::new(
            config,
            storage,
            Box::new(NullIndexer),
            Box::new(FixedPriceFeed { usd: 60_000.0, eur: 55_000.0 }),
            platform_sk,
            [3u8; 32],
        )
        .unwrap();
        (engine, dir)
    }

    #[tokio::test]
    async fn create_loan_sizes_collateral_from_price() {
        let (engine, _dir) = test_engine();
        let loan_id = engine
            .create_loan("borrower-1".into(), 1_000_000, Currency::EUR, 10.0, 3)
            .await
            .unwrap();
        let loan = engine.get_loan(loan_id).unwrap();
        // 10_000 EUR at 50% target LTV, 55_000 EUR/BTC.
        let expected = loan::required_collateral_sats(1_000_000, 55_000.0, 0.50).unwrap();
        assert_eq!(loan.collateral_required_sats, expected);
        assert_eq!(loan.status, LoanStatus::Posted);
    }

    #[tokio::test]
    async fn full_ceremony_emits_four_templates() {
        let (engine, _dir) = test_engine();
        let loan_id = engine
            .create_loan("borrower-1".into(), 1_000_000, Currency::EUR, 10.0, 3)
            .await
            .unwrap();

        engine
            .commit_funding(loan_id, "lender-1".into(), LenderPayoutPreference::Fiat, None)
            .await
            .unwrap();

        let secp = Secp256k1::new();
        let borrower_sk = SecretKey::new(&mut rand::thread_rng());
        let borrower_pub = PublicKey::from_secret_key(&secp, &borrower_sk);
        let borrower_addr = Address::p2wsh(&bitcoin::ScriptBuf::new(), Network::Testnet);

        engine
            .provide_borrower_key(loan_id, &hex::encode(borrower_pub.serialize()), &borrower_addr.to_string())
            .await
            .unwrap();

        let loan = engine.get_loan(loan_id).unwrap();
        assert_eq!(loan.status, LoanStatus::EscrowCreated);
        assert!(loan.escrow_address.is_some());

        for tx_type in [TxType::Repayment, TxType::Default, TxType::Liquidation, TxType::Recovery] {
            assert!(engine.storage.get_unsigned_template(loan_id, tx_type).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn confirm_deposit_then_chain_confirmation_reaches_active() {
        let (engine, _dir) = test_engine();
        let loan_id = engine
            .create_loan("borrower-1".into(), 1_000_000, Currency::EUR, 10.0, 3)
            .await
            .unwrap();
        engine
            .commit_funding(loan_id, "lender-1".into(), LenderPayoutPreference::Fiat, None)
            .await
            .unwrap();
        let secp = Secp256k1::new();
        let borrower_sk = SecretKey::new(&mut rand::thread_rng());
        let borrower_pub = PublicKey::from_secret_key(&secp, &borrower_sk);
        let borrower_addr = Address::p2wsh(&bitcoin::ScriptBuf::new(), Network::Testnet);
        engine
            .provide_borrower_key(loan_id, &hex::encode(borrower_pub.serialize()), &borrower_addr.to_string())
            .await
            .unwrap();

        engine.confirm_deposit(loan_id).await.unwrap();
        assert_eq!(engine.get_loan(loan_id).unwrap().status, LoanStatus::DepositPending);

        let loan_before = engine.get_loan(loan_id).unwrap();
        engine
            .record_deposit_confirmed(loan_id, loan::new_loan_id(), 0, loan_before.collateral_required_sats)
            .await
            .unwrap();
        assert_eq!(engine.get_loan(loan_id).unwrap().status, LoanStatus::Active);
    }

    #[tokio::test]
    async fn emergency_recovery_rejects_before_timelock() {
        let (engine, _dir) = test_engine();
        let loan_id = engine
            .create_loan("borrower-1".into(), 1_000_000, Currency::EUR, 10.0, 3)
            .await
            .unwrap();
        let err = engine.emergency_recovery(loan_id).await.unwrap_err();
        assert!(matches!(err, EscrowError::TemplateMissing(_, TxType::Recovery)));
    }
}
