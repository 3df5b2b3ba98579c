//! Dispute-resolution executor (C8) and the append-only `DisputeAuditLog`.
//! Orchestrates C2/C3/C4/C6/C7 to co-sign and broadcast exactly one outcome
//! transaction per resolution attempt.

use std::collections::HashMap;

use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ScriptBuf, Transaction, Txid, Witness};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain_monitor::{BroadcastOutcome, ChainIndexer};
use crate::config::EngineConfig;
use crate::fair_split::{compute_split, DustPreference};
use crate::keys::sorted_distinct_keys;
use crate::loan::{Loan, LoanId, LoanStatus};
use crate::outcome::{Decision, Outcome};
use crate::psbt::{self, BoundUtxo, PartyRole, PreSignedTemplate, TxType};
use crate::storage::{StorageAdapter, WriteOp};
use crate::{EscrowError, Result};

/// Append-only audit row for a single resolution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeAuditLog {
    pub loan_id: LoanId,
    pub outcome: Outcome,
    pub rule_fired: String,
    pub tx_type_used: Option<TxType>,
    pub evidence_snapshot: serde_json::Value,
    pub broadcast_txid: Option<Txid>,
    pub broadcast_success: bool,
    pub broadcast_error: Option<String>,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl DisputeAuditLog {
    #[allow(clippy::too_many_arguments)]
    fn new(
        loan_id: LoanId,
        outcome: Outcome,
        rule_fired: &str,
        tx_type_used: Option<TxType>,
        evidence_snapshot: serde_json::Value,
        broadcast_txid: Option<Txid>,
        broadcast_success: bool,
        broadcast_error: Option<String>,
        actor: &str,
    ) -> Self {
        Self {
            loan_id,
            outcome,
            rule_fired: rule_fired.to_string(),
            tx_type_used,
            evidence_snapshot,
            broadcast_txid,
            broadcast_success,
            broadcast_error,
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// A fully finalized, broadcast-ready transaction plus the book-keeping
/// needed to update the loan afterward.
struct PreparedBroadcast {
    raw_tx: Vec<u8>,
    txid: Txid,
}

/// Orchestrates C2 (PSBT builder)/C3 (signature store)/C4 (chain
/// monitor)/C6 (outcome engine)/C7 (fair split) to co-sign and broadcast
/// exactly one outcome transaction, then records the attempt.
pub struct ResolutionExecutor<'a> {
    pub storage: &'a StorageAdapter,
    pub indexer: &'a dyn ChainIndexer,
    pub config: &'a EngineConfig,
    /// The platform's own secret key, matching `Loan::platform_pubkey`.
    pub platform_secret_key: SecretKey,
    /// The KMS-unwrapped data-encryption key used to unseal the
    /// platform-operated lender key.
    pub kms_key: [u8; 32],
}

impl<'a> ResolutionExecutor<'a> {
    /// Executes one resolution attempt for `loan_id` given a decision
    /// already produced by the outcome engine. `btc_price`/`fee_rate_sat_vb`
    /// must be captured by the caller before calling, since external I/O
    /// stays outside the per-loan lock.
    pub async fn resolve(
        &self,
        loan_id: LoanId,
        decision: Decision,
        evidence_snapshot: serde_json::Value,
        actor: &str,
        btc_price: Option<f64>,
        fee_rate_sat_vb: f64,
        now: DateTime<Utc>,
    ) -> Result<DisputeAuditLog> {
        let Some(tx_type) = decision.tx_type_to_use else {
            // UNDER_REVIEW is never broadcast; record it and leave the loan untouched.
            let row = DisputeAuditLog::new(
                loan_id,
                decision.outcome,
                decision.rule_fired,
                None,
                evidence_snapshot,
                None,
                false,
                None,
                actor,
            );
            self.storage.append_audit_log(&row)?;
            return Ok(row);
        };

        let prepared = self
            .storage
            .with_loan_lock(loan_id, || async {
                self.prepare(loan_id, tx_type, decision.outcome, btc_price, fee_rate_sat_vb, now)
            })
            .await?;

        // Broadcast is external I/O; it happens outside the loan lock.
        let broadcast_result = self.broadcast_with_retry(&prepared.raw_tx).await;

        let mut loan = self.storage.get_loan(loan_id)?;
        let (broadcast_success, broadcast_txid, broadcast_error) = match &broadcast_result {
            Ok(txid) => (true, Some(*txid), None),
            Err(e) => (false, None, Some(e.to_string())),
        };

        if broadcast_success {
            loan.mark_collateral_released(broadcast_txid.unwrap())?;
            loan.transition_status(terminal_status_for(decision.outcome))?;
        } else {
            loan.collateral_release_txid = Some(prepared.txid);
            loan.collateral_release_error = broadcast_error.clone();
        }

        let row = DisputeAuditLog::new(
            loan_id,
            decision.outcome,
            decision.rule_fired,
            Some(tx_type),
            evidence_snapshot,
            broadcast_txid,
            broadcast_success,
            broadcast_error,
            actor,
        );

        self.storage
            .atomically(vec![WriteOp::PutLoan(loan.clone()), WriteOp::AppendAuditLog(row.clone())])?;

        if broadcast_success {
            self.sweep_remaining(&loan).await;
        }

        Ok(row)
    }

    /// Selects or constructs the PSBT, verifies the witness script and
    /// timelock, rebinds the UTXO, signs, and finalizes the witness.
    /// Synchronous: no I/O happens here, so it is safe to run inside the
    /// loan lock's critical section.
    fn prepare(
        &self,
        loan_id: LoanId,
        tx_type: TxType,
        outcome: Outcome,
        btc_price: Option<f64>,
        fee_rate_sat_vb: f64,
        now: DateTime<Utc>,
    ) -> Result<PreparedBroadcast> {
        let loan = self.storage.get_loan(loan_id)?;

        if loan.dispute_status == crate::loan::DisputeStatus::PendingLenderSignature
            || (!loan.collateral_released && loan.collateral_release_txid.is_some())
        {
            return Err(EscrowError::ResolutionInProgress(loan_id));
        }

        let returns_to_borrower = matches!(outcome, Outcome::CooperativeClose | Outcome::Recovery);

        let borrower_template = self.storage.newest_borrower_signed(loan_id, tx_type)?;

        match (&borrower_template, returns_to_borrower) {
            (Some(template), _) => self.finalize_with_borrower_signature(&loan, template),
            (None, true) => Err(EscrowError::TemplateMissing(loan_id, tx_type)),
            (None, false) => self.finalize_platform_only(&loan, tx_type, btc_price, fee_rate_sat_vb, now),
        }
    }

    fn finalize_with_borrower_signature(
        &self,
        loan: &Loan,
        template: &PreSignedTemplate,
    ) -> Result<PreparedBroadcast> {
        let witness_script = loan
            .witness_script
            .as_ref()
            .ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?;

        let mut psbt = psbt::decode_psbt(&template.psbt_bytes)?;
        let template_script = psbt.inputs[0]
            .witness_script
            .as_ref()
            .ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?;
        let expected_script = if template.tx_type == TxType::Recovery {
            self.timelocked_script(loan)?
        } else {
            witness_script.clone()
        };
        if template_script != &expected_script {
            return Err(EscrowError::WitnessScriptMismatch(loan.id));
        }

        if template.tx_type == TxType::Recovery {
            let valid_after = template.valid_after.ok_or(EscrowError::TimelockNotMet)?;
            if !self.config.dev_mode_timelock_override && Utc::now() < valid_after {
                return Err(EscrowError::TimelockNotMet);
            }
        }

        // Re-bind to the current UTXO if the template predates the deposit.
        if let (Some(funding_txid), Some(vout)) = (loan.funding_txid, loan.funding_vout) {
            psbt.unsigned_tx.input[0].previous_output.txid = funding_txid;
            psbt.unsigned_tx.input[0].previous_output.vout = vout;
        }

        let borrower_pub = loan
            .borrower_pubkey
            .ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?;
        let borrower_sig = template
            .signature_der
            .clone()
            .ok_or_else(|| EscrowError::TemplateMissing(loan.id, template.tx_type))?;

        let input_value = loan.confirmed_amount_sats.unwrap_or(loan.collateral_required_sats);

        let mut sigs = HashMap::new();
        sigs.insert(borrower_pub, borrower_sig);
        let platform_pub = PublicKey::from_secret_key(&Secp256k1::new(), &self.platform_secret_key);
        let platform_sig = self.sign_sighash(&psbt.unsigned_tx, &expected_script, input_value, &self.platform_secret_key)?;
        sigs.insert(platform_pub, platform_sig);

        let sorted = sorted_distinct_keys(
            loan.borrower_pubkey.unwrap(),
            loan.lender_pubkey.unwrap_or(platform_pub),
            loan.platform_pubkey,
        )?;

        let witness = assemble_witness(&sorted, &sigs, &expected_script)?;
        let mut tx = psbt.unsigned_tx.clone();
        tx.input[0].witness = witness;

        Ok(PreparedBroadcast {
            txid: tx.compute_txid(),
            raw_tx: bitcoin::consensus::serialize(&tx),
        })
    }

    /// Builds a fresh PSBT from the current UTXO and signs it with both
    /// platform-held keys (platform + platform-operated lender). Valid only
    /// for outcomes that do not return funds to the borrower.
    fn finalize_platform_only(
        &self,
        loan: &Loan,
        tx_type: TxType,
        btc_price: Option<f64>,
        fee_rate_sat_vb: f64,
        now: DateTime<Utc>,
    ) -> Result<PreparedBroadcast> {
        // DEFAULT/LIQUIDATION need a live price to compute the fair split;
        // unlike LTV monitoring (which just skips a loan it can't price),
        // a resolution that would move funds cannot guess at a price.
        let btc_price = btc_price.ok_or(EscrowError::PriceUnavailable)?;
        let witness_script = loan
            .witness_script
            .as_ref()
            .ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?;
        let (funding_txid, vout) = loan
            .funding_txid
            .zip(loan.funding_vout)
            .ok_or(EscrowError::UtxoMissing(loan.id))?;
        let input_value = loan.confirmed_amount_sats.ok_or(EscrowError::UtxoMissing(loan.id))?;

        let lender_destination = match loan.lender_payout_preference {
            crate::loan::LenderPayoutPreference::Fiat => self.config.platform_btc_address.parse::<bitcoin::Address<_>>()
                .map_err(|e| EscrowError::InvalidConfig(format!("bad platform_btc_address: {}", e)))?
                .require_network(self.config.bitcoin_network)
                .map_err(|e| EscrowError::InvalidConfig(e.to_string()))?,
            crate::loan::LenderPayoutPreference::Btc => loan
                .lender_return_address
                .clone()
                .ok_or_else(|| EscrowError::InvalidConfig("no lender return address on file".into()))?,
        };
        let borrower_return = loan
            .borrower_return_address
            .clone()
            .ok_or_else(|| EscrowError::InvalidConfig("no borrower return address on file".into()))?;

        let split = compute_split(
            loan.principal_minor_units_with_interest(),
            input_value,
            btc_price,
            (fee_rate_sat_vb * 200.0).ceil() as u64,
            DustPreference::MergeIntoLender,
        );

        let assembled = psbt::build_default_or_liquidation(
            loan.id,
            tx_type,
            witness_script,
            Some(BoundUtxo {
                txid: funding_txid,
                vout,
                value: bitcoin::Amount::from_sat(input_value),
            }),
            input_value,
            lender_destination,
            split.lender_sats,
            borrower_return,
            fee_rate_sat_vb,
        )?;
        let _ = now;

        let mut psbt_doc = psbt::decode_psbt(&assembled.psbt_bytes)?;

        let platform_pub = PublicKey::from_secret_key(&Secp256k1::new(), &self.platform_secret_key);
        let lender_secret = crate::keys::unseal_lender_key(
            &self.kms_key,
            loan.encrypted_lender_privkey
                .as_ref()
                .ok_or_else(|| EscrowError::InvalidConfig("no platform-operated lender key on file".into()))?,
            loan.lender_privkey_nonce
                .as_ref()
                .ok_or_else(|| EscrowError::InvalidConfig("no platform-operated lender key nonce on file".into()))?,
        )?;
        let lender_pub = PublicKey::from_secret_key(&Secp256k1::new(), &lender_secret);

        let mut sigs = HashMap::new();
        let platform_sig = self.sign_sighash(&psbt_doc.unsigned_tx, witness_script, input_value, &self.platform_secret_key)?;
        sigs.insert(platform_pub, platform_sig);
        let lender_sig = self.sign_sighash(&psbt_doc.unsigned_tx, witness_script, input_value, &lender_secret)?;
        sigs.insert(lender_pub, lender_sig);

        let sorted = sorted_distinct_keys(loan.borrower_pubkey.unwrap_or(platform_pub), lender_pub, platform_pub)?;
        let witness = assemble_witness(&sorted, &sigs, witness_script)?;

        let mut tx = psbt_doc.unsigned_tx.clone();
        tx.input[0].witness = witness;
        psbt_doc.unsigned_tx = tx.clone();

        Ok(PreparedBroadcast {
            txid: tx.compute_txid(),
            raw_tx: bitcoin::consensus::serialize(&tx),
        })
    }

    fn timelocked_script(&self, loan: &Loan) -> Result<ScriptBuf> {
        let platform_pub = loan.platform_pubkey;
        let escrow = crate::keys::build_timelocked_escrow(
            loan.borrower_pubkey.ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?,
            loan.lender_pubkey.ok_or_else(|| EscrowError::WitnessScriptMismatch(loan.id))?,
            platform_pub,
            self.config.bitcoin_network,
            self.config.recovery_timelock_blocks,
        )?;
        Ok(escrow.witness_script)
    }

    fn sign_sighash(
        &self,
        tx: &Transaction,
        witness_script: &ScriptBuf,
        input_value_sats: u64,
        secret_key: &SecretKey,
    ) -> Result<Vec<u8>> {
        let sighash = psbt::compute_sighash(tx, witness_script, input_value_sats)?;
        let message = Message::from_digest_slice(&sighash)
            .map_err(|e| EscrowError::InvalidSignature(format!("bad sighash: {}", e)))?;
        let secp = Secp256k1::new();
        let sig = secp.sign_ecdsa(&message, secret_key);
        Ok(sig.serialize_der().to_vec())
    }

    async fn broadcast_with_retry(&self, raw_tx: &[u8]) -> Result<Txid> {
        let mut attempt = 0u32;
        let mut delay = std::time::Duration::from_secs(1);
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(std::time::Duration::from_secs(30), self.indexer.broadcast(raw_tx)).await;
            match outcome {
                Ok(Ok(BroadcastOutcome::Accepted { txid })) => return Ok(txid),
                Ok(Ok(BroadcastOutcome::AlreadyInMempool { txid })) => return Ok(txid),
                Ok(Ok(BroadcastOutcome::Rejected { reason })) => {
                    if attempt >= 3 {
                        return Err(EscrowError::BroadcastFailedPermanent { reason });
                    }
                }
                Ok(Err(e)) => {
                    if attempt >= 3 {
                        return Err(EscrowError::BroadcastFailedTransient { reason: e.to_string() });
                    }
                }
                Err(_) => {
                    if attempt >= 3 {
                        return Err(EscrowError::BroadcastFailedTransient {
                            reason: "broadcast timed out".into(),
                        });
                    }
                }
            }
            log::warn!("broadcast attempt {} failed, retrying in {:?}", attempt, delay);
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }

    /// Best-effort sweep of any UTXOs left at the escrow address after a
    /// successful broadcast. Failures are logged and
    /// never propagated.
    async fn sweep_remaining(&self, loan: &Loan) {
        let Some(address) = loan.escrow_address.as_ref() else {
            return;
        };
        match self.indexer.get_utxos(address).await {
            Ok(utxos) if !utxos.is_empty() => {
                log::warn!(
                    "loan {}: {} UTXO(s) remain at escrow address {} after broadcast; manual sweep required",
                    loan.id,
                    utxos.len(),
                    address
                );
            }
            Ok(_) => {}
            Err(e) => log::warn!("loan {}: post-broadcast sweep check failed: {}", loan.id, e),
        }
    }
}

fn terminal_status_for(outcome: Outcome) -> LoanStatus {
    match outcome {
        Outcome::CooperativeClose => LoanStatus::Completed,
        Outcome::Default => LoanStatus::Defaulted,
        Outcome::Liquidation => LoanStatus::Liquidated,
        Outcome::Cancellation | Outcome::Recovery => LoanStatus::Recovered,
        Outcome::UnderReview => LoanStatus::Active,
    }
}

/// Assembles the standard 2-of-3 `OP_CHECKMULTISIG` witness stack: the
/// mandatory empty element (the off-by-one bug CHECKMULTISIG never fixed),
/// the available signatures in the same order as the sorted pubkeys they
/// belong to, and the witness script itself.
fn assemble_witness(
    sorted_pubkeys: &[PublicKey; 3],
    sigs_by_pubkey: &HashMap<PublicKey, Vec<u8>>,
    witness_script: &ScriptBuf,
) -> Result<Witness> {
    let mut ordered_sigs: Vec<Vec<u8>> = Vec::new();
    for pk in sorted_pubkeys {
        if let Some(der) = sigs_by_pubkey.get(pk) {
            // Validate the DER decodes; catches a corrupt stored signature
            // before it reaches the network as an unspendable transaction.
            EcdsaSignature::from_der(der)
                .map_err(|e| EscrowError::InvalidSignature(format!("stored signature corrupt: {}", e)))?;
            let mut with_hashtype = der.clone();
            with_hashtype.push(EcdsaSighashType::All as u8);
            ordered_sigs.push(with_hashtype);
        }
    }
    if ordered_sigs.len() < 2 {
        return Err(EscrowError::InvalidSignature(
            "fewer than 2 of 3 signatures available to finalize".into(),
        ));
    }

    let mut stack: Vec<Vec<u8>> = vec![Vec::new()];
    stack.extend(ordered_sigs.into_iter().take(2));
    stack.push(witness_script.to_bytes());
    Ok(Witness::from_slice(&stack))
}

impl Loan {
    /// Current debt including interest, in minor fiat units (matches
    /// `principal_minor_units` scale for [`compute_split`]).
    pub fn principal_minor_units_with_interest(&self) -> u64 {
        (self.debt_with_interest_fiat() * 100.0).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain_monitor::{TxInfo, Utxo};
    use crate::keys::build_escrow;
    use crate::loan::{new_loan_id, Currency as LoanCurrency, LenderPayoutPreference};
    use crate::psbt::build_repayment;
    use bitcoin::secp256k1::{PublicKey as Pk, Secp256k1 as S, SecretKey as Sk};
    use bitcoin::{Address, Network};
    use tempfile::TempDir;

    struct FakeIndexer;

    #[async_trait::async_trait]
    impl ChainIndexer for FakeIndexer {
        async fn get_utxos(&self, _address: &Address) -> Result<Vec<Utxo>> {
            Ok(vec![])
        }
        async fn get_tx(&self, txid: Txid) -> Result<TxInfo> {
            Ok(TxInfo { txid, confirmations: 1, outputs: vec![] })
        }
        async fn broadcast(&self, raw: &[u8]) -> Result<BroadcastOutcome> {
            let tx: Transaction = bitcoin::consensus::deserialize(raw).unwrap();
            Ok(BroadcastOutcome::Accepted { txid: tx.compute_txid() })
        }
        async fn fee_estimate(&self) -> Result<f64> {
            Ok(10.0)
        }
    }

    fn keypair() -> (Sk, Pk) {
        let secp = S::new();
        let sk = Sk::new(&mut rand::thread_rng());
        (sk, Pk::from_secret_key(&secp, &sk))
    }

    #[tokio::test]
    async fn cooperative_close_with_borrower_signature_broadcasts() {
        let (borrower_sk, borrower_pub) = keypair();
        let (_, lender_pub) = keypair();
        let (platform_sk, platform_pub) = keypair();

        let escrow = build_escrow(borrower_pub, lender_pub, platform_pub, Network::Testnet).unwrap();

        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();

        let mut loan = Loan::new("b".into(), 1_000_000, LoanCurrency::EUR, 10.0, 3, 40_000_000, platform_pub).unwrap();
        loan.set_borrower_pubkey(borrower_pub).unwrap();
        loan.set_lender_pubkey(lender_pub).unwrap();
        loan.witness_script = Some(escrow.witness_script.clone());
        loan.escrow_address = Some(escrow.address.clone());
        loan.borrower_return_address = Some(Address::p2wsh(&ScriptBuf::new(), Network::Testnet));
        loan.lender_payout_preference = LenderPayoutPreference::Fiat;
        loan.confirmed_amount_sats = Some(40_000_000);
        loan.funding_txid = Some(new_loan_id());
        loan.funding_vout = Some(0);
        storage.insert_loan(&loan).unwrap();

        let tmpl = build_repayment(
            loan.id,
            &escrow.witness_script,
            None,
            40_000_000,
            loan.borrower_return_address.clone().unwrap(),
            10.0,
        )
        .unwrap();

        let unsigned_tx = psbt::decode_psbt(&tmpl.psbt_bytes).unwrap().unsigned_tx;
        let sighash = psbt::compute_sighash(&unsigned_tx, &escrow.witness_script, 40_000_000).unwrap();
        let message = Message::from_digest_slice(&sighash).unwrap();
        let secp = Secp256k1::new();
        let sig = secp.sign_ecdsa(&message, &borrower_sk);

        storage
            .insert_template(PreSignedTemplate {
                id: 0,
                loan_id: loan.id,
                tx_type: TxType::Repayment,
                party_role: PartyRole::Borrower,
                psbt_bytes: tmpl.psbt_bytes.clone(),
                signature_der: Some(sig.serialize_der().to_vec()),
                canonical_tx_hash: tmpl.canonical_tx_hash,
                valid_after: None,
                broadcast_status: crate::psbt::BroadcastStatus::NotBroadcast,
                broadcast_txid: None,
                created_at: Utc::now(),
            })
            .unwrap();

        let indexer = FakeIndexer;
        let executor = ResolutionExecutor {
            storage: &storage,
            indexer: &indexer,
            config: &EngineConfig::testnet(),
            platform_secret_key: platform_sk,
            kms_key: [1u8; 32],
        };

        let decision = Decision {
            outcome: Outcome::CooperativeClose,
            rule_fired: "R1",
            tx_type_to_use: Some(TxType::Repayment),
            reasoning: "test".into(),
        };

        let row = executor
            .resolve(loan.id, decision, serde_json::json!({}), "lender", Some(50_000.0), 10.0, Utc::now())
            .await
            .unwrap();

        assert!(row.broadcast_success);
        assert!(row.broadcast_txid.is_some());

        let saved = storage.get_loan(loan.id).unwrap();
        assert!(saved.collateral_released);
        assert_eq!(saved.status, LoanStatus::Completed);
    }
}
