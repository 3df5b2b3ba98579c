//! Signature store and signing ceremony (C3).
//!
//! Verifies a borrower's DER signature (or fully-signed PSBT) against the
//! loan's stored `borrower_pubkey`, rejects anything that disagrees with the
//! canonical template, and rate-limits submission. The borrower's private
//! key never touches this code path — only public key, signature, and
//! optionally the signed PSBT pass through.

use bitcoin::secp256k1::ecdsa::Signature as EcdsaSignature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1};
use chrono::{DateTime, Utc};

use crate::loan::LoanId;
use crate::psbt::{self, CanonicalPsbtTemplate, TxType};
use crate::{EscrowError, Result};

/// A borrower's submission: either a bare DER signature over a known
/// template, or a fully-assembled PSBT carrying the signature inline.
pub enum Submission {
    DerSignature(Vec<u8>),
    SignedPsbt(Vec<u8>),
}

/// Verifies one submission for `tx_type` against the stored borrower
/// pubkey, the unsigned template's witness script/value, and (if present)
/// the canonical template's output address/amount. Returns the DER
/// signature bytes on success.
pub fn verify_submission(
    submission: &Submission,
    unsigned_psbt_bytes: &[u8],
    borrower_pubkey: &PublicKey,
    witness_script: &bitcoin::ScriptBuf,
    input_value_sats: u64,
    canonical: Option<&CanonicalPsbtTemplate>,
) -> Result<Vec<u8>> {
    let unsigned = psbt::decode_psbt(unsigned_psbt_bytes)?;
    if unsigned.unsigned_tx.input.len() != 1 {
        return Err(EscrowError::WitnessScriptMismatch(unsigned.unsigned_tx.compute_txid()));
    }

    let (der_bytes, tx_for_sighash) = match submission {
        Submission::DerSignature(der) => (der.clone(), unsigned.unsigned_tx.clone()),
        Submission::SignedPsbt(bytes) => {
            let signed = psbt::decode_psbt(bytes)?;
            if signed.inputs.len() != 1 {
                return Err(EscrowError::WitnessScriptMismatch(signed.unsigned_tx.compute_txid()));
            }
            let input_script = signed.inputs[0]
                .witness_script
                .as_ref()
                .ok_or_else(|| EscrowError::WitnessScriptMismatch(signed.unsigned_tx.compute_txid()))?;
            if input_script != witness_script {
                return Err(EscrowError::WitnessScriptMismatch(signed.unsigned_tx.compute_txid()));
            }
            if let Some(canonical) = canonical {
                check_outputs_match_canonical(&signed.unsigned_tx, canonical)?;
            }
            let partial_sigs = &signed.inputs[0].partial_sigs;
            let sig = partial_sigs
                .values()
                .next()
                .ok_or_else(|| EscrowError::InvalidSignature("no partial signature present".into()))?;
            (sig.signature.serialize_der().to_vec(), signed.unsigned_tx)
        }
    };

    if let Some(canonical) = canonical {
        check_outputs_match_canonical(&unsigned.unsigned_tx, canonical)?;
    }

    let sighash = psbt::compute_sighash(&tx_for_sighash, witness_script, input_value_sats)?;
    let message = Message::from_digest_slice(&sighash)
        .map_err(|e| EscrowError::InvalidSignature(format!("bad sighash: {}", e)))?;
    let signature = EcdsaSignature::from_der(&der_bytes)
        .map_err(|e| EscrowError::InvalidSignature(format!("malformed DER: {}", e)))?;

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &signature, borrower_pubkey)
        .map_err(|_| EscrowError::InvalidSignature("signature does not verify against borrower pubkey".into()))?;

    Ok(der_bytes)
}

fn check_outputs_match_canonical(tx: &bitcoin::Transaction, canonical: &CanonicalPsbtTemplate) -> Result<()> {
    let matches = tx.output.iter().any(|out| {
        out.script_pubkey == canonical.output_address.script_pubkey()
            && out.value.to_sat() >= canonical.output_value_sats.saturating_sub(psbt::DUST_LIMIT_SAT)
    });
    if matches {
        Ok(())
    } else {
        Err(EscrowError::WitnessScriptMismatch(tx.compute_txid()))
    }
}

/// Tracks submission timestamps per (loan, txType) for the rate limiter.
#[derive(Debug, Default, Clone)]
pub struct SubmissionWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl SubmissionWindow {
    pub fn record_and_check(&mut self, max_per_window: u32, window_seconds: i64, now: DateTime<Utc>) -> Result<()> {
        let cutoff = now - chrono::Duration::seconds(window_seconds);
        self.timestamps.retain(|t| *t >= cutoff);
        if self.timestamps.len() as u32 >= max_per_window {
            return Err(EscrowError::RateLimited(format!(
                "more than {} submissions in {}s window",
                max_per_window, window_seconds
            )));
        }
        self.timestamps.push(now);
        Ok(())
    }
}

/// Selects the newest borrower-signed row for `tx_type`, if one exists and
/// carries a cryptographically valid signature.
/// Presorted-by-id ordering is the caller's (storage adapter's)
/// responsibility; this just picks the first (highest-id) match.
pub fn newest_borrower_signed<'a>(
    templates: &'a [crate::psbt::PreSignedTemplate],
    loan_id: LoanId,
    tx_type: TxType,
) -> Option<&'a crate::psbt::PreSignedTemplate> {
    templates
        .iter()
        .filter(|t| t.loan_id == loan_id && t.tx_type == tx_type)
        .filter(|t| matches!(t.party_role, crate::psbt::PartyRole::Borrower))
        .max_by_key(|t| t.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::build_escrow;
    use crate::psbt::build_repayment;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{Address, Network, ScriptBuf};

    fn keypair() -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        (sk, PublicKey::from_secret_key(&secp, &sk))
    }

    #[test]
    fn rejects_signature_from_wrong_key() {
        let (borrower_sk, borrower_pub) = keypair();
        let (_, lender_pub) = keypair();
        let (_, platform_pub) = keypair();
        let escrow = build_escrow(borrower_pub, lender_pub, platform_pub, Network::Testnet).unwrap();
        let loan_id = crate::loan::new_loan_id();
        let addr = Address::p2wsh(&ScriptBuf::new(), Network::Testnet);
        let tmpl = build_repayment(loan_id, &escrow.witness_script, None, 1_000_000, addr, 5.0).unwrap();

        let sighash =
            psbt::compute_sighash(&psbt::decode_psbt(&tmpl.psbt_bytes).unwrap().unsigned_tx, &escrow.witness_script, 1_000_000)
                .unwrap();
        let message = Message::from_digest_slice(&sighash).unwrap();
        let secp = Secp256k1::new();
        let (wrong_sk, _) = keypair();
        let sig = secp.sign_ecdsa(&message, &wrong_sk);
        let der = sig.serialize_der().to_vec();

        let result = verify_submission(
            &Submission::DerSignature(der),
            &tmpl.psbt_bytes,
            &borrower_pub,
            &escrow.witness_script,
            1_000_000,
            None,
        );
        assert!(result.is_err());
        let _ = borrower_sk;
    }

    #[test]
    fn accepts_valid_borrower_signature() {
        let (borrower_sk, borrower_pub) = keypair();
        let (_, lender_pub) = keypair();
        let (_, platform_pub) = keypair();
        let escrow = build_escrow(borrower_pub, lender_pub, platform_pub, Network::Testnet).unwrap();
        let loan_id = crate::loan::new_loan_id();
        let addr = Address::p2wsh(&ScriptBuf::new(), Network::Testnet);
        let tmpl = build_repayment(loan_id, &escrow.witness_script, None, 1_000_000, addr, 5.0).unwrap();

        let unsigned_tx = psbt::decode_psbt(&tmpl.psbt_bytes).unwrap().unsigned_tx;
        let sighash = psbt::compute_sighash(&unsigned_tx, &escrow.witness_script, 1_000_000).unwrap();
        let message = Message::from_digest_slice(&sighash).unwrap();
        let secp = Secp256k1::new();
        let sig = secp.sign_ecdsa(&message, &borrower_sk);
        let der = sig.serialize_der().to_vec();

        let result = verify_submission(
            &Submission::DerSignature(der),
            &tmpl.psbt_bytes,
            &borrower_pub,
            &escrow.witness_script,
            1_000_000,
            None,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rate_limiter_rejects_sixth_submission() {
        let mut window = SubmissionWindow::default();
        let now = Utc::now();
        for _ in 0..5 {
            window.record_and_check(5, 600, now).unwrap();
        }
        assert!(window.record_and_check(5, 600, now).is_err());
    }
}
