//! PSBT construction for the four canonical transaction shapes (C2), plus
//! the `PreSignedTemplate` / `CanonicalPsbtTemplate` records from the data
//! model.
//!
//! All four shapes are built at key-ceremony time, before the escrow is
//! necessarily funded. Before the deposit is known, the single input is
//! bound to a placeholder outpoint; once the deposit confirms, the caller
//! regenerates the templates bound to the real UTXO and the
//! borrower re-signs.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::loan::LoanId;
use crate::{EscrowError, Result};

pub const DUST_LIMIT_SAT: u64 = 546;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    Repayment,
    Default,
    Liquidation,
    Recovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartyRole {
    UnsignedTemplate,
    Borrower,
    Lender,
    Platform,
}

/// One row of the per-(loan, txType, role) pre-signed template table.
/// `id` orders supersession: an accepted borrower signature is never
/// mutated in place, a new row is written with a higher `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreSignedTemplate {
    pub id: u64,
    pub loan_id: LoanId,
    pub tx_type: TxType,
    pub party_role: PartyRole,
    pub psbt_bytes: Vec<u8>,
    pub signature_der: Option<Vec<u8>>,
    pub canonical_tx_hash: Txid,
    pub valid_after: Option<DateTime<Utc>>,
    pub broadcast_status: BroadcastStatus,
    pub broadcast_txid: Option<Txid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastStatus {
    NotBroadcast,
    Pending,
    Confirmed,
    Failed,
}

/// The first-generated, normalized template metadata for a (loan, txType),
/// used to reject a signed transaction whose output address or amount was
/// altered between signing and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalPsbtTemplate {
    pub loan_id: LoanId,
    pub tx_type: TxType,
    pub canonical_txid: Txid,
    pub input_txid: Option<Txid>,
    pub input_vout: Option<u32>,
    pub input_value_sats: u64,
    pub witness_script_hash: [u8; 32],
    pub output_address: Address,
    pub output_value_sats: u64,
    pub fee_rate_sat_vb: f64,
    pub vbytes: u64,
}

/// The UTXO a template's single input spends, or `None` before the deposit
/// is known (the placeholder-outpoint case).
#[derive(Debug, Clone, Copy)]
pub struct BoundUtxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
}

fn placeholder_outpoint() -> OutPoint {
    OutPoint {
        txid: Txid::from_raw_hash(bitcoin::hashes::sha256d::Hash::all_zeros()),
        vout: 0,
    }
}

/// A single-destination output request before dust-merge and fee
/// deduction is applied.
pub struct OutputSpec {
    pub address: Address,
    pub value_sats: u64,
}

/// Builds and finalizes the unsigned `Transaction` + PSBT bytes for one of
/// the four canonical shapes, applying the fee policy and dust-merge rule.
/// Returns the assembled template plus its canonical metadata.
pub struct AssembledTemplate {
    pub psbt_bytes: Vec<u8>,
    pub canonical_tx_hash: Txid,
    pub canonical: CanonicalPsbtTemplate,
}

/// Estimates vsize for a single-input, P2WSH 2-of-3 multisig spend with
/// `num_outputs` P2WPKH/P2WSH-style outputs. A conservative fixed estimate
/// per output shape rather than a full weight-unit simulation: good enough
/// to size a fee, not a consensus-critical value.
fn estimate_vsize(num_outputs: usize) -> u64 {
    // ~41 vbytes of non-witness input overhead + ~31 vbytes per output +
    // ~10 vbytes overhead, plus a witness contribution for two DER sigs
    // and the redeem script, heavily discounted (weight/4).
    let base = 10 + 41 + (31 * num_outputs as u64);
    let witness_vbytes = (2 * 72 + 105 + 3) / 4; // two sigs + redeem script + pushes, /4 discount
    base + witness_vbytes as u64
}

/// Applies the fee policy and dust-merge rule to a set of outputs.
///
/// `flexible_index` names the output that absorbs whatever the input value
/// doesn't cover for the other, fixed-amount outputs, and is the one that
/// gets dropped first if the fee eats into it below dust. For a
/// single-output shape the index is irrelevant (there is nothing else to be
/// fixed against). For the two-output DEFAULT/LIQUIDATION shape this must be
/// the borrower's index — the lender's output is a fixed amount owed, not a
/// remainder.
fn apply_fee_and_dust(
    mut outputs: Vec<OutputSpec>,
    input_value_sats: u64,
    fee_rate_sat_vb: f64,
    flexible_index: usize,
) -> Result<(Vec<OutputSpec>, u64)> {
    if outputs.is_empty() {
        return Err(EscrowError::InvalidConfig("no outputs to assemble".into()));
    }

    if outputs.len() == 1 {
        let fee_sats = (estimate_vsize(1) as f64 * fee_rate_sat_vb).ceil() as u64;
        if fee_sats >= input_value_sats {
            return Err(EscrowError::InvalidConfig("fee exceeds input value".into()));
        }
        outputs[0].value_sats = input_value_sats - fee_sats;
        return Ok((outputs, fee_sats));
    }

    // Two outputs: one fixed recipient, one flexible output that absorbs the
    // remainder and is dropped first if that remainder is dust.
    let fixed_index = 1 - flexible_index;
    let vsize = estimate_vsize(2);
    let fee_sats = (vsize as f64 * fee_rate_sat_vb).ceil() as u64;
    let fixed_amount = outputs[fixed_index].value_sats;

    if fixed_amount + fee_sats >= input_value_sats {
        // No room left for the flexible side: if the remainder would be dust,
        // collapse to the fixed recipient alone, re-pricing the fee for one output.
        let single_fee = (estimate_vsize(1) as f64 * fee_rate_sat_vb).ceil() as u64;
        if single_fee >= input_value_sats {
            return Err(EscrowError::InvalidConfig("fee exceeds input value".into()));
        }
        let mut fixed_output = outputs.swap_remove(fixed_index);
        fixed_output.value_sats = input_value_sats - single_fee;
        return Ok((vec![fixed_output], single_fee));
    }

    outputs[flexible_index].value_sats = input_value_sats - fixed_amount - fee_sats;

    if outputs[flexible_index].value_sats < DUST_LIMIT_SAT {
        let dust = outputs.remove(flexible_index);
        outputs[0].value_sats += dust.value_sats;
    }

    Ok((outputs, fee_sats))
}

fn assemble_template(
    loan_id: LoanId,
    tx_type: TxType,
    witness_script: &ScriptBuf,
    bound_utxo: Option<BoundUtxo>,
    input_value_sats: u64,
    outputs: Vec<OutputSpec>,
    fee_rate_sat_vb: f64,
    locktime: LockTime,
    sequence: Sequence,
    flexible_output_index: usize,
) -> Result<AssembledTemplate> {
    let (mut outputs, fee_sats) =
        apply_fee_and_dust(outputs, input_value_sats, fee_rate_sat_vb, flexible_output_index)?;

    // Canonical ordering: lexicographic by output address string.
    outputs.sort_by(|a, b| a.address.to_string().cmp(&b.address.to_string()));

    let outpoint = match bound_utxo {
        Some(u) => OutPoint { txid: u.txid, vout: u.vout },
        None => placeholder_outpoint(),
    };

    let tx_outputs: Vec<TxOut> = outputs
        .iter()
        .map(|o| TxOut {
            value: Amount::from_sat(o.value_sats),
            script_pubkey: o.address.script_pubkey(),
        })
        .collect();

    let unsigned_tx = Transaction {
        version: Version::TWO,
        lock_time: locktime,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: tx_outputs,
    };

    let canonical_tx_hash = unsigned_tx.compute_txid();

    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| EscrowError::PsbtError(e.to_string()))?;
    psbt.inputs[0].witness_script = Some(witness_script.clone());
    psbt.inputs[0].witness_utxo = Some(TxOut {
        value: Amount::from_sat(input_value_sats),
        script_pubkey: witness_script_to_p2wsh_spk(witness_script),
    });
    psbt.inputs[0].sighash_type = Some(EcdsaSighashType::All.into());

    let psbt_bytes = psbt.serialize();

    let primary_output = outputs
        .iter()
        .min_by(|a, b| a.address.to_string().cmp(&b.address.to_string()))
        .expect("at least one output survives dust merge");

    let canonical = CanonicalPsbtTemplate {
        loan_id,
        tx_type,
        canonical_txid: canonical_tx_hash,
        input_txid: bound_utxo.map(|u| u.txid),
        input_vout: bound_utxo.map(|u| u.vout),
        input_value_sats,
        witness_script_hash: witness_script_sha256(witness_script),
        output_address: primary_output.address.clone(),
        output_value_sats: primary_output.value_sats,
        fee_rate_sat_vb,
        vbytes: estimate_vsize(outputs.len()),
    };
    let _ = fee_sats; // fee is implicit in input_value_sats - sum(outputs), kept for callers that want it

    Ok(AssembledTemplate {
        psbt_bytes,
        canonical_tx_hash,
        canonical,
    })
}

fn witness_script_to_p2wsh_spk(witness_script: &ScriptBuf) -> ScriptBuf {
    bitcoin::Address::p2wsh(witness_script, bitcoin::Network::Bitcoin).script_pubkey()
}

fn witness_script_sha256(witness_script: &ScriptBuf) -> [u8; 32] {
    use bitcoin::hashes::sha256;
    sha256::Hash::hash(witness_script.as_bytes()).to_byte_array()
}

/// `REPAYMENT`: single output returning the full collateral (minus fee) to
/// the borrower.
pub fn build_repayment(
    loan_id: LoanId,
    witness_script: &ScriptBuf,
    bound_utxo: Option<BoundUtxo>,
    input_value_sats: u64,
    borrower_return_address: Address,
    fee_rate_sat_vb: f64,
) -> Result<AssembledTemplate> {
    assemble_template(
        loan_id,
        TxType::Repayment,
        witness_script,
        bound_utxo,
        input_value_sats,
        vec![OutputSpec {
            address: borrower_return_address,
            value_sats: 0,
        }],
        fee_rate_sat_vb,
        LockTime::ZERO,
        Sequence::ENABLE_RBF_NO_LOCKTIME,
        0,
    )
}

/// `DEFAULT` / `LIQUIDATION`: two outputs — lender gets `amount_owed_sats`,
/// borrower gets the remainder minus fee, with a single lender-only output
/// if the remainder would be dust. Both tx types share this shape; only the
/// amounts differ depending on whether the trigger was term expiry or LTV.
pub fn build_default_or_liquidation(
    loan_id: LoanId,
    tx_type: TxType,
    witness_script: &ScriptBuf,
    bound_utxo: Option<BoundUtxo>,
    input_value_sats: u64,
    lender_destination: Address,
    amount_owed_sats: u64,
    borrower_return_address: Address,
    fee_rate_sat_vb: f64,
) -> Result<AssembledTemplate> {
    debug_assert!(matches!(tx_type, TxType::Default | TxType::Liquidation));
    assemble_template(
        loan_id,
        tx_type,
        witness_script,
        bound_utxo,
        input_value_sats,
        vec![
            OutputSpec {
                address: lender_destination,
                value_sats: amount_owed_sats,
            },
            OutputSpec {
                address: borrower_return_address,
                value_sats: 0,
            },
        ],
        fee_rate_sat_vb,
        LockTime::ZERO,
        Sequence::ENABLE_RBF_NO_LOCKTIME,
        1, // borrower's output (index 1) is the flexible remainder, not the lender's fixed amount
    )
}

/// `RECOVERY`: single output to the borrower, spent via the timelock
/// script and only broadcastable once `valid_after` has passed.
pub fn build_recovery(
    loan_id: LoanId,
    timelocked_witness_script: &ScriptBuf,
    bound_utxo: Option<BoundUtxo>,
    input_value_sats: u64,
    borrower_return_address: Address,
    fee_rate_sat_vb: f64,
    timelock_blocks: u32,
) -> Result<AssembledTemplate> {
    assemble_template(
        loan_id,
        TxType::Recovery,
        timelocked_witness_script,
        bound_utxo,
        input_value_sats,
        vec![OutputSpec {
            address: borrower_return_address,
            value_sats: 0,
        }],
        fee_rate_sat_vb,
        LockTime::ZERO,
        Sequence::from_height(timelock_blocks as u16),
        0,
    )
}

/// Computes the BIP-143 P2WSH sighash for the template's single input,
/// given the witness script and input value it was built against.
pub fn compute_sighash(
    tx: &Transaction,
    witness_script: &ScriptBuf,
    input_value_sats: u64,
) -> Result<[u8; 32]> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(0, witness_script, Amount::from_sat(input_value_sats), EcdsaSighashType::All)
        .map_err(|e| EscrowError::PsbtError(e.to_string()))?;
    Ok(sighash.to_byte_array())
}

/// Extracts the unsigned `Transaction` back out of serialized PSBT bytes.
pub fn decode_psbt(psbt_bytes: &[u8]) -> Result<Psbt> {
    Psbt::deserialize(psbt_bytes).map_err(|e| EscrowError::PsbtError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::build_escrow;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::Network;

    fn random_pubkey() -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn sample_escrow() -> (ScriptBuf, LoanId) {
        let escrow = build_escrow(random_pubkey(), random_pubkey(), random_pubkey(), Network::Testnet).unwrap();
        (escrow.witness_script, crate::loan::new_loan_id())
    }

    fn sample_address() -> Address {
        Address::p2wsh(&ScriptBuf::new(), Network::Testnet)
    }

    fn distinct_address(tag: u8) -> Address {
        Address::p2wsh(&ScriptBuf::from(vec![0x51, tag]), Network::Testnet)
    }

    #[test]
    fn repayment_single_output_absorbs_fee() {
        let (script, loan_id) = sample_escrow();
        let tmpl = build_repayment(loan_id, &script, None, 40_000_000, sample_address(), 10.0).unwrap();
        assert_eq!(tmpl.canonical.output_value_sats + 0, tmpl.canonical.input_value_sats - implied_fee(&tmpl));
    }

    fn implied_fee(tmpl: &AssembledTemplate) -> u64 {
        let vsize = estimate_vsize(1);
        (vsize as f64 * tmpl.canonical.fee_rate_sat_vb).ceil() as u64
    }

    #[test]
    fn default_split_two_outputs_when_both_clear_dust() {
        let (script, loan_id) = sample_escrow();
        let lender_addr = distinct_address(1);
        let borrower_addr = distinct_address(2);
        let tmpl = build_default_or_liquidation(
            loan_id,
            TxType::Default,
            &script,
            None,
            40_000_000,
            lender_addr.clone(),
            20_500_000,
            borrower_addr.clone(),
            10.0,
        )
        .unwrap();
        let psbt = decode_psbt(&tmpl.psbt_bytes).unwrap();
        assert_eq!(psbt.unsigned_tx.output.len(), 2);
        let lender_out = psbt
            .unsigned_tx
            .output
            .iter()
            .find(|o| o.script_pubkey == lender_addr.script_pubkey())
            .unwrap();
        let borrower_out = psbt
            .unsigned_tx
            .output
            .iter()
            .find(|o| o.script_pubkey == borrower_addr.script_pubkey())
            .unwrap();
        assert_eq!(lender_out.value.to_sat(), 20_500_000);
        assert!(borrower_out.value.to_sat() > 19_000_000);
    }

    #[test]
    fn default_split_drops_dust_to_single_output() {
        let (script, loan_id) = sample_escrow();
        let lender_addr = distinct_address(1);
        let borrower_addr = distinct_address(2);
        let tmpl = build_default_or_liquidation(
            loan_id,
            TxType::Default,
            &script,
            None,
            40_000_000,
            lender_addr.clone(),
            39_999_900, // leaves no room for the borrower's flexible output after fee
            borrower_addr,
            10.0,
        )
        .unwrap();
        // single surviving output, paid entirely to the lender (the fixed recipient).
        let psbt = decode_psbt(&tmpl.psbt_bytes).unwrap();
        assert_eq!(psbt.unsigned_tx.output.len(), 1);
        assert_eq!(psbt.unsigned_tx.output[0].script_pubkey, lender_addr.script_pubkey());
        assert!(tmpl.canonical.output_value_sats > 0);
        assert!(tmpl.canonical.output_value_sats < 40_000_000);
    }

    #[test]
    fn recovery_uses_csv_sequence() {
        let (script, loan_id) = sample_escrow();
        let tmpl = build_recovery(loan_id, &script, None, 40_000_000, sample_address(), 10.0, 144).unwrap();
        let psbt = decode_psbt(&tmpl.psbt_bytes).unwrap();
        assert_eq!(psbt.unsigned_tx.input[0].sequence, Sequence::from_height(144));
    }
}
