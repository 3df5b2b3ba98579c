//! Key-ceremony and escrow-address construction (C1).
//!
//! Builds the canonical 2-of-3 P2WSH witness script and escrow address from
//! the borrower, lender, and platform public keys, and generates + seals the
//! platform-operated lender key used when a lender is "Bitcoin-blind".

use aes_gcm::aead::{Aead, KeyInit, OsRng as AesOsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Network, ScriptBuf};
use rand::RngCore;

use crate::{EscrowError, Result};

/// A validated, compressed secp256k1 public key, hex-encoded at the wire
/// boundary. Only ever constructed through [`parse_pubkey`].
pub type EscrowPubkey = PublicKey;

/// Parses and validates a 33-byte compressed secp256k1 point from hex.
///
/// Unlike the legacy regex-based checks this replaces, the key is actually
/// decoded and checked to be a point on the curve, not merely well-formed
/// hex of the right length.
pub fn parse_pubkey(hex_str: &str) -> Result<EscrowPubkey> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| EscrowError::InvalidPubkey(format!("{}: {}", crate::error::truncate_pubkey(hex_str), e)))?;

    if bytes.len() != 33 {
        return Err(EscrowError::InvalidPubkey(format!(
            "{}: expected 33 compressed bytes, got {}",
            crate::error::truncate_pubkey(hex_str),
            bytes.len()
        )));
    }
    if bytes[0] != 0x02 && bytes[0] != 0x03 {
        return Err(EscrowError::InvalidPubkey(format!(
            "{}: not a compressed-point prefix",
            crate::error::truncate_pubkey(hex_str)
        )));
    }

    PublicKey::from_slice(&bytes)
        .map_err(|e| EscrowError::InvalidPubkey(format!("{}: {}", crate::error::truncate_pubkey(hex_str), e)))
}

/// The result of a key ceremony: the canonical witness script and its
/// derived P2WSH address.
#[derive(Debug, Clone)]
pub struct EscrowAddress {
    pub address: Address,
    pub witness_script: ScriptBuf,
}

/// Sorts and dedup-checks the three escrow keys (BIP67-style, over raw
/// compressed bytes). Refuses any pair of equal keys: in a 2-of-3 multisig
/// a duplicated key silently reduces the scheme to 1-of-2, which is
/// unrecoverable if the remaining two keys are adversarial or lost. Shared
/// by [`build_escrow`], [`build_timelocked_escrow`], and the resolution
/// executor's witness-ordering logic, so there is a single place that
/// decides "which pubkey comes first in the script".
pub fn sorted_distinct_keys(
    borrower_pub: EscrowPubkey,
    lender_pub: EscrowPubkey,
    platform_pub: EscrowPubkey,
) -> Result<[EscrowPubkey; 3]> {
    let mut keys = [borrower_pub, lender_pub, platform_pub];
    if keys[0] == keys[1] || keys[1] == keys[2] || keys[0] == keys[2] {
        return Err(EscrowError::DuplicateKeys);
    }
    keys.sort_by(|a, b| a.serialize().cmp(&b.serialize()));
    Ok(keys)
}

/// Builds the canonical 2-of-3 `OP_2 <pk1> <pk2> <pk3> OP_3
/// OP_CHECKMULTISIG` witness script and its P2WSH address. The script is
/// stable no matter which party's key arrived first.
pub fn build_escrow(
    borrower_pub: EscrowPubkey,
    lender_pub: EscrowPubkey,
    platform_pub: EscrowPubkey,
    network: Network,
) -> Result<EscrowAddress> {
    let keys = sorted_distinct_keys(borrower_pub, lender_pub, platform_pub)?;

    let witness_script = multisig_2of3_script(&keys);
    let address = Address::p2wsh(&witness_script, network);

    Ok(EscrowAddress {
        address,
        witness_script,
    })
}

/// Timelock-wrapped variant of the same 2-of-3 script, used for the
/// `RECOVERY` template: `<timelock> OP_CSV OP_DROP <multisig>`.
pub fn build_timelocked_escrow(
    borrower_pub: EscrowPubkey,
    lender_pub: EscrowPubkey,
    platform_pub: EscrowPubkey,
    network: Network,
    timelock_blocks: u32,
) -> Result<EscrowAddress> {
    let keys = sorted_distinct_keys(borrower_pub, lender_pub, platform_pub)?;

    let multisig = multisig_2of3_script(&keys);
    let witness_script = Builder::new()
        .push_int(timelock_blocks as i64)
        .push_opcode(bitcoin::opcodes::all::OP_CSV)
        .push_opcode(bitcoin::opcodes::all::OP_DROP)
        .push_slice(multisig.as_bytes())
        .into_script();

    let address = Address::p2wsh(&witness_script, network);
    Ok(EscrowAddress {
        address,
        witness_script,
    })
}

fn multisig_2of3_script(sorted_keys: &[EscrowPubkey; 3]) -> ScriptBuf {
    let mut builder = Builder::new().push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_2);
    for key in sorted_keys {
        builder = builder.push_slice(key.serialize());
    }
    builder
        .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_3)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// A freshly generated platform-operated lender keypair, with the private
/// key already sealed. The plaintext secret key never outlives this
/// function's stack frame.
pub struct SealedLenderKey {
    pub public_key: EscrowPubkey,
    pub encrypted_privkey: Vec<u8>,
    pub nonce: [u8; 12],
}

/// Generates a fresh secp256k1 keypair for a "Bitcoin-blind" lender and
/// seals the private key at rest with AES-256-GCM under `kms_key`.
///
/// The lender never sees or holds this key; only the public key and the
/// encrypted blob are persisted against the loan. `kms_key` stands in for a
/// KMS-unwrapped data-encryption key — production deployments fetch this
/// from the KMS named in `EngineConfig::kms_key_id` rather than holding it
/// directly.
pub fn generate_sealed_lender_key(kms_key: &[u8; 32]) -> Result<SealedLenderKey> {
    let secp = Secp256k1::new();
    let secret_key = SecretKey::new(&mut rand::thread_rng());
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);

    let cipher = Aes256Gcm::new_from_slice(kms_key)
        .map_err(|e| EscrowError::InvalidConfig(format!("bad KMS key: {}", e)))?;

    let mut nonce_bytes = [0u8; 12];
    AesOsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let encrypted_privkey = cipher
        .encrypt(nonce, secret_key.secret_bytes().as_ref())
        .map_err(|e| EscrowError::InvalidConfig(format!("key sealing failed: {}", e)))?;

    Ok(SealedLenderKey {
        public_key,
        encrypted_privkey,
        nonce: nonce_bytes,
    })
}

/// Decrypts a sealed platform-operated lender private key for one signing
/// operation. Callers must drop the returned `SecretKey` as soon as signing
/// completes; nothing in this crate persists the plaintext.
pub fn unseal_lender_key(
    kms_key: &[u8; 32],
    encrypted_privkey: &[u8],
    nonce: &[u8; 12],
) -> Result<SecretKey> {
    let cipher = Aes256Gcm::new_from_slice(kms_key)
        .map_err(|e| EscrowError::InvalidConfig(format!("bad KMS key: {}", e)))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), encrypted_privkey)
        .map_err(|e| EscrowError::InvalidConfig(format!("key unsealing failed: {}", e)))?;
    SecretKey::from_slice(&plaintext)
        .map_err(|e| EscrowError::InvalidConfig(format!("sealed key corrupt: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_pubkey() -> EscrowPubkey {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn builds_p2wsh_address_for_distinct_keys() {
        let (b, l, p) = (random_pubkey(), random_pubkey(), random_pubkey());
        let escrow = build_escrow(b, l, p, Network::Testnet).unwrap();
        assert!(escrow.witness_script.is_witness_program() == false);
        assert_eq!(escrow.address.script_pubkey().len(), 34);
    }

    #[test]
    fn rejects_duplicate_keys() {
        let (b, p) = (random_pubkey(), random_pubkey());
        let err = build_escrow(b, b, p, Network::Testnet).unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateKeys));

        let err2 = build_escrow(b, p, p, Network::Testnet).unwrap_err();
        assert!(matches!(err2, EscrowError::DuplicateKeys));
    }

    #[test]
    fn script_ordering_is_independent_of_argument_order() {
        let (b, l, p) = (random_pubkey(), random_pubkey(), random_pubkey());
        let a = build_escrow(b, l, p, Network::Testnet).unwrap();
        let reordered = build_escrow(p, b, l, Network::Testnet).unwrap();
        assert_eq!(a.witness_script, reordered.witness_script);
        assert_eq!(a.address, reordered.address);
    }

    #[test]
    fn seal_and_unseal_roundtrip() {
        let kms_key = [7u8; 32];
        let sealed = generate_sealed_lender_key(&kms_key).unwrap();
        let secret = unseal_lender_key(&kms_key, &sealed.encrypted_privkey, &sealed.nonce).unwrap();
        let secp = Secp256k1::new();
        assert_eq!(PublicKey::from_secret_key(&secp, &secret), sealed.public_key);
    }
}
