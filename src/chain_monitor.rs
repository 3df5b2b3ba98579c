//! Chain monitoring state machine (C4) and the `ChainIndexer` outbound
//! adapter trait.
//!
//! Polls for UTXOs at escrow addresses, counts confirmations, recognizes
//! top-ups once a deposit has confirmed, and computes current LTV for the
//! LTV-monitoring loop.

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::{Address, Amount, Transaction, Txid};
use chrono::{DateTime, Utc};

use crate::loan::{Currency, Loan};
use crate::{EscrowError, Result};

#[derive(Debug, Clone)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    pub confirmations: u32,
}

#[derive(Debug, Clone)]
pub struct TxInfo {
    pub txid: Txid,
    pub confirmations: u32,
    pub outputs: Vec<(Address, Amount)>,
}

#[derive(Debug, Clone)]
pub enum BroadcastOutcome {
    Accepted { txid: Txid },
    AlreadyInMempool { txid: Txid },
    Rejected { reason: String },
}

/// Outbound collaborator contract for the chain indexer:
/// idempotent reads, a `broadcast` whose error kind distinguishes
/// "already-in-mempool" (treated as success) from other failures.
#[async_trait]
pub trait ChainIndexer: Send + Sync {
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>>;
    async fn get_tx(&self, txid: Txid) -> Result<TxInfo>;
    async fn broadcast(&self, raw: &[u8]) -> Result<BroadcastOutcome>;
    async fn fee_estimate(&self) -> Result<f64>;
}

/// `bitcoincore-rpc`-backed chain indexer, the concrete implementation
/// shipped by this crate: `get_utxos`/`get_transaction`/
/// `broadcast_transaction`/`estimate_fee` against a full node's RPC.
pub struct BitcoinRpcIndexer {
    client: bitcoincore_rpc::Client,
}

impl BitcoinRpcIndexer {
    pub fn new(rpc_url: &str, auth: bitcoincore_rpc::Auth) -> Result<Self> {
        let client = bitcoincore_rpc::Client::new(rpc_url, auth)
            .map_err(|e| EscrowError::InvalidConfig(format!("rpc connect failed: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChainIndexer for BitcoinRpcIndexer {
    async fn get_utxos(&self, address: &Address) -> Result<Vec<Utxo>> {
        use bitcoincore_rpc::json::ScanTxOutRequest;
        use bitcoincore_rpc::RpcApi;

        let descriptor = format!("addr({})", address);
        let request = ScanTxOutRequest::Single(descriptor);
        let result = self
            .client
            .scan_tx_out_set_blocking(&[request])
            .map_err(|e| EscrowError::InvalidConfig(format!("scantxoutset failed: {}", e)))?;

        Ok(result
            .unspents
            .into_iter()
            .map(|u| Utxo {
                txid: u.txid,
                vout: u.vout,
                value: u.amount,
                confirmations: u.height.unwrap_or(0) as u32,
            })
            .collect())
    }

    async fn get_tx(&self, txid: Txid) -> Result<TxInfo> {
        use bitcoincore_rpc::RpcApi;
        let raw = self
            .client
            .get_raw_transaction_info(&txid, None)
            .map_err(|e| EscrowError::InvalidConfig(format!("getrawtransaction failed: {}", e)))?;

        let tx: Transaction = bitcoin::consensus::deserialize(&raw.hex)?;
        let outputs = tx
            .output
            .iter()
            .filter_map(|o| {
                Address::from_script(&o.script_pubkey, bitcoin::Network::Bitcoin)
                    .ok()
                    .map(|a| (a, o.value))
            })
            .collect();

        Ok(TxInfo {
            txid,
            confirmations: raw.confirmations.unwrap_or(0),
            outputs,
        })
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<BroadcastOutcome> {
        use bitcoincore_rpc::RpcApi;
        let tx: Transaction = bitcoin::consensus::deserialize(raw)?;
        match self.client.send_raw_transaction(&tx) {
            Ok(txid) => Ok(BroadcastOutcome::Accepted { txid }),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("already in block chain") || msg.contains("txn-already-in-mempool") {
                    Ok(BroadcastOutcome::AlreadyInMempool { txid: tx.compute_txid() })
                } else {
                    Ok(BroadcastOutcome::Rejected { reason: msg })
                }
            }
        }
    }

    async fn fee_estimate(&self) -> Result<f64> {
        use bitcoincore_rpc::RpcApi;
        match self.client.estimate_smart_fee(2, None) {
            Ok(est) if est.fee_rate.is_some() => {
                let btc_per_kvb = est.fee_rate.unwrap().to_btc();
                Ok((btc_per_kvb * 100_000_000.0) / 1000.0)
            }
            _ => Ok(10.0),
        }
    }
}

/// Per-address polling state tracked by the monitor loop. Guards
/// "at-most-one deposit-confirmed event per loan" and "at-most-one top-up
/// recognized per pending amount".
#[derive(Debug, Default)]
pub struct MonitorState {
    pub last_poll: HashMap<Address, DateTime<Utc>>,
}

/// LTV band classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtvBand {
    Healthy,
    Warning,
    Critical,
    LiquidationTrigger,
}

pub fn classify_ltv(ltv: f64, warning: f64, critical: f64, liquidation: f64) -> LtvBand {
    if ltv >= liquidation {
        LtvBand::LiquidationTrigger
    } else if ltv >= critical {
        LtvBand::Critical
    } else if ltv >= warning {
        LtvBand::Warning
    } else {
        LtvBand::Healthy
    }
}

/// Checks a loan's escrow address for a qualifying deposit and, if found
/// and not already recorded, returns the facts needed to confirm it.
/// Idempotent: returns `None` once `loan.deposit_confirmed_at` is set,
/// satisfying the "at most one confirmed event" ordering rule.
pub async fn check_deposit(
    indexer: &dyn ChainIndexer,
    loan: &Loan,
    confirmation_threshold: u32,
) -> Result<Option<(Txid, u32, u64, u32)>> {
    if loan.deposit_confirmed_at.is_some() {
        return Ok(None);
    }
    let address = loan
        .escrow_address
        .as_ref()
        .ok_or_else(|| EscrowError::UtxoMissing(loan.id))?;

    let utxos = indexer.get_utxos(address).await?;
    let candidate = utxos
        .into_iter()
        .find(|u| u.value.to_sat() >= loan.collateral_required_sats);

    match candidate {
        Some(u) if u.confirmations >= confirmation_threshold => {
            Ok(Some((u.txid, u.vout, u.value.to_sat(), u.confirmations)))
        }
        _ => Ok(None),
    }
}

/// Checks for a top-up transaction matching a loan's pending amount. Only
/// meaningful once `top_up_monitoring_active` and `pending_top_up_sats`
/// are set.
pub async fn check_top_up(indexer: &dyn ChainIndexer, loan: &Loan) -> Result<Option<(Txid, u32, u64)>> {
    if !loan.top_up_monitoring_active {
        return Ok(None);
    }
    let Some(pending) = loan.pending_top_up_sats else {
        return Ok(None);
    };
    let address = loan
        .escrow_address
        .as_ref()
        .ok_or_else(|| EscrowError::UtxoMissing(loan.id))?;

    let utxos = indexer.get_utxos(address).await?;
    let dust = crate::psbt::DUST_LIMIT_SAT;
    let candidate = utxos.into_iter().find(|u| {
        let v = u.value.to_sat();
        v + dust >= pending && v <= pending + dust
    });

    Ok(candidate.map(|u| (u.txid, u.vout, u.value.to_sat())))
}

/// Computes current LTV for an active loan given a BTC price quoted in the
/// loan's currency, returning `None` if there is no confirmed collateral.
pub fn current_ltv(loan: &Loan, btc_price: f64, currency: &Currency) -> Option<f64> {
    let _ = currency; // price is already expressed in the loan's currency by the caller
    loan.current_ltv(btc_price)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_follow_configured_thresholds() {
        assert_eq!(classify_ltv(0.3, 0.5, 0.7, 0.9), LtvBand::Healthy);
        assert_eq!(classify_ltv(0.55, 0.5, 0.7, 0.9), LtvBand::Warning);
        assert_eq!(classify_ltv(0.75, 0.5, 0.7, 0.9), LtvBand::Critical);
        assert_eq!(classify_ltv(0.95, 0.5, 0.7, 0.9), LtvBand::LiquidationTrigger);
    }
}
