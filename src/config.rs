use serde::{Deserialize, Serialize};
use bitcoin::Network;

/// Engine-wide configuration. Mirrors the protocol's `[config]` surface:
/// network selection, chain-monitor thresholds, LTV bands, and the two
/// outbound service URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub bitcoin_network: Network,
    pub confirmation_threshold: u32,
    pub ltv_check_interval_sec: u64,
    pub liquidation_ltv_percent: f64,
    pub warning_ltv_percent: f64,
    pub critical_ltv_percent: f64,
    pub grace_days: i64,
    /// Window after `commit_funding` by which the lender must send fiat,
    /// before R4 considers the loan cancellable.
    pub funding_deadline_days: i64,
    /// Target initial LTV used to size required collateral at loan
    /// creation (the "healthy" band boundary).
    pub initial_target_ltv_percent: f64,
    pub platform_btc_address: String,
    pub platform_pubkey: String,
    pub kms_key_id: String,
    pub chain_indexer_url: String,
    pub price_oracle_url: String,
    pub database_path: String,
    pub fee_rate_fallback_sat_vb: f64,
    pub dust_limit_sat: u64,
    pub max_signature_submissions_per_window: u32,
    pub signature_submission_window_sec: i64,
    /// CSV timelock, in blocks, wrapping the RECOVERY witness script.
    pub recovery_timelock_blocks: u32,
    /// Development-mode override for the RECOVERY `valid_after` check.
    /// Must never be set in a production deployment.
    pub dev_mode_timelock_override: bool,
    /// Per-loan rate limit on `emergencyRecovery` calls: the endpoint is
    /// intentionally unauthenticated, so it is rate-limited instead.
    pub max_emergency_recovery_per_hour: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bitcoin_network: Network::Testnet,
            confirmation_threshold: 1,
            ltv_check_interval_sec: 300,
            liquidation_ltv_percent: 0.90,
            warning_ltv_percent: 0.50,
            critical_ltv_percent: 0.70,
            grace_days: 7,
            funding_deadline_days: 3,
            initial_target_ltv_percent: 0.50,
            platform_btc_address: String::new(),
            platform_pubkey: String::new(),
            kms_key_id: "local-dev".to_string(),
            chain_indexer_url: "http://127.0.0.1:18332".to_string(),
            price_oracle_url: "https://api.coingecko.com/api/v3/simple/price?ids=bitcoin&vs_currencies=usd,eur".to_string(),
            database_path: "./escrow-lend.db".to_string(),
            fee_rate_fallback_sat_vb: 10.0,
            dust_limit_sat: 546,
            max_signature_submissions_per_window: 5,
            signature_submission_window_sec: 600,
            recovery_timelock_blocks: 4_320, // ~30 days at 10 min/block
            dev_mode_timelock_override: false,
            max_emergency_recovery_per_hour: 10,
        }
    }
}

impl EngineConfig {
    pub fn testnet() -> Self {
        Self::default()
    }

    pub fn mainnet() -> Self {
        Self {
            bitcoin_network: Network::Bitcoin,
            confirmation_threshold: 2,
            database_path: "./escrow-lend-mainnet.db".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.confirmation_threshold == 0 {
            return Err(crate::EscrowError::InvalidConfig(
                "confirmation_threshold must be >= 1".to_string(),
            ));
        }

        if !(self.warning_ltv_percent < self.critical_ltv_percent
            && self.critical_ltv_percent < self.liquidation_ltv_percent)
        {
            return Err(crate::EscrowError::InvalidConfig(
                "LTV bands must satisfy warning < critical < liquidation".to_string(),
            ));
        }

        if self.grace_days < 0 {
            return Err(crate::EscrowError::InvalidConfig(
                "grace_days must be >= 0".to_string(),
            ));
        }

        if self.dust_limit_sat == 0 {
            return Err(crate::EscrowError::InvalidConfig(
                "dust_limit_sat must be > 0".to_string(),
            ));
        }

        if self.funding_deadline_days < 0 {
            return Err(crate::EscrowError::InvalidConfig(
                "funding_deadline_days must be >= 0".to_string(),
            ));
        }

        if !(self.initial_target_ltv_percent > 0.0 && self.initial_target_ltv_percent <= 1.0) {
            return Err(crate::EscrowError::InvalidConfig(
                "initial_target_ltv_percent must be in (0, 1]".to_string(),
            ));
        }

        if self.max_emergency_recovery_per_hour == 0 {
            return Err(crate::EscrowError::InvalidConfig(
                "max_emergency_recovery_per_hour must be >= 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testnet_and_mainnet_defaults_validate() {
        EngineConfig::testnet().validate().unwrap();
        EngineConfig::mainnet().validate().unwrap();
    }

    #[test]
    fn mainnet_requires_two_confirmations() {
        assert_eq!(EngineConfig::mainnet().confirmation_threshold, 2);
        assert_eq!(EngineConfig::testnet().confirmation_threshold, 1);
    }

    #[test]
    fn rejects_inverted_ltv_bands() {
        let mut cfg = EngineConfig::testnet();
        cfg.warning_ltv_percent = 0.9;
        assert!(cfg.validate().is_err());
    }
}
