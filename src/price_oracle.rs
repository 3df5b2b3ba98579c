//! Price oracle adapter (C5): USD/EUR BTC price with fallback and a
//! process-wide stress-test override.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{EscrowError, Result};

#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub usd: f64,
    pub eur: f64,
    pub timestamp_unix: i64,
    pub source: PriceSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Aggregator,
    Fallback,
    StressOverride,
}

/// Outbound price-feed contract.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_price(&self) -> Result<PriceQuote>;
}

#[derive(Deserialize)]
struct CoinGeckoResponse {
    bitcoin: CoinGeckoPrice,
}

#[derive(Deserialize)]
struct CoinGeckoPrice {
    usd: f64,
    eur: f64,
}

/// A process-wide override used by stress tests. Bounded
/// lifecycle: explicit admin `set`/`clear`; every read while set is logged
/// as a warning.
static STRESS_OVERRIDE: RwLock<Option<PriceQuote>> = RwLock::new(None);

pub fn set_stress_override(usd: f64, eur: f64) {
    let mut guard = STRESS_OVERRIDE.write().expect("stress override lock poisoned");
    *guard = Some(PriceQuote {
        usd,
        eur,
        timestamp_unix: Utc::now().timestamp(),
        source: PriceSource::StressOverride,
    });
    log::warn!("price stress override installed: usd={} eur={}", usd, eur);
}

pub fn clear_stress_override() {
    let mut guard = STRESS_OVERRIDE.write().expect("stress override lock poisoned");
    *guard = None;
    log::info!("price stress override cleared");
}

fn read_stress_override() -> Option<PriceQuote> {
    let guard = STRESS_OVERRIDE.read().expect("stress override lock poisoned");
    if let Some(quote) = *guard {
        log::warn!("price stress override active, returning usd={} eur={}", quote.usd, quote.eur);
        Some(quote)
    } else {
        None
    }
}

/// CoinGecko-style aggregator with a fixed fallback price. The stress
/// override, when installed, is consulted first and short-circuits the
/// network call entirely.
pub struct AggregatorPriceFeed {
    client: reqwest::Client,
    url: String,
    fallback_usd: f64,
    fallback_eur: f64,
}

impl AggregatorPriceFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            fallback_usd: 60_000.0,
            fallback_eur: 55_000.0,
        }
    }

    pub fn with_fallback(mut self, usd: f64, eur: f64) -> Self {
        self.fallback_usd = usd;
        self.fallback_eur = eur;
        self
    }

    fn fallback(&self) -> PriceQuote {
        PriceQuote {
            usd: self.fallback_usd,
            eur: self.fallback_eur,
            timestamp_unix: Utc::now().timestamp(),
            source: PriceSource::Fallback,
        }
    }
}

#[async_trait]
impl PriceFeed for AggregatorPriceFeed {
    async fn get_price(&self) -> Result<PriceQuote> {
        if let Some(quote) = read_stress_override() {
            return Ok(quote);
        }

        let response = match self
            .client
            .get(&self.url)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                log::warn!("price oracle returned {}, using fallback", r.status());
                return Ok(self.fallback());
            }
            Err(e) => {
                log::warn!("price oracle request failed: {}, using fallback", e);
                return Ok(self.fallback());
            }
        };

        match response.json::<CoinGeckoResponse>().await {
            Ok(parsed) => Ok(PriceQuote {
                usd: parsed.bitcoin.usd,
                eur: parsed.bitcoin.eur,
                timestamp_unix: Utc::now().timestamp(),
                source: PriceSource::Aggregator,
            }),
            Err(e) => {
                log::warn!("price oracle response unparseable: {}, using fallback", e);
                Ok(self.fallback())
            }
        }
    }
}

/// A fake feed for tests, returning a fixed price.
pub struct FixedPriceFeed {
    pub usd: f64,
    pub eur: f64,
}

#[async_trait]
impl PriceFeed for FixedPriceFeed {
    async fn get_price(&self) -> Result<PriceQuote> {
        if let Some(quote) = read_stress_override() {
            return Ok(quote);
        }
        Ok(PriceQuote {
            usd: self.usd,
            eur: self.eur,
            timestamp_unix: Utc::now().timestamp(),
            source: PriceSource::Aggregator,
        })
    }
}

pub fn price_for_currency(quote: &PriceQuote, currency: &crate::loan::Currency) -> Result<f64> {
    match currency {
        crate::loan::Currency::USD => Ok(quote.usd),
        crate::loan::Currency::EUR => Ok(quote.eur),
        crate::loan::Currency::GBP | crate::loan::Currency::Custom(_) => {
            Err(EscrowError::PriceUnavailable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stress_override_short_circuits_feed() {
        clear_stress_override();
        let feed = FixedPriceFeed { usd: 50_000.0, eur: 45_000.0 };
        set_stress_override(12_345.0, 11_000.0);
        let quote = feed.get_price().await.unwrap();
        assert_eq!(quote.usd, 12_345.0);
        assert_eq!(quote.source, PriceSource::StressOverride);
        clear_stress_override();

        let quote2 = feed.get_price().await.unwrap();
        assert_eq!(quote2.usd, 50_000.0);
    }
}
