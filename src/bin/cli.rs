use std::str::FromStr;

use bitcoin::secp256k1::SecretKey;
use bitcoin::Txid;
use clap::{Parser, Subcommand};
use escrow_lend::{
    price_oracle, AdminOverride, ChainIndexer, Currency, EngineConfig, EscrowEngine, LenderPayoutPreference,
    LoanId, LoanStatus, Outcome, PriceFeed, Result, StorageAdapter, TxType,
};

#[derive(Parser)]
#[command(name = "escrow-lend")]
#[command(about = "Bitcoin-collateralized peer-to-peer fiat lending escrow")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "testnet")]
    network: String,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, env = "PLATFORM_SECRET_KEY")]
    platform_key: String,

    #[arg(long, env = "KMS_KEY_HEX")]
    kms_key: String,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Post a new loan offer
    CreateLoan {
        #[arg(long)]
        borrower: String,
        #[arg(long)]
        principal_minor_units: u64,
        #[arg(long, default_value = "USD")]
        currency: String,
        #[arg(long)]
        interest_rate_percent: f64,
        #[arg(long)]
        term_months: u32,
    },
    /// A lender accepts an offer
    CommitFunding {
        loan_id: String,
        #[arg(long)]
        lender: String,
        #[arg(long, default_value = "fiat")]
        payout: String,
        #[arg(long)]
        lender_return_address: Option<String>,
    },
    /// The borrower supplies their key, building the escrow address
    ProvideBorrowerKey {
        loan_id: String,
        #[arg(long)]
        borrower_pubkey: String,
        #[arg(long)]
        borrower_return_address: String,
    },
    /// The borrower signals the on-chain deposit was sent
    ConfirmDeposit { loan_id: String },
    /// The borrower signals fiat repayment was sent
    ConfirmRepaymentSent { loan_id: String },
    /// The lender signals the original fiat principal was sent
    ConfirmFiatSent { loan_id: String },
    /// The lender signals the fiat repayment arrived; runs outcome engine
    ConfirmRepaymentReceived { loan_id: String },
    /// Re-run the outcome engine for a loan, optionally with an override
    ResolveDispute {
        loan_id: String,
        #[arg(long)]
        override_outcome: Option<String>,
        #[arg(long, default_value = "operator")]
        actor: String,
    },
    /// Hand back the newest borrower-signed RECOVERY PSBT if its timelock has matured
    EmergencyRecovery { loan_id: String },
    /// Show a loan's current state
    Show { loan_id: String },
    /// List loans, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the dispute audit log for a loan
    AuditLog { loan_id: String },
}

fn parse_currency(s: &str) -> Currency {
    match s.to_uppercase().as_str() {
        "USD" => Currency::USD,
        "EUR" => Currency::EUR,
        "GBP" => Currency::GBP,
        other => Currency::Custom(other.to_string()),
    }
}

fn parse_outcome(s: &str) -> Result<Outcome> {
    Ok(match s.to_lowercase().as_str() {
        "cooperative_close" => Outcome::CooperativeClose,
        "default" => Outcome::Default,
        "liquidation" => Outcome::Liquidation,
        "cancellation" => Outcome::Cancellation,
        "recovery" => Outcome::Recovery,
        "under_review" => Outcome::UnderReview,
        other => {
            return Err(escrow_lend::EscrowError::InvalidConfig(format!("unknown outcome: {}", other)));
        }
    })
}

fn tx_type_for_outcome(outcome: Outcome) -> Option<TxType> {
    match outcome {
        Outcome::CooperativeClose => Some(TxType::Repayment),
        Outcome::Default => Some(TxType::Default),
        Outcome::Liquidation => Some(TxType::Liquidation),
        Outcome::Cancellation | Outcome::Recovery => Some(TxType::Recovery),
        Outcome::UnderReview => None,
    }
}

async fn build_engine(cli: &Cli) -> Result<EscrowEngine> {
    let config: EngineConfig = if let Some(path) = &cli.config {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)?
    } else {
        match cli.network.as_str() {
            "mainnet" => EngineConfig::mainnet(),
            _ => EngineConfig::testnet(),
        }
    };
    config.validate()?;

    let storage = StorageAdapter::open(&config.database_path)?;

    let platform_secret_key = SecretKey::from_str(&cli.platform_key)
        .map_err(|e| escrow_lend::EscrowError::InvalidConfig(format!("bad platform key: {}", e)))?;

    let kms_bytes = hex::decode(&cli.kms_key)
        .map_err(|e| escrow_lend::EscrowError::InvalidConfig(format!("bad kms key hex: {}", e)))?;
    let mut kms_key = [0u8; 32];
    if kms_bytes.len() != 32 {
        return Err(escrow_lend::EscrowError::InvalidConfig("kms key must be 32 bytes".into()));
    }
    kms_key.copy_from_slice(&kms_bytes);

    let indexer = escrow_lend::chain_monitor::BitcoinRpcIndexer::new(
        &config.chain_indexer_url,
        bitcoincore_rpc::Auth::None,
    )?;
    let price_feed = price_oracle::AggregatorPriceFeed::new(config.price_oracle_url.clone())
        .with_fallback(60_000.0, 55_000.0);

    EscrowEngine::new(
        config,
        storage,
        Box::new(indexer) as Box<dyn ChainIndexer>,
        Box::new(price_feed) as Box<dyn PriceFeed>,
        platform_secret_key,
        kms_key,
    )
}

fn parse_loan_id(s: &str) -> Result<LoanId> {
    Txid::from_str(s).map_err(|e| escrow_lend::EscrowError::InvalidConfig(e.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let engine = build_engine(&cli).await?;

    match cli.command {
        Commands::CreateLoan { borrower, principal_minor_units, currency, interest_rate_percent, term_months } => {
            let loan_id = engine
                .create_loan(borrower, principal_minor_units, parse_currency(&currency), interest_rate_percent, term_months)
                .await?;
            println!("loan posted: {}", loan_id);
        }

        Commands::CommitFunding { loan_id, lender, payout, lender_return_address } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let preference = if payout.eq_ignore_ascii_case("btc") {
                LenderPayoutPreference::Btc
            } else {
                LenderPayoutPreference::Fiat
            };
            engine.commit_funding(loan_id, lender, preference, lender_return_address).await?;
            println!("loan {}: funding committed", loan_id);
        }

        Commands::ProvideBorrowerKey { loan_id, borrower_pubkey, borrower_return_address } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let escrow = engine.provide_borrower_key(loan_id, &borrower_pubkey, &borrower_return_address).await?;
            println!("loan {}: escrow address {}", loan_id, escrow.address);
            println!("   send the required collateral to this address");
        }

        Commands::ConfirmDeposit { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            engine.confirm_deposit(loan_id).await?;
            println!("loan {}: deposit signal recorded", loan_id);
        }

        Commands::ConfirmRepaymentSent { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            engine.confirm_repayment_sent(loan_id).await?;
            println!("loan {}: repayment-sent signal recorded", loan_id);
        }

        Commands::ConfirmFiatSent { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            engine.confirm_fiat_sent(loan_id).await?;
            println!("loan {}: fiat-sent signal recorded", loan_id);
        }

        Commands::ConfirmRepaymentReceived { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let row = engine.confirm_repayment_received(loan_id).await?;
            println!("loan {}: outcome {:?} via {}", loan_id, row.outcome, row.rule_fired);
            if let Some(txid) = row.broadcast_txid {
                println!("   broadcast: {}", txid);
            }
        }

        Commands::ResolveDispute { loan_id, override_outcome, actor } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let admin_override = match override_outcome {
                Some(s) => {
                    let outcome = parse_outcome(&s)?;
                    Some(AdminOverride { outcome, tx_type: tx_type_for_outcome(outcome) })
                }
                None => None,
            };
            let row = engine.resolve_dispute(loan_id, admin_override, &actor).await?;
            println!("loan {}: outcome {:?} via {}", loan_id, row.outcome, row.rule_fired);
            if let Some(txid) = row.broadcast_txid {
                println!("   broadcast: {}", txid);
            }
        }

        Commands::EmergencyRecovery { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let psbt_bytes = engine.emergency_recovery(loan_id).await?;
            println!("loan {}: recovery psbt ({} bytes), broadcast it yourself", loan_id, psbt_bytes.len());
            println!("{}", hex::encode(psbt_bytes));
        }

        Commands::Show { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            let loan = engine.get_loan(loan_id)?;
            println!("loan {}", loan.id);
            println!("   status: {:?}", loan.status);
            println!("   escrow state: {:?}", loan.escrow_state);
            println!("   borrower: {}", loan.borrower);
            println!("   lender: {:?}", loan.lender);
            println!("   principal: {} {:?}", loan.principal_minor_units, loan.currency);
            println!("   collateral required: {} sat", loan.collateral_required_sats);
            if let Some(addr) = &loan.escrow_address {
                println!("   escrow address: {}", addr);
            }
            if let Some(confirmed) = loan.confirmed_amount_sats {
                println!("   confirmed deposit: {} sat ({} confirmations)", confirmed, loan.confirmations);
            }
        }

        Commands::List { status } => {
            let loans = match status {
                Some(s) => engine.list_loans_by_status(parse_status(&s)?)?,
                None => engine.list_loans()?,
            };
            for loan in loans {
                println!("{}  {:<12?}  borrower={}  lender={:?}", loan.id, loan.status, loan.borrower, loan.lender);
            }
        }

        Commands::AuditLog { loan_id } => {
            let loan_id = parse_loan_id(&loan_id)?;
            for row in engine.list_audit_log(loan_id)? {
                println!(
                    "{}  rule={}  outcome={:?}  actor={}  broadcast_success={}",
                    row.timestamp, row.rule_fired, row.outcome, row.actor, row.broadcast_success
                );
            }
        }
    }

    Ok(())
}

fn parse_status(s: &str) -> Result<LoanStatus> {
    Ok(match s.to_lowercase().as_str() {
        "posted" => LoanStatus::Posted,
        "funded" => LoanStatus::Funded,
        "escrow_created" => LoanStatus::EscrowCreated,
        "deposit_pending" => LoanStatus::DepositPending,
        "active" => LoanStatus::Active,
        "repayment_pending" => LoanStatus::RepaymentPending,
        "completed" => LoanStatus::Completed,
        "defaulted" => LoanStatus::Defaulted,
        "liquidated" => LoanStatus::Liquidated,
        "recovered" => LoanStatus::Recovered,
        "cancelled" => LoanStatus::Cancelled,
        other => return Err(escrow_lend::EscrowError::InvalidConfig(format!("unknown status: {}", other))),
    })
}
