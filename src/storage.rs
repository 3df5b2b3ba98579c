//! Persistence adapter: an embedded `sled` store with one tree per
//! aggregate, the typed CRUD operations an engine needs, a per-loan lock
//! (`with_loan_lock`), and a transactional `atomically` for multi-row
//! writes (e.g. audit log + loan in the same transaction).
//!
//! One `Tree` per aggregate, JSON-encoded records, `db.flush()` after
//! every write, across four aggregates (loans, templates, canonical
//! templates, audit log).

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use bitcoin::Address;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};
use tokio::sync::Mutex as AsyncMutex;

use crate::loan::{Loan, LoanId};
use crate::psbt::{CanonicalPsbtTemplate, PartyRole, PreSignedTemplate, TxType};
use crate::resolution::DisputeAuditLog;
use crate::signatures::SubmissionWindow;
use crate::{EscrowError, Result};

/// Serde helper for `Option<bitcoin::ScriptBuf>` fields, stored as hex.
pub mod script_serde {
    use bitcoin::ScriptBuf;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(script: &Option<ScriptBuf>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        script.as_ref().map(|s| s.to_hex_string()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<ScriptBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => ScriptBuf::from_hex(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Serde helper for `Option<bitcoin::Address>` fields (assume-checked on
/// deserialize: the network prefix is validated separately at the inbound
/// boundary).
pub mod address_serde {
    use super::*;

    pub fn serialize<S>(address: &Option<Address>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        address.as_ref().map(|a| a.to_string()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            None => Ok(None),
            Some(s) => s
                .parse::<Address<_>>()
                .map(|a| Some(a.assume_checked()))
                .map_err(serde::de::Error::custom),
        }
    }
}

/// One write in a multi-row transaction.
pub enum WriteOp {
    PutLoan(Loan),
    PutTemplate(PreSignedTemplate),
    PutCanonical(CanonicalPsbtTemplate),
    AppendAuditLog(DisputeAuditLog),
}

pub struct StorageAdapter {
    db: Db,
    loans: Tree,
    templates: Tree,
    canonical_templates: Tree,
    audit_log: Tree,
    loan_locks: StdMutex<HashMap<LoanId, Arc<AsyncMutex<()>>>>,
    submission_windows: StdMutex<HashMap<(LoanId, TxType), SubmissionWindow>>,
    next_template_id: std::sync::atomic::AtomicU64,
}

impl StorageAdapter {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let loans = db.open_tree("loans")?;
        let templates = db.open_tree("templates")?;
        let canonical_templates = db.open_tree("canonical_templates")?;
        let audit_log = db.open_tree("audit_log")?;

        let next_template_id = templates
            .iter()
            .values()
            .filter_map(|v| v.ok())
            .filter_map(|v| serde_json::from_slice::<PreSignedTemplate>(&v).ok())
            .map(|t| t.id)
            .max()
            .unwrap_or(0)
            + 1;

        Ok(Self {
            db,
            loans,
            templates,
            canonical_templates,
            audit_log,
            loan_locks: StdMutex::new(HashMap::new()),
            submission_windows: StdMutex::new(HashMap::new()),
            next_template_id: std::sync::atomic::AtomicU64::new(next_template_id),
        })
    }

    fn loan_lock(&self, loan_id: LoanId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.loan_locks.lock().expect("loan lock registry poisoned");
        locks
            .entry(loan_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Serializes a critical section over one loan. The
    /// closure reads state, decides, and writes state; external I/O
    /// (broadcast, price fetch) should happen outside the closure, per the
    /// ordering rule that external calls happen after the lock is dropped.
    pub async fn with_loan_lock<F, Fut, T>(&self, loan_id: LoanId, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let lock = self.loan_lock(loan_id);
        let _guard = lock.lock().await;
        f().await
    }

    // --- Loan CRUD ---

    pub fn insert_loan(&self, loan: &Loan) -> Result<()> {
        let key = loan.id.to_string();
        if self.loans.contains_key(&key)? {
            return Err(EscrowError::LoanAlreadyExists(loan.id));
        }
        self.loans.insert(key, serde_json::to_vec(loan)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn save_loan(&self, loan: &Loan) -> Result<()> {
        let key = loan.id.to_string();
        self.loans.insert(key, serde_json::to_vec(loan)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_loan(&self, loan_id: LoanId) -> Result<Loan> {
        let key = loan_id.to_string();
        let bytes = self
            .loans
            .get(&key)?
            .ok_or(EscrowError::LoanNotFound(loan_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn list_loans(&self) -> Result<Vec<Loan>> {
        let mut out = Vec::new();
        for item in self.loans.iter() {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn list_loans_by_status(&self, status: crate::loan::LoanStatus) -> Result<Vec<Loan>> {
        Ok(self
            .list_loans()?
            .into_iter()
            .filter(|l| l.status == status)
            .collect())
    }

    // --- Template CRUD ---

    /// Inserts a new template row, enforcing the uniqueness/supersession
    /// invariants: at most one `unsigned_template` per (loan,
    /// txType); an accepted row is never mutated in place.
    pub fn insert_template(&self, mut template: PreSignedTemplate) -> Result<PreSignedTemplate> {
        if matches!(template.party_role, PartyRole::UnsignedTemplate) {
            let existing = self.get_unsigned_template(template.loan_id, template.tx_type)?;
            if existing.is_some() {
                return Err(EscrowError::InvalidConfig(format!(
                    "unsigned template already exists for loan {} tx type {:?}",
                    template.loan_id, template.tx_type
                )));
            }
        }
        template.id = self
            .next_template_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let key = format!("{}:{}", template.loan_id, template.id);
        self.templates.insert(key, serde_json::to_vec(&template)?)?;
        self.db.flush()?;
        Ok(template)
    }

    pub fn list_templates_for_loan(&self, loan_id: LoanId) -> Result<Vec<PreSignedTemplate>> {
        let prefix = format!("{}:", loan_id);
        let mut out = Vec::new();
        for item in self.templates.scan_prefix(prefix.as_bytes()) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        out.sort_by_key(|t: &PreSignedTemplate| t.id);
        Ok(out)
    }

    pub fn get_unsigned_template(&self, loan_id: LoanId, tx_type: TxType) -> Result<Option<PreSignedTemplate>> {
        Ok(self
            .list_templates_for_loan(loan_id)?
            .into_iter()
            .find(|t| t.tx_type == tx_type && matches!(t.party_role, PartyRole::UnsignedTemplate)))
    }

    /// Newest borrower-signed row for (loan, txType); highest id wins.
    pub fn newest_borrower_signed(&self, loan_id: LoanId, tx_type: TxType) -> Result<Option<PreSignedTemplate>> {
        let templates = self.list_templates_for_loan(loan_id)?;
        Ok(crate::signatures::newest_borrower_signed(&templates, loan_id, tx_type).cloned())
    }

    pub fn update_template(&self, template: &PreSignedTemplate) -> Result<()> {
        let key = format!("{}:{}", template.loan_id, template.id);
        self.templates.insert(key, serde_json::to_vec(template)?)?;
        self.db.flush()?;
        Ok(())
    }

    // --- Canonical template cache ---

    pub fn insert_canonical_template(&self, tmpl: &CanonicalPsbtTemplate) -> Result<()> {
        let key = format!("{}:{:?}", tmpl.loan_id, tmpl.tx_type);
        if self.canonical_templates.contains_key(&key)? {
            return Ok(()); // first-generated wins, never overwritten
        }
        self.canonical_templates.insert(key, serde_json::to_vec(tmpl)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_canonical_template(&self, loan_id: LoanId, tx_type: TxType) -> Result<Option<CanonicalPsbtTemplate>> {
        let key = format!("{}:{:?}", loan_id, tx_type);
        match self.canonical_templates.get(&key)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    // --- Audit log (append-only) ---

    pub fn append_audit_log(&self, row: &DisputeAuditLog) -> Result<()> {
        let key = format!("{}:{}", row.loan_id, row.timestamp.timestamp_nanos_opt().unwrap_or(0));
        self.audit_log.insert(key, serde_json::to_vec(row)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn list_audit_log_for_loan(&self, loan_id: LoanId) -> Result<Vec<DisputeAuditLog>> {
        let prefix = format!("{}:", loan_id);
        let mut out = Vec::new();
        for item in self.audit_log.scan_prefix(prefix.as_bytes()) {
            let (_, v) = item?;
            out.push(serde_json::from_slice(&v)?);
        }
        out.sort_by_key(|r: &DisputeAuditLog| r.timestamp);
        Ok(out)
    }

    /// Applies a list of writes atomically across trees. Used by the
    /// resolution executor to write the loan's new state and the audit log
    /// row together.
    pub fn atomically(&self, ops: Vec<WriteOp>) -> Result<()> {
        let result: std::result::Result<(), TransactionError<EscrowError>> = (
            &self.loans,
            &self.templates,
            &self.canonical_templates,
            &self.audit_log,
        )
            .transaction(|(loans, templates, canonical, audit)| {
                for op in &ops {
                    match op {
                        WriteOp::PutLoan(loan) => {
                            let bytes = serde_json::to_vec(loan)
                                .map_err(|e| ConflictableTransactionError::Abort(EscrowError::from(e)))?;
                            loans.insert(loan.id.to_string().as_bytes(), bytes)?;
                        }
                        WriteOp::PutTemplate(tmpl) => {
                            let bytes = serde_json::to_vec(tmpl)
                                .map_err(|e| ConflictableTransactionError::Abort(EscrowError::from(e)))?;
                            let key = format!("{}:{}", tmpl.loan_id, tmpl.id);
                            templates.insert(key.as_bytes(), bytes)?;
                        }
                        WriteOp::PutCanonical(tmpl) => {
                            let bytes = serde_json::to_vec(tmpl)
                                .map_err(|e| ConflictableTransactionError::Abort(EscrowError::from(e)))?;
                            let key = format!("{}:{:?}", tmpl.loan_id, tmpl.tx_type);
                            canonical.insert(key.as_bytes(), bytes)?;
                        }
                        WriteOp::AppendAuditLog(row) => {
                            let bytes = serde_json::to_vec(row)
                                .map_err(|e| ConflictableTransactionError::Abort(EscrowError::from(e)))?;
                            let key = format!("{}:{}", row.loan_id, row.timestamp.timestamp_nanos_opt().unwrap_or(0));
                            audit.insert(key.as_bytes(), bytes)?;
                        }
                    }
                }
                Ok(())
            });

        result.map_err(|e| match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => EscrowError::DatabaseError(e),
        })?;
        self.db.flush()?;
        Ok(())
    }

    /// Rate-limits a borrower's signature submission for (loan, txType) to
    /// at most `max_per_window` per `window_seconds`.
    pub fn check_submission_rate_limit(
        &self,
        loan_id: LoanId,
        tx_type: TxType,
        max_per_window: u32,
        window_seconds: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut windows = self.submission_windows.lock().expect("submission window registry poisoned");
        windows
            .entry((loan_id, tx_type))
            .or_default()
            .record_and_check(max_per_window, window_seconds, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loan::{new_loan_id, Currency, Loan, LoanStatus};
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use tempfile::TempDir;

    fn sample_loan() -> Loan {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut rand::thread_rng());
        let platform_pub = PublicKey::from_secret_key(&secp, &sk);
        Loan::new("b".into(), 1_000_000, Currency::EUR, 10.0, 3, 40_000_000, platform_pub).unwrap()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();
        let loan = sample_loan();
        storage.insert_loan(&loan).unwrap();
        let fetched = storage.get_loan(loan.id).unwrap();
        assert_eq!(fetched.id, loan.id);
    }

    #[test]
    fn inserting_duplicate_loan_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();
        let loan = sample_loan();
        storage.insert_loan(&loan).unwrap();
        assert!(matches!(
            storage.insert_loan(&loan),
            Err(EscrowError::LoanAlreadyExists(_))
        ));
    }

    #[test]
    fn list_by_status_filters() {
        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();
        let loan = sample_loan();
        storage.insert_loan(&loan).unwrap();
        let posted = storage.list_loans_by_status(LoanStatus::Posted).unwrap();
        assert_eq!(posted.len(), 1);
        let active = storage.list_loans_by_status(LoanStatus::Active).unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn loan_lock_serializes_critical_sections() {
        let dir = TempDir::new().unwrap();
        let storage = StorageAdapter::open(dir.path()).unwrap();
        let loan_id = new_loan_id();
        let result = storage
            .with_loan_lock(loan_id, || async { Ok::<_, EscrowError>(42) })
            .await
            .unwrap();
        assert_eq!(result, 42);
    }
}
