//! Transaction store
//!
//! A `Transaction` is a financial event owned by exactly one user. Every
//! query the store runs is scoped by the owner id in addition to whatever
//! filter the caller supplies; owner scoping is the only authorization
//! mechanism in the system and is composed here, not in callers.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("invalid stored row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }

    /// Parse the wire form ("income" / "expense"). Anything else is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "income" => Some(TransactionKind::Income),
            "expense" => Some(TransactionKind::Expense),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Store-assigned unique identifier (UUID v4).
    pub id: String,
    pub owner_id: String,
    pub kind: TransactionKind,
    pub category: String,
    /// Exact decimal amount, always > 0. Never a binary float.
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: Option<String>,
    pub source_or_payment_method: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for `insert_one`. Identity and timestamps are store-assigned.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub owner_id: String,
    pub kind: TransactionKind,
    pub category: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub description: Option<String>,
    pub source_or_payment_method: Option<String>,
}

/// Caller-supplied filter for `find`. The owner id is passed separately and
/// always applied.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub category: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Maximum rows returned; `None` means no limit.
    pub limit: Option<u32>,
}

/// Field-by-field update. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub kind: Option<TransactionKind>,
    pub category: Option<String>,
    pub amount: Option<Decimal>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub source_or_payment_method: Option<String>,
}

impl TransactionPatch {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.category.is_none()
            && self.amount.is_none()
            && self.date.is_none()
            && self.description.is_none()
            && self.source_or_payment_method.is_none()
    }
}

/// Result of `update_one`: a row can match without being modified when the
/// patch carries the values already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Owner-scoped query, newest date first.
    async fn find(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Insert a new record and return its store-assigned identifier.
    async fn insert_one(&self, tx: NewTransaction) -> Result<String, StoreError>;

    /// Apply a partial update to the record with the given id, if it belongs
    /// to `owner_id`.
    async fn update_one(
        &self,
        owner_id: &str,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Hard delete. Returns the number of rows removed (0 or 1).
    async fn delete_one(&self, owner_id: &str, id: &str) -> Result<u64, StoreError>;
}
