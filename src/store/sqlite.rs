//! SQLite-backed transaction store.
//!
//! Amounts are stored as TEXT so decimal values round-trip exactly; dates
//! as ISO-8601 strings. Timestamps are set here, never by callers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, Row, params};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{
    NewTransaction, StoreError, Transaction, TransactionFilter, TransactionKind, TransactionPatch,
    TransactionStore, UpdateOutcome,
};

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and the `ask` one-shot path when no
    /// database file is configured yet.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS transactions(
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                kind TEXT NOT NULL CHECK(kind IN ('income','expense')),
                category TEXT NOT NULL,
                amount TEXT NOT NULL,
                date TEXT NOT NULL,
                description TEXT,
                source_or_payment_method TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_owner_date
                ON transactions(owner_id, date);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let kind_raw: String = row.get("kind")?;
    let amount_raw: String = row.get("amount")?;
    let date_raw: String = row.get("date")?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;

    let parse_err = |what: &str, value: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(StoreError::Corrupt(format!("{what}: {value}"))),
        )
    };

    Ok(Transaction {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        kind: TransactionKind::parse(&kind_raw).ok_or_else(|| parse_err("kind", &kind_raw))?,
        category: row.get("category")?,
        amount: Decimal::from_str(&amount_raw).map_err(|_| parse_err("amount", &amount_raw))?,
        date: NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .map_err(|_| parse_err("date", &date_raw))?,
        description: row.get("description")?,
        source_or_payment_method: row.get("source_or_payment_method")?,
        created_at: parse_timestamp(&created_raw).ok_or_else(|| parse_err("created_at", &created_raw))?,
        updated_at: parse_timestamp(&updated_raw).ok_or_else(|| parse_err("updated_at", &updated_raw))?,
    })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn find(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>, StoreError> {
        let conn = self.lock()?;

        let mut sql = String::from("SELECT * FROM transactions WHERE owner_id = ?1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(owner_id.to_string())];

        if let Some(kind) = filter.kind {
            args.push(Box::new(kind.as_str().to_string()));
            sql.push_str(&format!(" AND kind = ?{}", args.len()));
        }
        if let Some(ref category) = filter.category {
            args.push(Box::new(category.clone()));
            sql.push_str(&format!(" AND category = ?{}", args.len()));
        }
        if let Some(start) = filter.start_date {
            args.push(Box::new(start.format("%Y-%m-%d").to_string()));
            sql.push_str(&format!(" AND date >= ?{}", args.len()));
        }
        if let Some(end) = filter.end_date {
            args.push(Box::new(end.format("%Y-%m-%d").to_string()));
            sql.push_str(&format!(" AND date <= ?{}", args.len()));
        }

        sql.push_str(" ORDER BY date DESC, created_at DESC");

        if let Some(limit) = filter.limit {
            args.push(Box::new(limit));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let mut stmt = conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(args.iter().map(|a| a.as_ref()));
        let rows = stmt.query_map(params, row_to_transaction)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    async fn insert_one(&self, tx: NewTransaction) -> Result<String, StoreError> {
        let conn = self.lock()?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            r#"
            INSERT INTO transactions
                (id, owner_id, kind, category, amount, date,
                 description, source_or_payment_method, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                id,
                tx.owner_id,
                tx.kind.as_str(),
                tx.category,
                tx.amount.to_string(),
                tx.date.format("%Y-%m-%d").to_string(),
                tx.description,
                tx.source_or_payment_method,
                now,
                now,
            ],
        )?;

        debug!("Inserted transaction {} for owner {}", id, tx.owner_id);
        Ok(id)
    }

    async fn update_one(
        &self,
        owner_id: &str,
        id: &str,
        patch: TransactionPatch,
    ) -> Result<UpdateOutcome, StoreError> {
        let conn = self.lock()?;

        // Read the current row first so a no-op patch (values identical) can
        // be reported as matched-but-unmodified, which SQLite's changes()
        // cannot distinguish on its own.
        let existing = conn
            .query_row(
                "SELECT * FROM transactions WHERE id = ?1 AND owner_id = ?2",
                params![id, owner_id],
                row_to_transaction,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let Some(existing) = existing else {
            return Ok(UpdateOutcome {
                matched: 0,
                modified: 0,
            });
        };

        let kind = patch.kind.unwrap_or(existing.kind);
        let category = patch.category.unwrap_or_else(|| existing.category.clone());
        let amount = patch.amount.unwrap_or(existing.amount);
        let date = patch.date.unwrap_or(existing.date);
        let description = patch.description.or_else(|| existing.description.clone());
        let source = patch
            .source_or_payment_method
            .or_else(|| existing.source_or_payment_method.clone());

        let unchanged = kind == existing.kind
            && category == existing.category
            && amount == existing.amount
            && date == existing.date
            && description == existing.description
            && source == existing.source_or_payment_method;

        if unchanged {
            return Ok(UpdateOutcome {
                matched: 1,
                modified: 0,
            });
        }

        conn.execute(
            r#"
            UPDATE transactions
            SET kind = ?1, category = ?2, amount = ?3, date = ?4,
                description = ?5, source_or_payment_method = ?6, updated_at = ?7
            WHERE id = ?8 AND owner_id = ?9
            "#,
            params![
                kind.as_str(),
                category,
                amount.to_string(),
                date.format("%Y-%m-%d").to_string(),
                description,
                source,
                Utc::now().to_rfc3339(),
                id,
                owner_id,
            ],
        )?;

        debug!("Updated transaction {} for owner {}", id, owner_id);
        Ok(UpdateOutcome {
            matched: 1,
            modified: 1,
        })
    }

    async fn delete_one(&self, owner_id: &str, id: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;

        let deleted = conn.execute(
            "DELETE FROM transactions WHERE id = ?1 AND owner_id = ?2",
            params![id, owner_id],
        )?;

        if deleted > 0 {
            debug!("Deleted transaction {} for owner {}", id, owner_id);
        }
        Ok(deleted as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn new_tx(owner: &str, amount: &str) -> NewTransaction {
        NewTransaction {
            owner_id: owner.to_string(),
            kind: TransactionKind::Expense,
            category: "Food & Beverage".to_string(),
            amount: Decimal::from_str(amount).unwrap(),
            date: NaiveDate::from_ymd_opt(2025, 5, 24).unwrap(),
            description: Some("Lunch".to_string()),
            source_or_payment_method: None,
        }
    }

    #[tokio::test]
    async fn test_insert_then_find_preserves_amount_exactly() {
        let store = store();
        let id = store.insert_one(new_tx("user-1", "12345.67")).await.unwrap();

        let found = store
            .find("user-1", &TransactionFilter::default())
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, id);
        assert_eq!(found[0].amount, Decimal::from_str("12345.67").unwrap());
        assert_eq!(found[0].amount.to_string(), "12345.67");
    }

    #[tokio::test]
    async fn test_find_never_returns_foreign_rows() {
        let store = store();
        store.insert_one(new_tx("user-1", "100")).await.unwrap();
        store.insert_one(new_tx("user-2", "200")).await.unwrap();

        let found = store
            .find("user-1", &TransactionFilter::default())
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert!(found.iter().all(|t| t.owner_id == "user-1"));
    }

    #[tokio::test]
    async fn test_find_filters_by_kind_category_and_date_range() {
        let store = store();
        store.insert_one(new_tx("user-1", "100")).await.unwrap();

        let mut income = new_tx("user-1", "5000000");
        income.kind = TransactionKind::Income;
        income.category = "Salary".to_string();
        income.date = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        store.insert_one(income).await.unwrap();

        let filter = TransactionFilter {
            kind: Some(TransactionKind::Income),
            ..Default::default()
        };
        let found = store.find("user-1", &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category, "Salary");

        let filter = TransactionFilter {
            start_date: NaiveDate::from_ymd_opt(2025, 5, 10),
            end_date: NaiveDate::from_ymd_opt(2025, 5, 31),
            ..Default::default()
        };
        let found = store.find("user-1", &filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].category, "Food & Beverage");
    }

    #[tokio::test]
    async fn test_find_orders_newest_first_and_honors_limit() {
        let store = store();
        for day in 1..=5 {
            let mut tx = new_tx("user-1", "100");
            tx.date = NaiveDate::from_ymd_opt(2025, 5, day).unwrap();
            store.insert_one(tx).await.unwrap();
        }

        let filter = TransactionFilter {
            limit: Some(3),
            ..Default::default()
        };
        let found = store.find("user-1", &filter).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].date, NaiveDate::from_ymd_opt(2025, 5, 5).unwrap());
        assert!(found[0].date > found[2].date);
    }

    #[tokio::test]
    async fn test_update_patches_only_given_fields() {
        let store = store();
        let id = store.insert_one(new_tx("user-1", "100")).await.unwrap();

        let patch = TransactionPatch {
            amount: Some(Decimal::from_str("75000").unwrap()),
            ..Default::default()
        };
        let outcome = store.update_one("user-1", &id, patch).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 1, modified: 1 });

        let found = store
            .find("user-1", &TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(found[0].amount.to_string(), "75000");
        // Untouched fields survive
        assert_eq!(found[0].category, "Food & Beverage");
        assert_eq!(found[0].description.as_deref(), Some("Lunch"));
    }

    #[tokio::test]
    async fn test_update_reports_noop_distinctly_from_not_found() {
        let store = store();
        let id = store.insert_one(new_tx("user-1", "100")).await.unwrap();

        // Same values: matched but unmodified
        let patch = TransactionPatch {
            amount: Some(Decimal::from_str("100").unwrap()),
            ..Default::default()
        };
        let outcome = store.update_one("user-1", &id, patch).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 1, modified: 0 });

        // Unknown id: not found
        let patch = TransactionPatch {
            amount: Some(Decimal::from_str("200").unwrap()),
            ..Default::default()
        };
        let outcome = store.update_one("user-1", "no-such-id", patch).await.unwrap();
        assert_eq!(outcome, UpdateOutcome { matched: 0, modified: 0 });
    }

    #[tokio::test]
    async fn test_update_and_delete_refuse_foreign_rows() {
        let store = store();
        let id = store.insert_one(new_tx("user-1", "100")).await.unwrap();

        let patch = TransactionPatch {
            amount: Some(Decimal::from_str("999").unwrap()),
            ..Default::default()
        };
        let outcome = store.update_one("user-2", &id, patch).await.unwrap();
        assert_eq!(outcome.matched, 0);

        assert_eq!(store.delete_one("user-2", &id).await.unwrap(), 0);

        // Row is intact for its real owner
        let found = store
            .find("user-1", &TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].amount.to_string(), "100");
    }

    #[tokio::test]
    async fn test_delete_removes_row() {
        let store = store();
        let id = store.insert_one(new_tx("user-1", "100")).await.unwrap();

        assert_eq!(store.delete_one("user-1", &id).await.unwrap(), 1);
        // Second delete finds nothing
        assert_eq!(store.delete_one("user-1", &id).await.unwrap(), 0);

        let found = store
            .find("user-1", &TransactionFilter::default())
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
