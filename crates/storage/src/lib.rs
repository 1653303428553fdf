use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use tracing::debug;

use payrelay_core::{
    CheckoutSession, Invoice, InvoiceStore, MarkPaidOutcome, PaidUpdate, StoreError,
};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the invoice document collection.
    pub fn invoices(&self) -> InvoiceRepository {
        InvoiceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invoice {id} has an undecodable document: {source}")]
    Decode {
        id: String,
        source: serde_json::Error,
    },
    #[error("failed to encode invoice document: {0}")]
    Encode(serde_json::Error),
    #[error("invoice {0} not found")]
    NotFound(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Decode { id, source } => StoreError::Corrupt {
                id,
                reason: source.to_string(),
            },
            StorageError::NotFound(id) => StoreError::NotFound(id),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Repository over the `invoices` table.
///
/// Each row holds the full invoice document as JSON next to the columns used
/// for lookups, which are kept in sync on every write.
#[derive(Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

impl InvoiceRepository {
    /// Inserts or replaces an invoice document.
    pub async fn upsert(&self, invoice: &Invoice) -> Result<(), StorageError> {
        let document = serde_json::to_string(invoice).map_err(StorageError::Encode)?;
        let updated_at = invoice.updated_at.unwrap_or_else(Utc::now);
        sqlx::query(
            "INSERT INTO invoices \
             (id, status, provider_session_id, provider_payment_intent_id, document, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             status = excluded.status, \
             provider_session_id = excluded.provider_session_id, \
             provider_payment_intent_id = excluded.provider_payment_intent_id, \
             document = excluded.document, \
             updated_at = excluded.updated_at",
        )
        .bind(&invoice.id)
        .bind(invoice.status.as_str())
        .bind(invoice.provider_session_id.as_deref())
        .bind(invoice.provider_payment_intent_id.as_deref())
        .bind(document)
        .bind(to_rfc3339(updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Loads an invoice by key.
    pub async fn fetch(&self, id: &str) -> Result<Option<Invoice>, StorageError> {
        let row = sqlx::query("SELECT id, document FROM invoices WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    /// Loads the most recently updated invoice referencing the provider id.
    pub async fn fetch_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Invoice>, StorageError> {
        let row = sqlx::query(
            "SELECT id, document FROM invoices \
             WHERE provider_session_id = ? OR provider_payment_intent_id = ? \
             ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(provider_ref)
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    /// Stores the hosted checkout link on the invoice.
    pub async fn attach_checkout(
        &self,
        id: &str,
        session: &CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = load_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        invoice.checkout_url = Some(session.url.clone());
        invoice.provider_session_id = Some(session.id.clone());
        invoice.updated_at = Some(now);
        write_document(&mut tx, &invoice, false).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Stores the payment intent id on the invoice.
    pub async fn attach_payment_intent(
        &self,
        id: &str,
        intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut invoice = load_for_update(&mut tx, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        invoice.provider_payment_intent_id = Some(intent_id.to_string());
        invoice.updated_at = Some(now);
        write_document(&mut tx, &invoice, false).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Applies the paid transition unless the row is already paid.
    ///
    /// The row is write-locked before it is read, so racing confirmations are
    /// serialized: one reports [`MarkPaidOutcome::Applied`] and the rest see the
    /// paid document and report [`MarkPaidOutcome::AlreadyPaid`].
    pub async fn set_paid(
        &self,
        id: &str,
        update: &PaidUpdate,
    ) -> Result<MarkPaidOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        let Some(mut invoice) = load_for_update(&mut tx, id).await? else {
            tx.rollback().await?;
            return Ok(MarkPaidOutcome::NotFound);
        };
        if !invoice.apply_paid(update) {
            tx.rollback().await?;
            return Ok(MarkPaidOutcome::AlreadyPaid);
        }

        let written = write_document(&mut tx, &invoice, true).await?;
        if !written {
            debug!(stage = "storage", invoice_id = id, "paid transition lost to a concurrent writer");
            tx.rollback().await?;
            return Ok(MarkPaidOutcome::AlreadyPaid);
        }
        tx.commit().await?;
        Ok(MarkPaidOutcome::Applied)
    }
}

#[async_trait]
impl InvoiceStore for InvoiceRepository {
    async fn get(&self, id: &str) -> Result<Option<Invoice>, StoreError> {
        Ok(self.fetch(id).await?)
    }

    async fn find_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self.fetch_by_provider_ref(provider_ref).await?)
    }

    async fn record_checkout(
        &self,
        id: &str,
        session: &CheckoutSession,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.attach_checkout(id, session, now).await?)
    }

    async fn record_payment_intent(
        &self,
        id: &str,
        intent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(self.attach_payment_intent(id, intent_id, now).await?)
    }

    async fn mark_paid(&self, id: &str, update: &PaidUpdate) -> Result<MarkPaidOutcome, StoreError> {
        Ok(self.set_paid(id, update).await?)
    }
}

async fn load_for_update(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
) -> Result<Option<Invoice>, StorageError> {
    // Take the write lock before reading. A deferred read cannot later upgrade
    // past a concurrent WAL commit (SQLITE_BUSY_SNAPSHOT ignores busy_timeout).
    let locked = sqlx::query("UPDATE invoices SET updated_at = updated_at WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    if locked.rows_affected() == 0 {
        return Ok(None);
    }

    let row = sqlx::query("SELECT id, document FROM invoices WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(|row| decode_row(&row)).transpose()
}

/// Writes the document and lookup columns. With `only_if_unpaid` the row is
/// left alone when it is already paid; the return value reports whether a row
/// was written.
async fn write_document(
    tx: &mut Transaction<'_, Sqlite>,
    invoice: &Invoice,
    only_if_unpaid: bool,
) -> Result<bool, StorageError> {
    let document = serde_json::to_string(invoice).map_err(StorageError::Encode)?;
    let updated_at = invoice.updated_at.unwrap_or_else(Utc::now);
    let sql = if only_if_unpaid {
        "UPDATE invoices SET status = ?, provider_session_id = ?, provider_payment_intent_id = ?, \
         document = ?, updated_at = ? WHERE id = ? AND status <> 'paid'"
    } else {
        "UPDATE invoices SET status = ?, provider_session_id = ?, provider_payment_intent_id = ?, \
         document = ?, updated_at = ? WHERE id = ?"
    };
    let result = sqlx::query(sql)
        .bind(invoice.status.as_str())
        .bind(invoice.provider_session_id.as_deref())
        .bind(invoice.provider_payment_intent_id.as_deref())
        .bind(document)
        .bind(to_rfc3339(updated_at))
        .bind(&invoice.id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() == 1)
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<Invoice, StorageError> {
    let id: String = row.get("id");
    let document: String = row.get("document");
    let mut invoice: Invoice =
        serde_json::from_str(&document).map_err(|source| StorageError::Decode {
            id: id.clone(),
            source,
        })?;
    // The row key is authoritative over whatever the document claims.
    invoice.id = id;
    Ok(invoice)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
