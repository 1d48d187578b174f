//! PostgreSQL adapter implementing the storage port. Queries are plain
//! `sqlx::query`/`query_as`, not compile-time `query!` macros, the same
//! choice the teacher's own payments module makes, since this module is
//! checked out and built without a live database available at compile
//! time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::domain::{
    Account, AccountBalance, AccountStatus, IdempotencyRecord, IdempotencyStatus, LedgerEntry,
    LedgerEntryType, OutboxRecord, Payment, PaymentStatus,
};
use crate::errors::StorageError;
use crate::storage::{
    AccountsReader, BalancesWriter, IdempotencyClaim, IdempotencyWriter, LedgerWriter,
    OutboxStore, OutboxWriter, PaymentsWriter, Storage,
};

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

fn account_status_str(status: AccountStatus) -> &'static str {
    match status {
        AccountStatus::Active => "ACTIVE",
        AccountStatus::Suspended => "SUSPENDED",
        AccountStatus::Closed => "CLOSED",
    }
}

fn parse_account_status(s: &str) -> AccountStatus {
    match s {
        "SUSPENDED" => AccountStatus::Suspended,
        "CLOSED" => AccountStatus::Closed,
        _ => AccountStatus::Active,
    }
}

fn payment_status_str(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Authorized => "AUTHORIZED",
        PaymentStatus::Declined => "DECLINED",
    }
}

fn parse_payment_status(s: &str) -> PaymentStatus {
    match s {
        "DECLINED" => PaymentStatus::Declined,
        _ => PaymentStatus::Authorized,
    }
}

fn entry_type_str(t: LedgerEntryType) -> &'static str {
    match t {
        LedgerEntryType::Debit => "DEBIT",
        LedgerEntryType::Credit => "CREDIT",
    }
}

fn idempotency_status_str(status: IdempotencyStatus) -> &'static str {
    match status {
        IdempotencyStatus::Pending => "PENDING",
        IdempotencyStatus::Completed => "COMPLETED",
        IdempotencyStatus::Failed => "FAILED",
    }
}

fn parse_idempotency_status(s: &str) -> IdempotencyStatus {
    match s {
        "COMPLETED" => IdempotencyStatus::Completed,
        "FAILED" => IdempotencyStatus::Failed,
        _ => IdempotencyStatus::Pending,
    }
}

fn account_from_row(row: &sqlx::postgres::PgRow) -> Result<Account, StorageError> {
    Ok(Account {
        id: row.try_get("id").map_err(sqlx::Error::from)?,
        owner_id: row.try_get("owner_id").map_err(sqlx::Error::from)?,
        currency: row.try_get("currency").map_err(sqlx::Error::from)?,
        status: parse_account_status(row.try_get::<String, _>("status").map_err(sqlx::Error::from)?.as_str()),
        created_at: row.try_get("created_at").map_err(sqlx::Error::from)?,
        updated_at: row.try_get("updated_at").map_err(sqlx::Error::from)?,
    })
}

fn balance_from_row(row: &sqlx::postgres::PgRow) -> Result<AccountBalance, StorageError> {
    Ok(AccountBalance {
        account_id: row.try_get("account_id").map_err(sqlx::Error::from)?,
        available_minor: row.try_get("available_minor").map_err(sqlx::Error::from)?,
        pending_minor: row.try_get("pending_minor").map_err(sqlx::Error::from)?,
        currency: row.try_get("currency").map_err(sqlx::Error::from)?,
        version: row.try_get("version").map_err(sqlx::Error::from)?,
    })
}

fn payment_from_row(row: &sqlx::postgres::PgRow) -> Result<Payment, StorageError> {
    Ok(Payment {
        id: row.try_get("id").map_err(sqlx::Error::from)?,
        idempotency_key: row.try_get("idempotency_key").map_err(sqlx::Error::from)?,
        payer_account_id: row.try_get("payer_account_id").map_err(sqlx::Error::from)?,
        payee_account_id: row.try_get("payee_account_id").map_err(sqlx::Error::from)?,
        amount_minor: row.try_get("amount_minor").map_err(sqlx::Error::from)?,
        currency: row.try_get("currency").map_err(sqlx::Error::from)?,
        status: parse_payment_status(row.try_get::<String, _>("status").map_err(sqlx::Error::from)?.as_str()),
        description: row.try_get("description").map_err(sqlx::Error::from)?,
        error_code: row.try_get("error_code").map_err(sqlx::Error::from)?,
        error_message: row.try_get("error_message").map_err(sqlx::Error::from)?,
        created_at: row.try_get("created_at").map_err(sqlx::Error::from)?,
        updated_at: row.try_get("updated_at").map_err(sqlx::Error::from)?,
    })
}

fn idempotency_from_row(row: &sqlx::postgres::PgRow) -> Result<IdempotencyRecord, StorageError> {
    Ok(IdempotencyRecord {
        key: row.try_get("key").map_err(sqlx::Error::from)?,
        payment_id: row.try_get("payment_id").map_err(sqlx::Error::from)?,
        response_snapshot: row.try_get("response_snapshot").map_err(sqlx::Error::from)?,
        status: parse_idempotency_status(
            row.try_get::<String, _>("status").map_err(sqlx::Error::from)?.as_str(),
        ),
        created_at: row.try_get("created_at").map_err(sqlx::Error::from)?,
        expires_at: row.try_get("expires_at").map_err(sqlx::Error::from)?,
    })
}

fn outbox_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxRecord, StorageError> {
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(sqlx::Error::from)?,
        aggregate_type: row.try_get("aggregate_type").map_err(sqlx::Error::from)?,
        aggregate_id: row.try_get("aggregate_id").map_err(sqlx::Error::from)?,
        event_type: row.try_get("event_type").map_err(sqlx::Error::from)?,
        payload: row.try_get("payload").map_err(sqlx::Error::from)?,
        created_at: row.try_get("created_at").map_err(sqlx::Error::from)?,
        published_at: row.try_get("published_at").map_err(sqlx::Error::from)?,
        retry_count: row.try_get("retry_count").map_err(sqlx::Error::from)?,
    })
}

/// Open transaction handle. `sqlx::Pool::begin` hands back a `'static`
/// transaction (the pool manages the connection's lifetime internally),
/// so this holds no borrow on `PgStorage` and can be passed by value.
pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountsReader for PgTx {
    async fn get_account(&mut self, id: &str) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(
            r#"SELECT id, owner_id, currency, status, created_at, updated_at
               FROM accounts WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        row.as_ref().map(account_from_row).transpose()
    }
}

#[async_trait]
impl BalancesWriter for PgTx {
    async fn lock_balance_for_update(
        &mut self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError> {
        let row = sqlx::query(
            r#"SELECT account_id, available_minor, pending_minor, currency, version
               FROM account_balances WHERE account_id = $1 FOR UPDATE"#,
        )
        .bind(account_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        row.as_ref().map(balance_from_row).transpose()
    }

    async fn update_balance(
        &mut self,
        account_id: &str,
        new_available_minor: i64,
        expected_version: i64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            r#"UPDATE account_balances
               SET available_minor = $1, version = version + 1
               WHERE account_id = $2 AND version = $3"#,
        )
        .bind(new_available_minor)
        .bind(account_id)
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentsWriter for PgTx {
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO payments
               (id, idempotency_key, payer_account_id, payee_account_id, amount_minor,
                currency, status, description, error_code, error_message, created_at, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(&payment.id)
        .bind(&payment.idempotency_key)
        .bind(&payment.payer_account_id)
        .bind(&payment.payee_account_id)
        .bind(payment.amount_minor)
        .bind(&payment.currency)
        .bind(payment_status_str(payment.status))
        .bind(&payment.description)
        .bind(&payment.error_code)
        .bind(&payment.error_message)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        Ok(())
    }
}

#[async_trait]
impl LedgerWriter for PgTx {
    async fn insert_ledger_entries(
        &mut self,
        debit: &LedgerEntry,
        credit: &LedgerEntry,
    ) -> Result<(), StorageError> {
        for entry in [debit, credit] {
            sqlx::query(
                r#"INSERT INTO ledger_entries
                   (id, payment_id, account_id, entry_type, amount_minor, currency,
                    balance_after_minor, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
            )
            .bind(&entry.id)
            .bind(&entry.payment_id)
            .bind(&entry.account_id)
            .bind(entry_type_str(entry.entry_type))
            .bind(entry.amount_minor)
            .bind(&entry.currency)
            .bind(entry.balance_after_minor)
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(StorageError::from)?;
        }

        Ok(())
    }
}

#[async_trait]
impl IdempotencyWriter for PgTx {
    async fn claim_idempotency_key(
        &mut self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyClaim, StorageError> {
        // Insert-if-absent; on conflict, only replace a row that has
        // already expired.
        let claimed = sqlx::query(
            r#"INSERT INTO idempotency_keys (key, status, created_at, expires_at)
               VALUES ($1, 'PENDING', now(), $2)
               ON CONFLICT (key) DO UPDATE
                 SET status = 'PENDING', payment_id = NULL, response_snapshot = NULL,
                     created_at = now(), expires_at = EXCLUDED.expires_at
                 WHERE idempotency_keys.expires_at <= now()
               RETURNING key"#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        if claimed.is_some() {
            return Ok(IdempotencyClaim::Claimed);
        }

        let existing = sqlx::query(
            r#"SELECT key, payment_id, response_snapshot, status, created_at, expires_at
               FROM idempotency_keys WHERE key = $1"#,
        )
        .bind(key)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        Ok(IdempotencyClaim::Existing(idempotency_from_row(&existing)?))
    }

    async fn complete_idempotency_key(
        &mut self,
        key: &str,
        status: IdempotencyStatus,
        payment_id: Option<&str>,
        response_snapshot: &serde_json::Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"UPDATE idempotency_keys
               SET status = $1, payment_id = $2, response_snapshot = $3
               WHERE key = $4 AND status = 'PENDING'"#,
        )
        .bind(idempotency_status_str(status))
        .bind(payment_id)
        .bind(response_snapshot)
        .bind(key)
        .execute(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        Ok(())
    }
}

#[async_trait]
impl OutboxWriter for PgTx {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO outbox (id, aggregate_type, aggregate_id, event_type, payload, created_at)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(&record.id)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(StorageError::from)?;

        Ok(())
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exposed for readiness probes and other callers that need a plain
    /// connectivity check without going through the transaction API.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Storage for PgStorage {
    type Tx = PgTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let tx = self.pool.begin().await.map_err(StorageError::from)?;
        Ok(PgTx { tx })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.tx.commit().await.map_err(StorageError::from)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError> {
        tx.tx.rollback().await.map_err(StorageError::from)
    }

    async fn get_account_balance(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError> {
        let row = sqlx::query(
            r#"SELECT account_id, available_minor, pending_minor, currency, version
               FROM account_balances WHERE account_id = $1"#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        row.as_ref().map(balance_from_row).transpose()
    }

    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        let row = sqlx::query(
            r#"SELECT id, idempotency_key, payer_account_id, payee_account_id, amount_minor,
                      currency, status, description, error_code, error_message,
                      created_at, updated_at
               FROM payments WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::from)?;

        row.as_ref().map(payment_from_row).transpose()
    }
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_pending(&self, batch_size: i64) -> Result<Vec<OutboxRecord>, StorageError> {
        // Short-lived transaction: the lock only needs to live for the
        // instant of this SELECT so two workers never claim the same row,
        // not for the duration of the broker call that follows.
        let mut tx = self.pool.begin().await.map_err(StorageError::from)?;

        let rows = sqlx::query(
            r#"SELECT id, aggregate_type, aggregate_id, event_type, payload, created_at,
                      published_at, retry_count
               FROM outbox
               WHERE published_at IS NULL
               ORDER BY created_at ASC
               LIMIT $1
               FOR UPDATE SKIP LOCKED"#,
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        tx.commit().await.map_err(StorageError::from)?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"UPDATE outbox SET published_at = now() WHERE id = $1 AND published_at IS NULL"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(StorageError::from)?;

        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<(), StorageError> {
        sqlx::query(r#"UPDATE outbox SET retry_count = retry_count + 1 WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(())
    }

    async fn pending_depth(&self) -> Result<i64, StorageError> {
        let row = sqlx::query(r#"SELECT count(*) AS n FROM outbox WHERE published_at IS NULL"#)
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::from)?;

        Ok(row.try_get::<i64, _>("n").map_err(sqlx::Error::from)?)
    }
}
