//! Storage port.
//!
//! The authorization engine is generic over a `Storage` implementation and
//! never sees `sqlx` or any other concrete driver. It only sees the
//! capability traits below, each scoped to one responsibility
//! (`AccountsReader`, `BalancesWriter`, `LedgerWriter`, `IdempotencyWriter`,
//! `OutboxWriter`). `Storage` itself is the unit-of-work factory: `begin()`
//! returns an explicit transaction handle with explicit `commit`/`rollback`
//! rather than a scope guard that swallows errors.

pub mod postgres;

use crate::domain::{
    Account, AccountBalance, IdempotencyRecord, IdempotencyStatus, LedgerEntry, OutboxRecord,
    Payment,
};
use crate::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait AccountsReader: Send {
    /// Plain, unlocked read. Used for the first pass of domain validation,
    /// before any row lock is taken.
    async fn get_account(&mut self, id: &str) -> Result<Option<Account>, StorageError>;
}

#[async_trait]
pub trait BalancesWriter: Send {
    /// Row-level lock acquired in canonical order by the caller (lowest
    /// account id first). Returns the balance as of lock acquisition.
    async fn lock_balance_for_update(
        &mut self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError>;

    /// Optimistic, single-statement conditional update. Returns the number
    /// of rows affected. The caller aborts as transient if it isn't 1.
    async fn update_balance(
        &mut self,
        account_id: &str,
        new_available_minor: i64,
        expected_version: i64,
    ) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait PaymentsWriter: Send {
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError>;
}

#[async_trait]
pub trait LedgerWriter: Send {
    async fn insert_ledger_entries(
        &mut self,
        debit: &LedgerEntry,
        credit: &LedgerEntry,
    ) -> Result<(), StorageError>;
}

/// Outcome of the idempotency-claim insert-if-absent.
pub enum IdempotencyClaim {
    /// No prior row (or it had expired and was replaced in place).
    Claimed,
    /// A live, non-expired row already exists with this outcome.
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyWriter: Send {
    /// Insert-if-absent a PENDING row, or report the existing non-expired
    /// one. An expired row is transparently replaced: an expired record may
    /// be reused for a new attempt with the same key.
    async fn claim_idempotency_key(
        &mut self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyClaim, StorageError>;

    /// Transition PENDING → terminal, attaching the response snapshot.
    /// Only one such transition may ever succeed for a given key.
    async fn complete_idempotency_key(
        &mut self,
        key: &str,
        status: IdempotencyStatus,
        payment_id: Option<&str>,
        response_snapshot: &serde_json::Value,
    ) -> Result<(), StorageError>;
}

#[async_trait]
pub trait OutboxWriter: Send {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), StorageError>;
}

/// Everything the authorization engine needs from an open transaction.
pub trait PaymentsTransaction:
    AccountsReader + BalancesWriter + PaymentsWriter + LedgerWriter + IdempotencyWriter + OutboxWriter
{
}
impl<T> PaymentsTransaction for T where
    T: AccountsReader
        + BalancesWriter
        + PaymentsWriter
        + LedgerWriter
        + IdempotencyWriter
        + OutboxWriter
{
}

#[async_trait]
pub trait Storage: Send + Sync {
    type Tx: PaymentsTransaction + Send;

    async fn begin(&self) -> Result<Self::Tx, StorageError>;
    async fn commit(&self, tx: Self::Tx) -> Result<(), StorageError>;
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StorageError>;

    async fn get_account_balance(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError>;

    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError>;
}

/// Outbox-worker-facing subset of the storage contract.
///
/// Deliberately separate from `Storage`/`PaymentsTransaction`: the worker
/// never opens the authorization engine's long-lived transaction. Every
/// claim and every mark is its own short statement, so broker calls (the
/// worker's suspension points) never happen inside a DB transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `batch_size` unpublished rows, oldest first, using
    /// row-level locking that skips already-locked rows so concurrent
    /// workers never claim the same row at the same instant.
    async fn claim_pending(&self, batch_size: i64) -> Result<Vec<OutboxRecord>, StorageError>;

    async fn mark_published(&self, id: &str) -> Result<(), StorageError>;

    async fn increment_retry(&self, id: &str) -> Result<(), StorageError>;

    /// Current count of unpublished rows. Backs the
    /// `payments_outbox_pending` gauge.
    async fn pending_depth(&self) -> Result<i64, StorageError>;
}
