//! In-memory fakes for the storage and broker ports, generalizing the
//! teacher's `InMemoryBus` pattern (platform/event-bus) to storage so the
//! authorization engine and outbox worker can be checked without a live
//! Postgres/NATS.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use payments_rs::domain::{
    Account, AccountBalance, IdempotencyRecord, IdempotencyStatus, LedgerEntry, OutboxRecord,
    Payment,
};
use payments_rs::errors::StorageError;
use payments_rs::storage::{
    AccountsReader, BalancesWriter, IdempotencyClaim, IdempotencyWriter, LedgerWriter, OutboxStore,
    OutboxWriter, PaymentsWriter, Storage,
};

#[derive(Clone, Default)]
pub struct FakeDb {
    pub accounts: HashMap<String, Account>,
    pub balances: HashMap<String, AccountBalance>,
    pub payments: HashMap<String, Payment>,
    pub ledger: Vec<LedgerEntry>,
    pub idempotency: HashMap<String, IdempotencyRecord>,
    pub outbox: Vec<OutboxRecord>,
}

#[derive(Clone)]
pub struct FakeStorage {
    inner: Arc<Mutex<FakeDb>>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeDb::default())),
        }
    }

    pub async fn seed_account(&self, account: Account, balance: AccountBalance) {
        let mut db = self.inner.lock().await;
        db.accounts.insert(account.id.clone(), account);
        db.balances.insert(balance.account_id.clone(), balance);
    }

    pub async fn ledger_for(&self, payment_id: &str) -> Vec<LedgerEntry> {
        let db = self.inner.lock().await;
        db.ledger
            .iter()
            .filter(|e| e.payment_id == payment_id)
            .cloned()
            .collect()
    }

    pub async fn outbox_events(&self) -> Vec<OutboxRecord> {
        self.inner.lock().await.outbox.clone()
    }

    pub async fn balance(&self, account_id: &str) -> Option<AccountBalance> {
        self.inner.lock().await.balances.get(account_id).cloned()
    }

    pub async fn get_payment_for_test(&self, id: &str) -> Payment {
        self.inner
            .lock()
            .await
            .payments
            .get(id)
            .cloned()
            .expect("payment must exist")
    }

    pub async fn idempotency_status_for_test(&self, key: &str) -> Option<IdempotencyStatus> {
        self.inner
            .lock()
            .await
            .idempotency
            .get(key)
            .map(|r| r.status)
    }
}

/// The whole transaction holds the DB's single mutex for its lifetime. A
/// real Postgres tx instead gets that serialization from row locks, but
/// the observable guarantee (no two transactions interleave their writes
/// to the same balance) is the same.
pub struct FakeTx {
    guard: OwnedMutexGuard<FakeDb>,
    snapshot: FakeDb,
}

#[async_trait]
impl AccountsReader for FakeTx {
    async fn get_account(&mut self, id: &str) -> Result<Option<Account>, StorageError> {
        Ok(self.guard.accounts.get(id).cloned())
    }
}

#[async_trait]
impl BalancesWriter for FakeTx {
    async fn lock_balance_for_update(
        &mut self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError> {
        Ok(self.guard.balances.get(account_id).cloned())
    }

    async fn update_balance(
        &mut self,
        account_id: &str,
        new_available_minor: i64,
        expected_version: i64,
    ) -> Result<u64, StorageError> {
        match self.guard.balances.get_mut(account_id) {
            Some(b) if b.version == expected_version => {
                b.available_minor = new_available_minor;
                b.version += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }
}

#[async_trait]
impl PaymentsWriter for FakeTx {
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StorageError> {
        self.guard
            .payments
            .insert(payment.id.clone(), payment.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerWriter for FakeTx {
    async fn insert_ledger_entries(
        &mut self,
        debit: &LedgerEntry,
        credit: &LedgerEntry,
    ) -> Result<(), StorageError> {
        self.guard.ledger.push(debit.clone());
        self.guard.ledger.push(credit.clone());
        Ok(())
    }
}

#[async_trait]
impl IdempotencyWriter for FakeTx {
    async fn claim_idempotency_key(
        &mut self,
        key: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<IdempotencyClaim, StorageError> {
        let now = Utc::now();
        match self.guard.idempotency.get(key) {
            Some(existing) if existing.expires_at > now => {
                Ok(IdempotencyClaim::Existing(existing.clone()))
            }
            _ => {
                self.guard.idempotency.insert(
                    key.to_string(),
                    IdempotencyRecord {
                        key: key.to_string(),
                        payment_id: None,
                        response_snapshot: None,
                        status: IdempotencyStatus::Pending,
                        created_at: now,
                        expires_at,
                    },
                );
                Ok(IdempotencyClaim::Claimed)
            }
        }
    }

    async fn complete_idempotency_key(
        &mut self,
        key: &str,
        status: IdempotencyStatus,
        payment_id: Option<&str>,
        response_snapshot: &serde_json::Value,
    ) -> Result<(), StorageError> {
        if let Some(record) = self.guard.idempotency.get_mut(key) {
            if matches!(record.status, IdempotencyStatus::Pending) {
                record.status = status;
                record.payment_id = payment_id.map(|s| s.to_string());
                record.response_snapshot = Some(response_snapshot.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxWriter for FakeTx {
    async fn insert_outbox_record(&mut self, record: &OutboxRecord) -> Result<(), StorageError> {
        self.guard.outbox.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl Storage for FakeStorage {
    type Tx = FakeTx;

    async fn begin(&self) -> Result<Self::Tx, StorageError> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(FakeTx { guard, snapshot })
    }

    async fn commit(&self, _tx: Self::Tx) -> Result<(), StorageError> {
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Tx) -> Result<(), StorageError> {
        *tx.guard = tx.snapshot.clone();
        Ok(())
    }

    async fn get_account_balance(
        &self,
        account_id: &str,
    ) -> Result<Option<AccountBalance>, StorageError> {
        Ok(self.inner.lock().await.balances.get(account_id).cloned())
    }

    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StorageError> {
        Ok(self.inner.lock().await.payments.get(id).cloned())
    }
}

#[derive(Clone)]
pub struct FakeOutboxStore {
    inner: Arc<Mutex<Vec<OutboxRecord>>>,
}

impl FakeOutboxStore {
    pub fn from_storage(storage: &FakeStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(
                storage.inner.try_lock().map(|db| db.outbox.clone()).unwrap_or_default(),
            )),
        }
    }

    pub async fn push(&self, record: OutboxRecord) {
        self.inner.lock().await.push(record);
    }

    pub async fn snapshot(&self) -> Vec<OutboxRecord> {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl OutboxStore for FakeOutboxStore {
    async fn claim_pending(&self, batch_size: i64) -> Result<Vec<OutboxRecord>, StorageError> {
        let db = self.inner.lock().await;
        Ok(db
            .iter()
            .filter(|r| r.published_at.is_none())
            .take(batch_size as usize)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: &str) -> Result<(), StorageError> {
        let mut db = self.inner.lock().await;
        if let Some(r) = db.iter_mut().find(|r| r.id == id) {
            r.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn increment_retry(&self, id: &str) -> Result<(), StorageError> {
        let mut db = self.inner.lock().await;
        if let Some(r) = db.iter_mut().find(|r| r.id == id) {
            r.retry_count += 1;
        }
        Ok(())
    }

    async fn pending_depth(&self) -> Result<i64, StorageError> {
        let db = self.inner.lock().await;
        Ok(db.iter().filter(|r| r.published_at.is_none()).count() as i64)
    }
}

/// A broker stand-in that can be flipped offline mid-test (outbox
/// recovery scenarios) and records every message it actually accepted.
#[derive(Clone, Default)]
pub struct FlakyBus {
    up: Arc<std::sync::atomic::AtomicBool>,
    published: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
}

impl FlakyBus {
    pub fn new() -> Self {
        Self {
            up: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            published: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, std::sync::atomic::Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, String, Vec<u8>)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl event_bus::EventBus for FlakyBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> event_bus::BusResult<()> {
        self.publish_durable(subject, "", payload).await
    }

    async fn subscribe(
        &self,
        _subject: &str,
    ) -> event_bus::BusResult<futures::stream::BoxStream<'static, event_bus::BusMessage>> {
        unimplemented!("not exercised by these tests")
    }

    async fn publish_durable(
        &self,
        subject: &str,
        dedup_key: &str,
        payload: Vec<u8>,
    ) -> event_bus::BusResult<()> {
        if !self.up.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(event_bus::BusError::ConnectionError(
                "broker offline".to_string(),
            ));
        }
        self.published
            .lock()
            .await
            .push((subject.to_string(), dedup_key.to_string(), payload));
        Ok(())
    }
}

pub fn account(id: &str, currency: &str) -> Account {
    Account {
        id: id.to_string(),
        owner_id: format!("owner-{id}"),
        currency: currency.to_string(),
        status: payments_rs::domain::AccountStatus::Active,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn balance(account_id: &str, available_minor: i64, currency: &str) -> AccountBalance {
    AccountBalance {
        account_id: account_id.to_string(),
        available_minor,
        pending_minor: 0,
        currency: currency.to_string(),
        version: 1,
    }
}
