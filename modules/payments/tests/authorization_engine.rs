//! Authorization protocol scenarios against the in-memory storage fake.
//! Exercises `AuthorizationEngine` exactly as a transport handler would,
//! with no mocking of its internals.

mod common;

use common::{account, balance, FakeStorage};
use payments_rs::domain::{IdempotencyStatus, LedgerEntryType, PaymentStatus};
use payments_rs::engine::{AuthorizationEngine, AuthorizeCommand, DeclineReason, OutwardStatus};

fn cmd(idempotency_key: &str, payer: &str, payee: &str, amount_minor: i64) -> AuthorizeCommand {
    AuthorizeCommand {
        idempotency_key: idempotency_key.to_string(),
        payer_account_id: payer.to_string(),
        payee_account_id: payee.to_string(),
        amount_minor,
        currency: "USD".to_string(),
        description: None,
    }
}

async fn seeded_engine(payer_minor: i64, payee_minor: i64) -> (AuthorizationEngine<FakeStorage>, FakeStorage) {
    let storage = FakeStorage::new();
    storage
        .seed_account(account("acct-payer", "USD"), balance("acct-payer", payer_minor, "USD"))
        .await;
    storage
        .seed_account(account("acct-payee", "USD"), balance("acct-payee", payee_minor, "USD"))
        .await;
    let engine = AuthorizationEngine::new(storage.clone());
    (engine, storage)
}

#[tokio::test]
async fn s1_happy_path_moves_funds_and_writes_two_ledger_entries() {
    let (engine, storage) = seeded_engine(10_000, 0).await;

    let outcome = engine
        .authorize(cmd("key-1", "acct-payer", "acct-payee", 2_500))
        .await
        .expect("no transient failure")
        .expect("no invalid argument");

    assert_eq!(outcome.status, OutwardStatus::Authorized);

    let payer_balance = storage.balance("acct-payer").await.unwrap();
    let payee_balance = storage.balance("acct-payee").await.unwrap();
    assert_eq!(payer_balance.available_minor, 7_500);
    assert_eq!(payee_balance.available_minor, 2_500);
    assert_eq!(payer_balance.version, 2);
    assert_eq!(payee_balance.version, 2);

    let entries = storage.ledger_for(&outcome.payment_id).await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().any(|e| e.entry_type == LedgerEntryType::Debit
        && e.account_id == "acct-payer"
        && e.amount_minor == 2_500));
    assert!(entries.iter().any(|e| e.entry_type == LedgerEntryType::Credit
        && e.account_id == "acct-payee"
        && e.amount_minor == 2_500));

    let events = storage.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "PaymentAuthorized");

    let payment = storage.get_payment_for_test(&outcome.payment_id).await;
    assert_eq!(payment.status, PaymentStatus::Authorized);
}

#[tokio::test]
async fn s2_duplicate_replay_returns_same_payment_id_without_double_moving_funds() {
    let (engine, storage) = seeded_engine(10_000, 0).await;

    let first = engine
        .authorize(cmd("key-dup", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();
    let second = engine
        .authorize(cmd("key-dup", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(second.status, OutwardStatus::Duplicate);
    assert_eq!(second.payment_id, first.payment_id);

    let payer_balance = storage.balance("acct-payer").await.unwrap();
    assert_eq!(payer_balance.available_minor, 9_000, "funds must move exactly once");
    assert_eq!(storage.outbox_events().await.len(), 1);
}

#[tokio::test]
async fn s3_insufficient_funds_declines_without_moving_balances() {
    let (engine, storage) = seeded_engine(500, 0).await;

    let outcome = engine
        .authorize(cmd("key-3", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, OutwardStatus::Declined);
    assert_eq!(outcome.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));

    let payer_balance = storage.balance("acct-payer").await.unwrap();
    let payee_balance = storage.balance("acct-payee").await.unwrap();
    assert_eq!(payer_balance.available_minor, 500);
    assert_eq!(payee_balance.available_minor, 0);
    assert!(storage.ledger_for(&outcome.payment_id).await.is_empty());

    // A decline still gets exactly one outbox event (PaymentDeclined).
    let events = storage.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "PaymentDeclined");
}

#[tokio::test]
async fn declining_a_key_replays_the_same_decline_not_a_duplicate() {
    let (engine, _storage) = seeded_engine(500, 0).await;

    let first = engine
        .authorize(cmd("key-decline-replay", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();
    let second = engine
        .authorize(cmd("key-decline-replay", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.status, OutwardStatus::Declined);
    assert_eq!(second.status, OutwardStatus::Declined);
    assert_eq!(second.error_code, first.error_code);
    assert_eq!(second.payment_id, first.payment_id);
}

#[tokio::test]
async fn s4_same_account_is_declined_before_any_lock_is_taken() {
    let (engine, storage) = seeded_engine(10_000, 0).await;

    let outcome = engine
        .authorize(cmd("key-4", "acct-payer", "acct-payer", 100))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, OutwardStatus::Declined);
    assert_eq!(outcome.error_code.as_deref(), Some("SAME_ACCOUNT"));
    assert_eq!(storage.balance("acct-payer").await.unwrap().available_minor, 10_000);
}

#[tokio::test]
async fn unknown_account_is_declined_as_account_not_found() {
    let (engine, _storage) = seeded_engine(10_000, 0).await;

    let outcome = engine
        .authorize(cmd("key-5", "acct-payer", "acct-ghost", 100))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, OutwardStatus::Declined);
    assert_eq!(outcome.error_code.as_deref(), Some("ACCOUNT_NOT_FOUND"));
}

#[tokio::test]
async fn currency_mismatch_between_account_and_command_is_declined() {
    let storage = FakeStorage::new();
    storage
        .seed_account(account("acct-payer", "USD"), balance("acct-payer", 10_000, "USD"))
        .await;
    storage
        .seed_account(account("acct-payee", "EUR"), balance("acct-payee", 0, "EUR"))
        .await;
    let engine = AuthorizationEngine::new(storage);

    let outcome = engine
        .authorize(cmd("key-6", "acct-payer", "acct-payee", 100))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.status, OutwardStatus::Declined);
    assert_eq!(outcome.error_code.as_deref(), Some("CURRENCY_MISMATCH"));
}

#[tokio::test]
async fn non_positive_amount_is_rejected_as_a_decline_not_invalid_argument() {
    let (engine, _storage) = seeded_engine(10_000, 0).await;

    let outcome = engine
        .authorize(cmd("key-7", "acct-payer", "acct-payee", 0))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.error_code.as_deref(), Some("INVALID_AMOUNT"));
}

#[tokio::test]
async fn empty_idempotency_key_is_rejected_at_request_validation() {
    let (engine, _storage) = seeded_engine(10_000, 0).await;

    let result = engine
        .authorize(cmd("", "acct-payer", "acct-payee", 100))
        .await
        .unwrap();

    assert!(result.is_err());
}

#[tokio::test]
async fn s5_concurrent_authorizations_never_overdraw_the_payer() {
    let storage = FakeStorage::new();
    storage
        .seed_account(account("acct-payer", "USD"), balance("acct-payer", 1_000, "USD"))
        .await;
    storage
        .seed_account(account("acct-payee", "USD"), balance("acct-payee", 0, "USD"))
        .await;
    let engine = std::sync::Arc::new(AuthorizationEngine::new(storage.clone()));

    let mut handles = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .authorize(cmd(&format!("concurrent-{i}"), "acct-payer", "acct-payee", 300))
                .await
                .unwrap()
                .unwrap()
        }));
    }

    let mut authorized = 0;
    for h in handles {
        let outcome = h.await.unwrap();
        if outcome.status == OutwardStatus::Authorized {
            authorized += 1;
        }
    }

    // 1000 / 300 = 3 with remainder, never a 4th.
    assert_eq!(authorized, 3);
    let payer_balance = storage.balance("acct-payer").await.unwrap();
    assert!(payer_balance.available_minor >= 0);
    assert_eq!(payer_balance.available_minor, 1_000 - authorized * 300);
}

#[tokio::test]
async fn idempotency_record_status_matches_payment_outcome() {
    let (engine, storage) = seeded_engine(10_000, 0).await;

    let outcome = engine
        .authorize(cmd("key-status", "acct-payer", "acct-payee", 100))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, OutwardStatus::Authorized);
    assert_eq!(
        storage.idempotency_status_for_test("key-status").await,
        Some(IdempotencyStatus::Completed)
    );

    let (engine2, storage2) = seeded_engine(50, 0).await;
    let declined = engine2
        .authorize(cmd("key-status-2", "acct-payer", "acct-payee", 1_000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(declined.status, OutwardStatus::Declined);
    assert_eq!(
        storage2.idempotency_status_for_test("key-status-2").await,
        Some(IdempotencyStatus::Failed)
    );
}

#[allow(dead_code)]
fn decline_reason_codes_are_distinct() {
    // Compile-time reminder: if a new DeclineReason variant is added this
    // still needs a dedicated scenario above.
    let _ = DeclineReason::AccountNotFound;
}
