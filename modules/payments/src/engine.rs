//! Authorization engine.
//!
//! `AuthorizationEngine<S>` is generic over `Storage`. It never touches
//! `sqlx` directly. One call to `authorize` executes the full protocol:
//! request validation, idempotency claim/replay, the six domain checks
//! (re-checked under lock), the double-entry ledger write, and the
//! outbox enqueue, all inside one transaction that commits or rolls back
//! as a unit.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::domain::{
    Account, IdempotencyStatus, LedgerEntry, LedgerEntryType, OutboxRecord, Payment,
    PaymentStatus, IDEMPOTENCY_TTL,
};
use crate::errors::{InvalidArgument, TransientFailure};
use crate::ids::IdGenerator;
use crate::storage::{IdempotencyClaim, Storage};

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeCommand {
    pub idempotency_key: String,
    pub payer_account_id: String,
    pub payee_account_id: String,
    pub amount_minor: i64,
    pub currency: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    AccountNotFound,
    CurrencyMismatch,
    InvalidAmount,
    SameAccount,
    InsufficientFunds,
}

impl DeclineReason {
    fn code(self) -> &'static str {
        match self {
            DeclineReason::AccountNotFound => "ACCOUNT_NOT_FOUND",
            DeclineReason::CurrencyMismatch => "CURRENCY_MISMATCH",
            DeclineReason::InvalidAmount => "INVALID_AMOUNT",
            DeclineReason::SameAccount => "SAME_ACCOUNT",
            DeclineReason::InsufficientFunds => "INSUFFICIENT_FUNDS",
        }
    }

    fn message(self) -> &'static str {
        match self {
            DeclineReason::AccountNotFound => "payer or payee account does not exist or is not active",
            DeclineReason::CurrencyMismatch => "payment currency does not match account currency",
            DeclineReason::InvalidAmount => "amount must be a positive integer of minor units",
            DeclineReason::SameAccount => "payer and payee account must differ",
            DeclineReason::InsufficientFunds => "payer has insufficient available balance",
        }
    }
}

/// Outward-facing result of `Authorize`. Distinct from
/// `domain::PaymentStatus`: `Duplicate` is never persisted, it only ever
/// appears in a response to a replayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutwardStatus {
    Authorized,
    Declined,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeOutcome {
    pub payment_id: String,
    pub status: OutwardStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

pub struct AuthorizationEngine<S: Storage> {
    storage: S,
    ids: IdGenerator,
    idempotency_ttl: chrono::Duration,
}

impl<S: Storage> AuthorizationEngine<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            ids: IdGenerator::new(),
            idempotency_ttl: IDEMPOTENCY_TTL,
        }
    }

    /// Overrides the default 24h idempotency key lifetime with the
    /// configured value (`idempotency_ttl`).
    pub fn with_idempotency_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Request-level validation, rejected before any storage call,
    /// distinct from a domain decline.
    fn validate_request(cmd: &AuthorizeCommand) -> Result<(), InvalidArgument> {
        if cmd.idempotency_key.trim().is_empty() {
            return Err(InvalidArgument("idempotency_key must not be empty".into()));
        }
        if cmd.payer_account_id.trim().is_empty() || cmd.payee_account_id.trim().is_empty() {
            return Err(InvalidArgument("account ids must not be empty".into()));
        }
        if cmd.currency.trim().is_empty() {
            return Err(InvalidArgument("currency must not be empty".into()));
        }
        Ok(())
    }

    /// Domain validations 1-5: amount, same-account, account
    /// existence/status, currency match. Validation 6 (balance) is
    /// checked separately, twice, once plainly and once under lock.
    fn check_domain(
        payer: Option<&Account>,
        payee: Option<&Account>,
        cmd: &AuthorizeCommand,
    ) -> Result<(), DeclineReason> {
        if cmd.amount_minor <= 0 {
            return Err(DeclineReason::InvalidAmount);
        }
        if cmd.payer_account_id == cmd.payee_account_id {
            return Err(DeclineReason::SameAccount);
        }
        let payer = payer.ok_or(DeclineReason::AccountNotFound)?;
        if !payer.is_active() {
            return Err(DeclineReason::AccountNotFound);
        }
        let payee = payee.ok_or(DeclineReason::AccountNotFound)?;
        if !payee.is_active() {
            return Err(DeclineReason::AccountNotFound);
        }
        if payer.currency != cmd.currency || payee.currency != cmd.currency {
            return Err(DeclineReason::CurrencyMismatch);
        }
        Ok(())
    }

    pub async fn authorize(
        &self,
        cmd: AuthorizeCommand,
    ) -> Result<Result<AuthorizeOutcome, InvalidArgument>, TransientFailure> {
        if let Err(e) = Self::validate_request(&cmd) {
            return Ok(Err(e));
        }

        let mut tx = self.storage.begin().await?;
        let expires_at = Utc::now() + self.idempotency_ttl;

        let claim = tx
            .claim_idempotency_key(&cmd.idempotency_key, expires_at)
            .await?;

        if let IdempotencyClaim::Existing(record) = claim {
            self.storage.rollback(tx).await?;
            return match record.status {
                IdempotencyStatus::Pending => {
                    // A concurrent request with the same key is still in
                    // flight. The caller retries; this is not a storage
                    // failure.
                    Err(TransientFailure {
                        reason: "idempotency key is already being processed".into(),
                    })
                }
                IdempotencyStatus::Completed => {
                    // A prior AUTHORIZED outcome: report DUPLICATE with
                    // the original payment_id.
                    Ok(Ok(AuthorizeOutcome {
                        payment_id: record.payment_id.clone().unwrap_or_default(),
                        status: OutwardStatus::Duplicate,
                        error_code: None,
                        error_message: None,
                    }))
                }
                IdempotencyStatus::Failed => {
                    // A prior DECLINED outcome: replay the same decline,
                    // not DUPLICATE.
                    let outcome = record
                        .response_snapshot
                        .as_ref()
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or(AuthorizeOutcome {
                            payment_id: record.payment_id.clone().unwrap_or_default(),
                            status: OutwardStatus::Declined,
                            error_code: None,
                            error_message: None,
                        });
                    Ok(Ok(outcome))
                }
            };
        }

        // Canonical lock ordering: always lock the lexicographically
        // smaller account id first, regardless of payer/payee role, so
        // two payments between the same pair of accounts in opposite
        // directions can never deadlock.
        let (first_id, second_id) = if cmd.payer_account_id <= cmd.payee_account_id {
            (cmd.payer_account_id.clone(), cmd.payee_account_id.clone())
        } else {
            (cmd.payee_account_id.clone(), cmd.payer_account_id.clone())
        };

        let payer = tx.get_account(&cmd.payer_account_id).await?;
        let payee = tx.get_account(&cmd.payee_account_id).await?;

        if let Err(reason) = Self::check_domain(payer.as_ref(), payee.as_ref(), &cmd) {
            return self.decline(tx, cmd, reason).await;
        }

        let first_balance = match tx.lock_balance_for_update(&first_id).await? {
            Some(b) => b,
            None => return self.decline(tx, cmd, DeclineReason::AccountNotFound).await,
        };
        let second_balance = if second_id == first_id {
            first_balance.clone()
        } else {
            match tx.lock_balance_for_update(&second_id).await? {
                Some(b) => b,
                None => return self.decline(tx, cmd, DeclineReason::AccountNotFound).await,
            }
        };

        let (payer_balance, payee_balance) = if first_id == cmd.payer_account_id {
            (first_balance, second_balance)
        } else {
            (second_balance, first_balance)
        };

        // Validation 6, re-checked under lock. Mandatory: defends
        // against races between the plain read above and lock
        // acquisition.
        if payer_balance.available_minor < cmd.amount_minor {
            return self
                .decline(tx, cmd, DeclineReason::InsufficientFunds)
                .await;
        }

        let payment_id = self.ids.next().to_string();
        let now = Utc::now();

        let new_payer_available = payer_balance.available_minor - cmd.amount_minor;
        let affected = tx
            .update_balance(
                &cmd.payer_account_id,
                new_payer_available,
                payer_balance.version,
            )
            .await?;
        if affected != 1 {
            self.storage.rollback(tx).await?;
            return Err(TransientFailure {
                reason: "concurrent update to payer balance, retry".into(),
            });
        }

        let new_payee_available = payee_balance.available_minor + cmd.amount_minor;
        let affected = tx
            .update_balance(
                &cmd.payee_account_id,
                new_payee_available,
                payee_balance.version,
            )
            .await?;
        if affected != 1 {
            self.storage.rollback(tx).await?;
            return Err(TransientFailure {
                reason: "concurrent update to payee balance, retry".into(),
            });
        }

        let payment = Payment {
            id: payment_id.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            payer_account_id: cmd.payer_account_id.clone(),
            payee_account_id: cmd.payee_account_id.clone(),
            amount_minor: cmd.amount_minor,
            currency: cmd.currency.clone(),
            status: PaymentStatus::Authorized,
            description: cmd.description.clone(),
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        tx.insert_payment(&payment).await?;

        // Debit first, credit second: fixed order so the pair is always
        // read back in the same order for any given payment.
        let debit = LedgerEntry {
            id: self.ids.next().to_string(),
            payment_id: payment_id.clone(),
            account_id: cmd.payer_account_id.clone(),
            entry_type: LedgerEntryType::Debit,
            amount_minor: cmd.amount_minor,
            currency: cmd.currency.clone(),
            balance_after_minor: new_payer_available,
            created_at: now,
        };
        let credit = LedgerEntry {
            id: self.ids.next().to_string(),
            payment_id: payment_id.clone(),
            account_id: cmd.payee_account_id.clone(),
            entry_type: LedgerEntryType::Credit,
            amount_minor: cmd.amount_minor,
            currency: cmd.currency.clone(),
            balance_after_minor: new_payee_available,
            created_at: now,
        };
        tx.insert_ledger_entries(&debit, &credit).await?;

        let outcome = AuthorizeOutcome {
            payment_id: payment_id.clone(),
            status: OutwardStatus::Authorized,
            error_code: None,
            error_message: None,
        };

        let outbox_record = OutboxRecord {
            id: self.ids.next().to_string(),
            aggregate_type: "Payment".into(),
            aggregate_id: payment_id.clone(),
            event_type: "PaymentAuthorized".into(),
            payload: json!({
                "payment_id": payment_id,
                "payer_account_id": cmd.payer_account_id,
                "payee_account_id": cmd.payee_account_id,
                "amount_minor": cmd.amount_minor,
                "currency": cmd.currency,
            }),
            created_at: now,
            published_at: None,
            retry_count: 0,
        };
        tx.insert_outbox_record(&outbox_record).await?;

        let snapshot = serde_json::to_value(&outcome).map_err(|e| TransientFailure {
            reason: format!("failed to serialize idempotency response snapshot: {e}"),
        })?;
        tx.complete_idempotency_key(
            &cmd.idempotency_key,
            IdempotencyStatus::Completed,
            Some(&payment_id),
            &snapshot,
        )
        .await?;

        self.storage.commit(tx).await?;
        info!(payment_id = %outcome.payment_id, "payment authorized");

        Ok(Ok(outcome))
    }

    /// The decline path: a fully committed outcome, not a rollback. The
    /// idempotency record is marked FAILED, not COMPLETED (see
    /// DESIGN.md), so a replay takes the FAILED branch above and returns
    /// the same decline rather than a DUPLICATE-wrapped one.
    async fn decline(
        &self,
        mut tx: S::Tx,
        cmd: AuthorizeCommand,
        reason: DeclineReason,
    ) -> Result<Result<AuthorizeOutcome, InvalidArgument>, TransientFailure> {
        let payment_id = self.ids.next().to_string();
        let now = Utc::now();

        let payment = Payment {
            id: payment_id.clone(),
            idempotency_key: cmd.idempotency_key.clone(),
            payer_account_id: cmd.payer_account_id.clone(),
            payee_account_id: cmd.payee_account_id.clone(),
            amount_minor: cmd.amount_minor,
            currency: cmd.currency.clone(),
            status: PaymentStatus::Declined,
            description: cmd.description.clone(),
            error_code: Some(reason.code().to_string()),
            error_message: Some(reason.message().to_string()),
            created_at: now,
            updated_at: now,
        };
        tx.insert_payment(&payment).await?;

        let outcome = AuthorizeOutcome {
            payment_id: payment_id.clone(),
            status: OutwardStatus::Declined,
            error_code: Some(reason.code().to_string()),
            error_message: Some(reason.message().to_string()),
        };

        let outbox_record = OutboxRecord {
            id: self.ids.next().to_string(),
            aggregate_type: "Payment".into(),
            aggregate_id: payment_id.clone(),
            event_type: "PaymentDeclined".into(),
            payload: json!({
                "payment_id": payment_id,
                "error_code": reason.code(),
                "error_message": reason.message(),
            }),
            created_at: now,
            published_at: None,
            retry_count: 0,
        };
        tx.insert_outbox_record(&outbox_record).await?;

        let snapshot = serde_json::to_value(&outcome).map_err(|e| TransientFailure {
            reason: format!("failed to serialize idempotency response snapshot: {e}"),
        })?;
        tx.complete_idempotency_key(
            &cmd.idempotency_key,
            IdempotencyStatus::Failed,
            Some(&payment_id),
            &snapshot,
        )
        .await?;

        self.storage.commit(tx).await?;
        warn!(payment_id = %outcome.payment_id, reason = reason.code(), "payment declined");

        Ok(Ok(outcome))
    }
}
