//! Credit ledger repository.
//!
//! A tenant's balance lives in `credit_balances` and always equals the sum of `remaining` over
//! its live allocations, which also equals `balance_after` of its latest transaction. Every
//! write locks the balance row first, then allocations, so concurrent writers for one tenant
//! serialize.

use crate::db::{
    errors::{DbError, Result},
    models::credits::{
        CreditAllocationDBResponse, CreditDebitDBRequest, CreditGrantDBRequest, CreditTransactionDBResponse,
        CreditTransactionType, DebitOutcome, ExpiredAllocation, RecordedTransaction,
    },
};
use crate::types::{AllocationId, TenantId, abbrev_uuid};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Filter for listing credit transactions
#[derive(Debug, Clone)]
pub struct CreditTransactionFilter {
    pub tenant_id: Option<TenantId>,
    pub skip: i64,
    pub limit: i64,
}

impl CreditTransactionFilter {
    pub fn new(tenant_id: Option<TenantId>, skip: i64, limit: i64) -> Self {
        Self { tenant_id, skip, limit }
    }
}

const TRANSACTION_COLUMNS: &str =
    "id, tenant_id, user_id, transaction_type, amount, balance_after, source_id, description, allocation_id, created_at";

const ALLOCATION_COLUMNS: &str =
    "id, tenant_id, allocation_type, amount, remaining, expires_at, expiry_warning_sent_at, expired_at, created_at";

pub struct Credits<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Credits<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Add credits to a tenant as a new allocation.
    ///
    /// Replaying a `source_id` returns the original transaction without touching the balance.
    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&request.tenant_id), amount = %request.amount, source_id = %request.source_id), err)]
    pub async fn grant(&mut self, request: &CreditGrantDBRequest) -> Result<RecordedTransaction> {
        if request.amount <= Decimal::ZERO {
            return Err(DbError::Other(anyhow::anyhow!("grant amount must be positive, got {}", request.amount)));
        }
        let allocation_type = request.transaction_type.allocation_type().ok_or_else(|| {
            DbError::Other(anyhow::anyhow!("{:?} is not a grant transaction type", request.transaction_type))
        })?;

        let mut tx = self.db.begin().await?;
        let balance = lock_balance(&mut tx, request.tenant_id).await?;

        if let Some(existing) = transaction_by_source(&mut tx, &request.source_id).await? {
            debug!("Grant already recorded, returning existing transaction");
            return Ok(RecordedTransaction {
                transaction: existing,
                replayed: true,
            });
        }

        let allocation_id = sqlx::query_scalar::<_, AllocationId>(
            r#"
            INSERT INTO credit_allocations (tenant_id, allocation_type, amount, remaining, expires_at)
            VALUES ($1, $2, $3, $3, $4)
            RETURNING id
            "#,
        )
        .bind(request.tenant_id)
        .bind(allocation_type)
        .bind(request.amount)
        .bind(request.expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let balance_after = balance + request.amount;
        store_balance(&mut tx, request.tenant_id, balance_after).await?;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                tenant_id: request.tenant_id,
                user_id: request.user_id,
                transaction_type: request.transaction_type,
                amount: request.amount,
                balance_after,
                source_id: &request.source_id,
                description: request.description.as_deref(),
                allocation_id: Some(allocation_id),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(RecordedTransaction {
            transaction,
            replayed: false,
        })
    }

    /// Remove credits from a tenant, draining allocations that expire soonest first.
    ///
    /// Allocations already past their expiry are expired first and never spent. Returns
    /// [`DebitOutcome::Insufficient`] without recording the debit when the balance is short.
    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&request.tenant_id), amount = %request.amount, source_id = %request.source_id), err)]
    pub async fn debit(&mut self, request: &CreditDebitDBRequest) -> Result<DebitOutcome> {
        if request.amount <= Decimal::ZERO {
            return Err(DbError::Other(anyhow::anyhow!("debit amount must be positive, got {}", request.amount)));
        }
        if request.transaction_type.is_credit() || request.transaction_type == CreditTransactionType::Expiry {
            return Err(DbError::Other(anyhow::anyhow!(
                "{:?} is not a debit transaction type",
                request.transaction_type
            )));
        }

        let mut tx = self.db.begin().await?;
        let balance = lock_balance(&mut tx, request.tenant_id).await?;

        if let Some(existing) = transaction_by_source(&mut tx, &request.source_id).await? {
            return Ok(DebitOutcome::Applied(RecordedTransaction {
                transaction: existing,
                replayed: true,
            }));
        }

        // Credits past their expiry are not spendable even if the sweep has not reached them yet
        let (balance, lapsed) = expire_lapsed_locked(&mut tx, request.tenant_id, balance, Utc::now()).await?;
        if !lapsed.is_empty() {
            debug!(count = lapsed.len(), "Expired lapsed allocations before debit");
        }

        if balance < request.amount {
            if !lapsed.is_empty() {
                tx.commit().await?;
            }
            return Ok(DebitOutcome::Insufficient { available: balance });
        }

        let allocations = sqlx::query_as::<_, (AllocationId, Decimal)>(
            r#"
            SELECT id, remaining FROM credit_allocations
            WHERE tenant_id = $1 AND expired_at IS NULL AND remaining > 0
            ORDER BY expires_at ASC NULLS LAST, created_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(request.tenant_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut outstanding = request.amount;
        let mut touched = Vec::new();
        for (allocation_id, remaining) in allocations {
            if outstanding.is_zero() {
                break;
            }
            let take = remaining.min(outstanding);
            sqlx::query("UPDATE credit_allocations SET remaining = remaining - $2 WHERE id = $1")
                .bind(allocation_id)
                .bind(take)
                .execute(&mut *tx)
                .await?;
            outstanding -= take;
            touched.push(allocation_id);
        }

        if !outstanding.is_zero() {
            return Err(DbError::Other(anyhow::anyhow!(
                "allocations for tenant {} cover less than the recorded balance {}",
                request.tenant_id,
                balance
            )));
        }

        let balance_after = balance - request.amount;
        store_balance(&mut tx, request.tenant_id, balance_after).await?;

        let transaction = insert_transaction(
            &mut tx,
            NewTransaction {
                tenant_id: request.tenant_id,
                user_id: request.user_id,
                transaction_type: request.transaction_type,
                amount: request.amount,
                balance_after,
                source_id: &request.source_id,
                description: request.description.as_deref(),
                allocation_id: if touched.len() == 1 { touched.first().copied() } else { None },
            },
        )
        .await?;

        tx.commit().await?;
        Ok(DebitOutcome::Applied(RecordedTransaction {
            transaction,
            replayed: false,
        }))
    }

    /// Expire every live allocation of a tenant whose expiry is at or before `now`, in one
    /// transaction. Each one with credits left gets an `expiry` transaction.
    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn expire_lapsed(&mut self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Vec<ExpiredAllocation>> {
        let mut tx = self.db.begin().await?;
        let balance = lock_balance(&mut tx, tenant_id).await?;
        let (_, expired) = expire_lapsed_locked(&mut tx, tenant_id, balance, now).await?;
        tx.commit().await?;
        Ok(expired)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn balance(&mut self, tenant_id: TenantId) -> Result<Decimal> {
        let balance = sqlx::query_scalar::<_, Decimal>("SELECT balance FROM credit_balances WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Balances for many tenants; tenants without a ledger are absent from the map.
    #[instrument(skip(self, tenant_ids), fields(count = tenant_ids.len()), err)]
    pub async fn balances(&mut self, tenant_ids: &[TenantId]) -> Result<HashMap<TenantId, Decimal>> {
        let rows = sqlx::query_as::<_, (TenantId, Decimal)>("SELECT tenant_id, balance FROM credit_balances WHERE tenant_id = ANY($1)")
            .bind(tenant_ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    pub async fn list_transactions(&mut self, filter: &CreditTransactionFilter) -> Result<Vec<CreditTransactionDBResponse>> {
        let transactions = sqlx::query_as::<_, CreditTransactionDBResponse>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM credit_transactions
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.tenant_id)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(transactions)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count_transactions(&mut self, filter: &CreditTransactionFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM credit_transactions WHERE ($1::uuid IS NULL OR tenant_id = $1)")
            .bind(filter.tenant_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    pub async fn get_transaction_by_source(&mut self, source_id: &str) -> Result<Option<CreditTransactionDBResponse>> {
        transaction_by_source(&mut *self.db, source_id).await
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn list_allocations(&mut self, tenant_id: TenantId, include_expired: bool) -> Result<Vec<CreditAllocationDBResponse>> {
        let allocations = sqlx::query_as::<_, CreditAllocationDBResponse>(&format!(
            r#"
            SELECT {ALLOCATION_COLUMNS} FROM credit_allocations
            WHERE tenant_id = $1 AND ($2 OR expired_at IS NULL)
            ORDER BY expires_at ASC NULLS LAST, created_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(include_expired)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(allocations)
    }

    /// Live allocations whose expiry has passed.
    #[instrument(skip(self), err)]
    pub async fn list_due_for_expiry(&mut self, now: DateTime<Utc>) -> Result<Vec<CreditAllocationDBResponse>> {
        let allocations = sqlx::query_as::<_, CreditAllocationDBResponse>(&format!(
            r#"
            SELECT {ALLOCATION_COLUMNS} FROM credit_allocations
            WHERE expired_at IS NULL AND expires_at IS NOT NULL AND expires_at <= $1
            ORDER BY expires_at ASC
            "#
        ))
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(allocations)
    }

    /// Live allocations with credits left that expire in `(now, until]` and have not been warned about.
    #[instrument(skip(self), err)]
    pub async fn list_expiring_unwarned(&mut self, now: DateTime<Utc>, until: DateTime<Utc>) -> Result<Vec<CreditAllocationDBResponse>> {
        let allocations = sqlx::query_as::<_, CreditAllocationDBResponse>(&format!(
            r#"
            SELECT {ALLOCATION_COLUMNS} FROM credit_allocations
            WHERE expired_at IS NULL
              AND remaining > 0
              AND expiry_warning_sent_at IS NULL
              AND expires_at > $1 AND expires_at <= $2
            ORDER BY tenant_id, expires_at ASC
            "#
        ))
        .bind(now)
        .bind(until)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(allocations)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    pub async fn mark_warning_sent(&mut self, ids: &[AllocationId], at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("UPDATE credit_allocations SET expiry_warning_sent_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    pub async fn count_expired_allocations_before(&mut self, cutoff: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM credit_allocations WHERE expired_at IS NOT NULL AND expired_at < $1")
            .bind(cutoff)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_expired_allocations_before(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credit_allocations WHERE expired_at IS NOT NULL AND expired_at < $1")
            .bind(cutoff)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Lock the tenant's balance row, creating it at zero on first use.
async fn lock_balance(conn: &mut PgConnection, tenant_id: TenantId) -> Result<Decimal> {
    sqlx::query("INSERT INTO credit_balances (tenant_id) VALUES ($1) ON CONFLICT (tenant_id) DO NOTHING")
        .bind(tenant_id)
        .execute(&mut *conn)
        .await?;
    let balance = sqlx::query_scalar::<_, Decimal>("SELECT balance FROM credit_balances WHERE tenant_id = $1 FOR UPDATE")
        .bind(tenant_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(balance)
}

/// Expire lapsed allocations while the caller holds the tenant's balance lock.
///
/// Returns the balance after the expiries.
async fn expire_lapsed_locked(
    conn: &mut PgConnection,
    tenant_id: TenantId,
    mut balance: Decimal,
    now: DateTime<Utc>,
) -> Result<(Decimal, Vec<ExpiredAllocation>)> {
    let lapsed = sqlx::query_as::<_, (AllocationId, Decimal)>(
        r#"
        SELECT id, remaining FROM credit_allocations
        WHERE tenant_id = $1 AND expired_at IS NULL AND expires_at IS NOT NULL AND expires_at <= $2
        ORDER BY expires_at ASC, created_at ASC, id ASC
        FOR UPDATE
        "#,
    )
    .bind(tenant_id)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?;

    let mut expired = Vec::with_capacity(lapsed.len());
    for (allocation_id, remaining) in lapsed {
        let transaction = if remaining > Decimal::ZERO {
            balance = (balance - remaining).max(Decimal::ZERO);
            store_balance(conn, tenant_id, balance).await?;
            let source_id = format!("expiry:{allocation_id}");
            Some(
                insert_transaction(
                    conn,
                    NewTransaction {
                        tenant_id,
                        user_id: None,
                        transaction_type: CreditTransactionType::Expiry,
                        amount: remaining,
                        balance_after: balance,
                        source_id: &source_id,
                        description: Some("Credits expired"),
                        allocation_id: Some(allocation_id),
                    },
                )
                .await?,
            )
        } else {
            None
        };

        sqlx::query("UPDATE credit_allocations SET remaining = 0, expired_at = $2 WHERE id = $1")
            .bind(allocation_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;

        expired.push(ExpiredAllocation {
            allocation_id,
            tenant_id,
            expired_amount: remaining,
            transaction,
        });
    }
    Ok((balance, expired))
}

async fn store_balance(conn: &mut PgConnection, tenant_id: TenantId, balance: Decimal) -> Result<()> {
    sqlx::query("UPDATE credit_balances SET balance = $2, updated_at = NOW() WHERE tenant_id = $1")
        .bind(tenant_id)
        .bind(balance)
        .execute(conn)
        .await?;
    Ok(())
}

async fn transaction_by_source(conn: &mut PgConnection, source_id: &str) -> Result<Option<CreditTransactionDBResponse>> {
    let transaction = sqlx::query_as::<_, CreditTransactionDBResponse>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE source_id = $1"
    ))
    .bind(source_id)
    .fetch_optional(conn)
    .await?;
    Ok(transaction)
}

struct NewTransaction<'a> {
    tenant_id: TenantId,
    user_id: Option<crate::types::UserId>,
    transaction_type: CreditTransactionType,
    amount: Decimal,
    balance_after: Decimal,
    source_id: &'a str,
    description: Option<&'a str>,
    allocation_id: Option<AllocationId>,
}

async fn insert_transaction(conn: &mut PgConnection, new: NewTransaction<'_>) -> Result<CreditTransactionDBResponse> {
    let transaction = sqlx::query_as::<_, CreditTransactionDBResponse>(&format!(
        r#"
        INSERT INTO credit_transactions
            (tenant_id, user_id, transaction_type, amount, balance_after, source_id, description, allocation_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(new.tenant_id)
    .bind(new.user_id)
    .bind(new.transaction_type)
    .bind(new.amount)
    .bind(new.balance_after)
    .bind(new.source_id)
    .bind(new.description)
    .bind(new.allocation_id)
    .fetch_one(conn)
    .await?;
    Ok(transaction)
}
